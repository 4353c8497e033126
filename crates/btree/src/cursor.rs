use std::sync::Arc;

use storage::Result;

use crate::map::MvMap;
use crate::page::Page;
use crate::types::DataType;

/// Forward iterator over a map, bound to the tree snapshot it was opened
/// on: entries inserted or removed afterwards are not observed.
///
/// The cursor keeps a chain of `(page, child index)` frames down to the
/// current leaf, descending leftmost and ascending when a page is
/// exhausted.
pub struct Cursor<K: DataType, V: DataType> {
    map: MvMap<K, V>,
    stack: Vec<(Arc<Page<K, V>>, usize)>,
    leaf: Option<(Arc<Page<K, V>>, usize)>,
    peeked: Option<(K::Value, V::Value)>,
}

impl<K: DataType, V: DataType> Cursor<K, V> {
    pub(crate) fn new(
        map: MvMap<K, V>,
        root: Arc<Page<K, V>>,
        from: Option<&K::Value>,
    ) -> Result<Cursor<K, V>> {
        let mut cursor = Cursor {
            map,
            stack: Vec::new(),
            leaf: None,
            peeked: None,
        };
        cursor.descend(root, from)?;
        Ok(cursor)
    }

    fn descend(&mut self, mut page: Arc<Page<K, V>>, from: Option<&K::Value>) -> Result<()> {
        let key_type = self.map.key_type().clone();
        loop {
            if page.is_leaf() {
                let index = match from {
                    None => 0,
                    Some(key) => match page.binary_search(key, &key_type) {
                        Ok(i) => i,
                        Err(i) => i,
                    },
                };
                self.leaf = Some((page, index));
                return Ok(());
            }
            let index = match from {
                None => 0,
                Some(key) => page.child_index(page.binary_search(key, &key_type)),
            };
            let child = self.map.read_child(&page, index)?;
            self.stack.push((page, index));
            page = child;
        }
    }

    fn fetch(&mut self) -> Result<Option<(K::Value, V::Value)>> {
        loop {
            if let Some((leaf, index)) = &mut self.leaf {
                if *index < leaf.key_count() {
                    let key = leaf.keys[*index].clone();
                    let value = leaf.values()[*index].clone();
                    *index += 1;
                    return Ok(Some((key, value)));
                }
            }
            // current leaf exhausted: ascend to the next unvisited child
            loop {
                let Some((node, index)) = self.stack.last_mut() else {
                    self.leaf = None;
                    return Ok(None);
                };
                *index += 1;
                if *index < node.children().len() {
                    let node = node.clone();
                    let index = *index;
                    let child = self.map.read_child(&node, index)?;
                    self.descend_leftmost(child)?;
                    break;
                }
                self.stack.pop();
            }
        }
    }

    fn descend_leftmost(&mut self, mut page: Arc<Page<K, V>>) -> Result<()> {
        loop {
            if page.is_leaf() {
                self.leaf = Some((page, 0));
                return Ok(());
            }
            let child = self.map.read_child(&page, 0)?;
            self.stack.push((page, 0));
            page = child;
        }
    }

    pub fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.fetch()?;
        }
        Ok(self.peeked.is_some())
    }

    pub fn next_entry(&mut self) -> Result<Option<(K::Value, V::Value)>> {
        if let Some(entry) = self.peeked.take() {
            return Ok(Some(entry));
        }
        self.fetch()
    }
}

impl<K: DataType, V: DataType> Iterator for Cursor<K, V> {
    type Item = Result<(K::Value, V::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
