use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::RwLock;

use crate::BLOCK_SIZE;
use crate::data_util::{format_header_map, format_hex_u64, header_u64, parse_header_map};
use crate::error::{Result, StoreError};

/// Supported write format of the store file.
pub const FORMAT_WRITE: u32 = 2;
/// Oldest read format this code still understands.
pub const FORMAT_READ: u32 = 2;

/// The store header, written twice at blocks 0 and 1. Both copies carry the
/// same ASCII `key:value` map; a torn write is detected by comparing them
/// and by the Fletcher32 checksum each copy embeds.
#[derive(Debug, Clone)]
pub struct StoreHeader {
    pub block_size: u32,
    pub format: u32,
    pub format_read: u32,
    /// Id of the newest chunk at the time the header was written.
    pub chunk: u32,
    /// Start block of that chunk.
    pub block: u64,
    /// Newest version at the time the header was written.
    pub version: u64,
    /// Creation timestamp, milliseconds.
    pub created: u64,
    /// Set on clean shutdown, cleared on the first write after open.
    pub clean: bool,
    /// Unrecognized keys, preserved on rewrite.
    pub other: BTreeMap<String, String>,
}

impl StoreHeader {
    pub fn new(created: u64) -> Self {
        StoreHeader {
            block_size: BLOCK_SIZE as u32,
            format: FORMAT_WRITE,
            format_read: FORMAT_READ,
            chunk: 0,
            block: 0,
            version: 0,
            created,
            clean: false,
            other: BTreeMap::new(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut map = self.other.clone();
        map.insert("H".into(), "2".into());
        map.insert("blockSize".into(), format_hex_u64(self.block_size as u64));
        map.insert("format".into(), format_hex_u64(self.format as u64));
        map.insert("formatRead".into(), format_hex_u64(self.format_read as u64));
        map.insert("chunk".into(), format_hex_u64(self.chunk as u64));
        map.insert("block".into(), format_hex_u64(self.block));
        map.insert("version".into(), format_hex_u64(self.version));
        map.insert("created".into(), format_hex_u64(self.created));
        if self.clean {
            map.insert("clean".into(), "1".into());
        } else {
            map.remove("clean");
        }
        let mut bytes = format_header_map(&map);
        assert!(bytes.len() <= BLOCK_SIZE, "store header exceeds one block");
        bytes.resize(BLOCK_SIZE, b' ');
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut map = parse_header_map(bytes)?;
        if map.get("H").map(String::as_str) != Some("2") {
            return Err(StoreError::FileCorrupt("missing store header tag".into()));
        }
        let block_size = header_u64(&map, "blockSize")? as u32;
        if block_size as usize != BLOCK_SIZE {
            return Err(StoreError::UnsupportedFormat(format!(
                "block size {block_size}"
            )));
        }
        let format = header_u64(&map, "format")? as u32;
        let format_read = map
            .get("formatRead")
            .map(|v| crate::data_util::parse_hex_u32(v))
            .transpose()?
            .unwrap_or(format);
        if format_read > FORMAT_WRITE {
            return Err(StoreError::UnsupportedFormat(format!(
                "read format {format_read}, supported up to {FORMAT_WRITE}"
            )));
        }
        let header = StoreHeader {
            block_size,
            format,
            format_read,
            chunk: header_u64(&map, "chunk")? as u32,
            block: header_u64(&map, "block")?,
            version: header_u64(&map, "version")?,
            created: header_u64(&map, "created")?,
            clean: map.remove("clean").is_some(),
            other: {
                for key in [
                    "H",
                    "blockSize",
                    "format",
                    "formatRead",
                    "chunk",
                    "block",
                    "version",
                    "created",
                ] {
                    map.remove(key);
                }
                map
            },
        };
        Ok(header)
    }
}

enum Backend {
    File(File),
    Mem(RwLock<Vec<u8>>),
}

/// The backing file. Writes go through `write_fully`, reads through
/// `read_fully`; both are offset-addressed so concurrent readers never
/// contend. An off-heap or encrypting backend would implement the same
/// contract.
pub struct FileStore {
    backend: Backend,
    file_name: Option<PathBuf>,
    read_only: bool,
}

impl FileStore {
    /// Open (creating if missing) and lock the backing file.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(|e| StoreError::ReadingFailed {
                context: format!("open {}", path.display()),
                source: e,
            })?;
        let locked = if read_only {
            fs2::FileExt::try_lock_shared(&file)
        } else {
            fs2::FileExt::try_lock_exclusive(&file)
        };
        if let Err(e) = locked {
            return Err(StoreError::FileLocked(format!("{}: {e}", path.display())));
        }
        Ok(FileStore {
            backend: Backend::File(file),
            file_name: Some(path.to_path_buf()),
            read_only,
        })
    }

    /// A store kept entirely in memory, for tests and transient data.
    pub fn in_memory() -> Self {
        FileStore {
            backend: Backend::Mem(RwLock::new(Vec::new())),
            file_name: None,
            read_only: false,
        }
    }

    pub fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> Result<u64> {
        match &self.backend {
            Backend::File(file) => file
                .metadata()
                .map(|m| m.len())
                .map_err(|e| StoreError::ReadingFailed {
                    context: "file metadata".into(),
                    source: e,
                }),
            Backend::Mem(mem) => Ok(mem.read().len() as u64),
        }
    }

    pub fn read_fully(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match &self.backend {
            Backend::File(file) => {
                read_at(file, &mut buf, offset).map_err(|e| StoreError::ReadingFailed {
                    context: format!("read {len} bytes at {offset}"),
                    source: e,
                })?;
            }
            Backend::Mem(mem) => {
                let mem = mem.read();
                let end = offset as usize + len;
                if end > mem.len() {
                    return Err(StoreError::ReadingFailed {
                        context: format!("read {len} bytes at {offset}"),
                        source: io::Error::from(io::ErrorKind::UnexpectedEof),
                    });
                }
                buf.copy_from_slice(&mem[offset as usize..end]);
            }
        }
        Ok(buf)
    }

    pub fn write_fully(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(StoreError::UnsupportedOperation(
                "write to a read-only store".into(),
            ));
        }
        match &self.backend {
            Backend::File(file) => {
                write_at(file, bytes, offset).map_err(|e| StoreError::WritingFailed {
                    context: format!("write {} bytes at {offset}", bytes.len()),
                    source: e,
                })
            }
            Backend::Mem(mem) => {
                let mut mem = mem.write();
                let end = offset as usize + bytes.len();
                if mem.len() < end {
                    mem.resize(end, 0);
                }
                mem[offset as usize..end].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    pub fn sync(&self) -> Result<()> {
        match &self.backend {
            Backend::File(file) => file.sync_data().map_err(|e| StoreError::WritingFailed {
                context: "sync".into(),
                source: e,
            }),
            Backend::Mem(_) => Ok(()),
        }
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        match &self.backend {
            Backend::File(file) => file.set_len(len).map_err(|e| StoreError::WritingFailed {
                context: format!("truncate to {len}"),
                source: e,
            }),
            Backend::Mem(mem) => {
                mem.write().truncate(len as usize);
                Ok(())
            }
        }
    }

    /// Write both store header copies.
    pub fn write_store_header(&self, header: &StoreHeader) -> Result<()> {
        let bytes = header.serialize();
        let mut both = Vec::with_capacity(BLOCK_SIZE * 2);
        both.extend_from_slice(&bytes);
        both.extend_from_slice(&bytes);
        self.write_fully(0, &both)
    }

    /// Read both header copies, pick the valid one with the larger version.
    ///
    /// Returns the chosen header and whether both copies were intact and in
    /// agreement, the precondition for assuming a clean shutdown.
    pub fn read_store_header(&self) -> Result<(StoreHeader, bool)> {
        let bytes = self.read_fully(0, BLOCK_SIZE * 2)?;
        let first = StoreHeader::parse(&bytes[..BLOCK_SIZE]);
        let second = StoreHeader::parse(&bytes[BLOCK_SIZE..]);
        match (first, second) {
            (Ok(a), Ok(b)) => {
                let agree = a.version == b.version && a.chunk == b.chunk;
                Ok(if b.version > a.version { (b, agree) } else { (a, agree) })
            }
            (Ok(a), Err(e)) => {
                warn!("second store header copy unreadable: {e}");
                Ok((a, false))
            }
            (Err(e), Ok(b)) => {
                warn!("first store header copy unreadable: {e}");
                Ok((b, false))
            }
            (Err(e), Err(_)) => Err(e),
        }
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
