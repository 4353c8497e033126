//! End-to-end scenarios over the public API: persistence, snapshot
//! isolation, crash recovery, compaction, contention and cursor
//! stability.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use kawadb::{Store, StoreConfig, StringType, U64Type};

fn config(path: Option<PathBuf>) -> StoreConfig {
    let config = StoreConfig::new().auto_commit_delay(0);
    match path {
        Some(path) => config.file_name(path),
        None => config,
    }
}

#[test]
fn s1_basic_persistence() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s1");
    {
        let store = Store::open(config(Some(path.clone()))).unwrap();
        let map = store.open_map("m", StringType, StringType).unwrap();
        map.put("k".into(), "v".into()).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    let store = Store::open(config(Some(path.clone()))).unwrap();
    let map = store.open_map("m", StringType, StringType).unwrap();
    assert_eq!(map.get(&"k".into()).unwrap(), Some("v".into()));

    // 2 header blocks plus one small chunk (header + payload + footer)
    let size = std::fs::metadata(&path).unwrap().len();
    assert!(size <= 5 * 4096, "file is {size} bytes");
}

#[test]
fn s2_snapshot_isolation() {
    let store = Store::open(config(None)).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    for i in 1..=100u64 {
        map.put(i, format!("v{i}")).unwrap();
    }
    let v1 = store.commit().unwrap();

    let snapshot = map.open_version(v1).unwrap();
    for i in 50..=60u64 {
        map.remove(&i).unwrap();
    }
    store.commit().unwrap();

    assert_eq!(snapshot.get(&55).unwrap(), Some("v55".into()));
    assert_eq!(map.get(&55).unwrap(), None);
    assert_eq!(snapshot.size_as_long(), 100);
    assert_eq!(map.size_as_long(), 89);
}

#[test]
fn s3_crash_at_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s3");
    let crashed = dir.path().join("s3-crashed");

    // retention spans all commits, so no chunk is recycled and the file
    // stays strictly append-ordered; the torn tail is the newest chunk
    let store = Store::open(config(Some(path.clone())).versions_to_keep(60)).unwrap();
    let map = store.open_map("m", U64Type, U64Type).unwrap();
    // deterministic pseudo-random keys
    let mut seed = 0x9e3779b97f4a7c15u64;
    let mut keys = Vec::new();
    let mut committed_at_49 = Vec::new();
    for commit in 0..50 {
        for _ in 0..100 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let key = seed >> 16;
            map.put(key, commit as u64).unwrap();
            keys.push((key, commit as u64));
        }
        store.commit().unwrap();
        if commit == 48 {
            committed_at_49 = keys.clone();
        }
    }

    // snapshot the synced file as a crash image and tear its tail
    std::fs::copy(&path, &crashed).unwrap();
    store.close().unwrap();
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&crashed)
            .unwrap();
        let len = file.metadata().unwrap().len();
        // tear the tail: the end of the last payload block plus the
        // beginning of the footer block
        file.seek(SeekFrom::Start(len - 4096 - 200)).unwrap();
        file.write_all(&[0u8; 4296]).unwrap();
    }

    let reopened = Store::open(config(Some(crashed))).unwrap();
    let map = reopened.open_map("m", U64Type, U64Type).unwrap();
    // everything from commit #49 or earlier must be visible
    for (key, commit) in &committed_at_49 {
        let got = map.get(key).unwrap();
        assert!(got.is_some(), "lost key {key} from commit {commit}");
    }
    // nothing from the torn commit #50 may be visible
    let mut cursor = map.cursor(None).unwrap();
    while let Some((_, value)) = cursor.next_entry().unwrap() {
        assert!(value < 49, "key from the torn commit survived");
    }
}

#[test]
fn s4_compaction_reduces_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s4");
    let store = Store::open(config(Some(path.clone()))).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    for i in 0..30_000u64 {
        map.put(i, format!("value-{i:08}")).unwrap();
    }
    store.commit().unwrap();
    let size_after_insert = std::fs::metadata(&path).unwrap().len();

    for i in 0..30_000u64 {
        if i % 10 != 0 {
            map.remove(&i).unwrap();
        }
    }
    store.commit().unwrap();

    store.compact_file(10_000).unwrap();

    let size_after_compact = std::fs::metadata(&path).unwrap().len();
    assert!(
        size_after_compact * 100 < size_after_insert * 30,
        "compaction left {size_after_compact} of {size_after_insert} bytes"
    );
    for i in (0..30_000u64).step_by(10) {
        assert_eq!(map.get(&i).unwrap(), Some(format!("value-{i:08}")));
    }
}

#[test]
fn s5_cas_replace_under_contention() {
    let store = Store::open(config(None)).unwrap();
    let map = Arc::new(store.open_map("counter", U64Type, U64Type).unwrap());
    map.put(0, 0).unwrap();

    let threads = 8u64;
    let increments_per_thread = 300u64;
    let mut handles = Vec::new();
    for _ in 0..threads {
        let map = map.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..increments_per_thread {
                loop {
                    let current = map.get(&0).unwrap().unwrap();
                    if map.replace_if_equals(0, current, current + 1).unwrap() {
                        break;
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    // no lost updates
    assert_eq!(map.get(&0).unwrap(), Some(threads * increments_per_thread));
}

#[test]
fn s6_cursor_stability() {
    let store = Store::open(config(None)).unwrap();
    let map = store.open_map("m", U64Type, U64Type).unwrap();
    for i in 1..=1000u64 {
        map.put(i, i).unwrap();
    }
    store.commit().unwrap();

    let mut cursor = map.cursor(None).unwrap();
    // interleave reads with concurrent growth and a commit
    let mut seen = Vec::new();
    for _ in 0..500 {
        seen.push(cursor.next_entry().unwrap().unwrap().0);
    }
    for i in 1001..=2000u64 {
        map.put(i, i).unwrap();
    }
    store.commit().unwrap();
    while let Some((key, _)) = cursor.next_entry().unwrap() {
        seen.push(key);
    }
    assert_eq!(seen, (1..=1000u64).collect::<Vec<_>>());
}

#[test]
fn reopen_preserves_all_maps() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("multi");
    {
        let store = Store::open(config(Some(path.clone()))).unwrap();
        let a = store.open_map("a", U64Type, StringType).unwrap();
        let b = store.open_map("b", StringType, U64Type).unwrap();
        for i in 0..500u64 {
            a.put(i, format!("a{i}")).unwrap();
            b.put(format!("b{i}"), i).unwrap();
        }
        store.commit().unwrap();
        store.close().unwrap();
    }
    let store = Store::open(config(Some(path))).unwrap();
    let mut names = store.map_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    let a = store.open_map("a", U64Type, StringType).unwrap();
    let b = store.open_map("b", StringType, U64Type).unwrap();
    for i in 0..500u64 {
        assert_eq!(a.get(&i).unwrap(), Some(format!("a{i}")));
        assert_eq!(b.get(&format!("b{i}")).unwrap(), Some(i));
    }
}

#[test]
fn commits_accumulate_and_chunks_recycle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cycles");
    let store = Store::open(config(Some(path.clone())).versions_to_keep(1)).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    for round in 0..100u64 {
        for i in 0..50u64 {
            map.put(i, format!("round-{round}-{i}")).unwrap();
        }
        store.commit().unwrap();
    }
    // overwriting the same keys for 100 rounds must not grow the file
    // beyond a handful of live chunks once dead ones are recycled
    store.compact_file(1_000).unwrap();
    let size = std::fs::metadata(&path).unwrap().len();
    assert!(size < 60 * 4096, "file grew to {size} bytes");
    for i in 0..50u64 {
        assert_eq!(map.get(&i).unwrap(), Some(format!("round-99-{i}")));
    }
}

#[test]
fn two_housekeeping_passes_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idem");
    let store = Store::open(config(Some(path.clone()))).unwrap();
    let map = store.open_map("m", U64Type, StringType).unwrap();
    for i in 0..5_000u64 {
        map.put(i, format!("v{i}")).unwrap();
    }
    store.commit().unwrap();
    for i in 0..5_000u64 {
        if i % 3 != 0 {
            map.remove(&i).unwrap();
        }
    }
    store.commit().unwrap();

    store.compact_file(5_000).unwrap();
    let first = std::fs::metadata(&path).unwrap().len();
    store.compact_file(5_000).unwrap();
    let second = std::fs::metadata(&path).unwrap().len();
    assert_eq!(first, second, "a second pass on a quiescent store is a no-op");
}

#[test]
fn dump_walks_the_file_without_the_layout_map() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("dump");
    {
        let store = Store::open(config(Some(path.clone())))?;
        let map = store.open_map("m", U64Type, U64Type)?;
        for round in 0..3u64 {
            map.put(round, round)?;
            store.commit()?;
        }
        store.close()?;
    }
    let mut out = Vec::new();
    kawadb::dump::dump(&path, &mut out)?;
    let text = String::from_utf8(out)?;
    assert!(text.contains("store header"));
    assert!(text.contains("chunk 1 at block"));
    assert!(text.lines().count() >= 4);
    Ok(())
}

#[test]
fn header_only_file_opens_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty");
    {
        let store = Store::open(config(Some(path.clone()))).unwrap();
        store.close().unwrap();
    }
    let size = std::fs::metadata(&path).unwrap().len();
    let store = Store::open(config(Some(path))).unwrap();
    let map = store.open_map("m", U64Type, U64Type).unwrap();
    assert!(map.is_empty());
    assert!(size >= 2 * 4096, "header-only file is {size} bytes");
}
