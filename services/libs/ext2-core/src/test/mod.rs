// SPDX-License-Identifier: MPL-2.0

use std::{
    sync::Barrier,
    thread::{self, JoinHandle},
};

use crate::{
    config::Ext2Config,
    dir::DirEntryType,
    fs::Ext2Fs,
    inode::ROOT_INO,
    mem_store::MemStore,
    prelude::*,
    store::BlockStore,
};

const BLOCK_SIZE: usize = 1024;
const FILE_MODE: u16 = 0o100644;

fn new_fs(max_objects: usize) -> (Arc<MemStore>, Ext2Fs) {
    let store = Arc::new(MemStore::new(BLOCK_SIZE, 1024, 256).unwrap());
    let dyn_store: Arc<dyn BlockStore> = store.clone();
    let root = Ext2Fs::format_root(&dyn_store, 0o755).unwrap();
    let config = Ext2Config::new(BLOCK_SIZE, max_objects).unwrap();
    let fs = Ext2Fs::open(dyn_store, config, root).unwrap();
    (store, fs)
}

fn padded(prefix: &str, len: usize) -> String {
    format!("{:a<len$}", prefix, len = len)
}

#[test]
fn test_root_inode() {
    let (_store, fs) = new_fs(8);
    assert_eq!(fs.root_ino(), ROOT_INO);
    assert_eq!(fs.lookup(ROOT_INO, ".").unwrap(), ROOT_INO);
    assert_eq!(fs.lookup(ROOT_INO, "..").unwrap(), ROOT_INO);
    let root = fs.registry().acquire(ROOT_INO).unwrap();
    assert!(root.is_empty_dir().unwrap());
    assert_eq!(fs.registry().refs(ROOT_INO), Some(2));
    fs.registry().release(root).unwrap();
}

#[test]
fn test_single_entry_round_trip() {
    let (_store, fs) = new_fs(8);
    let dir = fs.mkdir(ROOT_INO, "dir", 0o755).unwrap();
    let object = fs.registry().acquire(dir).unwrap();
    assert!(object.is_empty_dir().unwrap());
    let before = object.desc();

    object.insert("f", FILE_MODE, 40).unwrap();
    assert!(!object.is_empty_dir().unwrap());
    assert_eq!(object.find("f").unwrap(), 40);

    object.remove("f").unwrap();
    assert!(object.is_empty_dir().unwrap());
    assert_eq!(object.desc().size, before.size);
    assert_eq!(object.desc().block, before.block);
    assert_eq!(object.find("f").unwrap_err().error(), Errno::ENOENT);
    fs.registry().release(object).unwrap();
}

#[test]
fn test_compaction_to_one_block() {
    let (store, fs) = new_fs(8);
    let dir = fs.mkdir(ROOT_INO, "dir", 0o755).unwrap();
    let object = fs.registry().acquire(dir).unwrap();
    let free_blocks = store.free_blocks();

    // Ten 100-byte records fill the first block after "." and "..", and
    // eight 128-byte records fill each further block.
    let mut names: Vec<String> = (0..10).map(|i| padded(&format!("s{}-", i), 92)).collect();
    names.extend((0..24).map(|i| padded(&format!("l{}-", i), 120)));
    for (i, name) in names.iter().enumerate() {
        object.insert(name, FILE_MODE, 100 + i as Ino).unwrap();
    }
    assert_eq!(object.desc().size, 4 * BLOCK_SIZE as u64);

    // Remove in a scattered order.
    let count = names.len();
    for step in 0..count {
        let name = &names[(step * 7) % count];
        object.remove(name).unwrap();
        assert_eq!(object.find(name).unwrap_err().error(), Errno::ENOENT);
    }
    assert_eq!(object.desc().size, BLOCK_SIZE as u64);
    assert!(object.is_empty_dir().unwrap());
    assert_eq!(store.free_blocks(), free_blocks);
    fs.registry().release(object).unwrap();
}

#[test]
fn test_capacity_evicts_least_recently_released() {
    // The root takes one of the four slots.
    let (_store, fs) = new_fs(4);
    let files: Vec<Ino> = (0..4)
        .map(|i| fs.create(ROOT_INO, &format!("f{}", i), FILE_MODE).unwrap())
        .collect();
    let registry = fs.registry();
    assert!(registry.len() <= registry.capacity());
    assert!(!registry.is_cached(files[0]));

    for ino in &files[1..] {
        let object = registry.acquire(*ino).unwrap();
        registry.release(object).unwrap();
        assert!(registry.len() <= registry.capacity());
    }
    let object = registry.acquire(files[0]).unwrap();
    assert!(!registry.is_cached(files[1]));
    assert!(registry.is_cached(files[2]));
    assert!(registry.is_cached(files[3]));
    registry.release(object).unwrap();
}

#[test]
fn test_file_data_survives_eviction() {
    let (store, fs) = new_fs(2);
    let ino = fs.create(ROOT_INO, "data", FILE_MODE).unwrap();
    let registry = fs.registry();

    let data: Vec<u8> = (0..20 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let object = registry.acquire(ino).unwrap();
    object.lock().write_at(0, &data).unwrap();
    registry.release(object).unwrap();

    // Evict the file by admitting another object.
    let other = fs.create(ROOT_INO, "other", FILE_MODE).unwrap();
    assert!(!registry.is_cached(ino));
    assert!(registry.is_cached(other));
    assert_eq!(store.stored_inode(ino).unwrap().size, data.len() as u64);

    let object = registry.acquire(ino).unwrap();
    let mut read = vec![0u8; data.len()];
    assert_eq!(object.lock().read_at(0, &mut read).unwrap(), data.len());
    assert_eq!(read, data);
    registry.release(object).unwrap();

    fs.unlink(ROOT_INO, "data").unwrap();
    assert!(!store.inode_exists(ino));
}

#[test]
fn test_readdir() {
    let (_store, fs) = new_fs(16);
    fs.create(ROOT_INO, "file", FILE_MODE).unwrap();
    fs.mkdir(ROOT_INO, "dir", 0o755).unwrap();

    let mut names: Vec<String> = Vec::new();
    let next = fs.readdir(ROOT_INO, 0, &mut names).unwrap();
    assert_eq!(names, [".", "..", "file", "dir"]);
    assert_eq!(next, BLOCK_SIZE);

    let root = fs.registry().acquire(ROOT_INO).unwrap();
    let types: Vec<_> = root
        .lock()
        .entries_from(0)
        .map(|entry| entry.unwrap().1.type_)
        .collect();
    fs.registry().release(root).unwrap();
    assert_eq!(
        types,
        [
            DirEntryType::Dir,
            DirEntryType::Dir,
            DirEntryType::File,
            DirEntryType::Dir
        ]
    );
}

#[test]
fn test_concurrent_create_and_lookup() {
    let (_store, fs) = new_fs(32);
    let fs = Arc::new(fs);
    let dirs: Vec<Ino> = (0..4)
        .map(|i| fs.mkdir(ROOT_INO, &format!("d{}", i), 0o755).unwrap())
        .collect();

    let handles: Vec<_> = dirs
        .iter()
        .map(|dir| {
            let fs = fs.clone();
            let dir = *dir;
            thread::spawn(move || {
                for i in 0..20 {
                    let name = format!("file{}", i);
                    let ino = fs.create(dir, &name, FILE_MODE).unwrap();
                    assert_eq!(fs.lookup(dir, &name).unwrap(), ino);
                    assert_eq!(fs.lookup(ROOT_INO, ".").unwrap(), ROOT_INO);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for dir in &dirs {
        let mut names: Vec<String> = Vec::new();
        fs.readdir(*dir, 0, &mut names).unwrap();
        assert_eq!(names.len(), 22);
    }
    assert_eq!(fs.registry().refs(ROOT_INO), Some(1));
}

#[test]
fn test_write_back_failure_is_retried() {
    let (store, fs) = new_fs(8);
    let ino = fs.create(ROOT_INO, "f", FILE_MODE).unwrap();

    store.set_read_only(true);
    assert_eq!(fs.sync().unwrap_err().error(), Errno::EROFS);
    let object = fs.registry().acquire(ino).unwrap();
    assert!(object.is_dirty());
    fs.registry().release(object).unwrap();

    store.set_read_only(false);
    fs.sync().unwrap();
    assert_eq!(store.stored_inode(ino).unwrap().links_count, 1);
}

#[test]
fn test_no_space() {
    let store = Arc::new(MemStore::new(BLOCK_SIZE, 64, 4).unwrap());
    let dyn_store: Arc<dyn BlockStore> = store.clone();
    let root = Ext2Fs::format_root(&dyn_store, 0o755).unwrap();
    let fs = Ext2Fs::open(dyn_store, Ext2Config::default(), root).unwrap();

    fs.create(root, "a", FILE_MODE).unwrap();
    assert_eq!(
        fs.create(root, "b", FILE_MODE).unwrap_err().error(),
        Errno::ENOSPC
    );
    assert_eq!(fs.lookup(root, "b").unwrap_err().error(), Errno::ENOENT);
}

fn spawn_after<T: Send + 'static>(
    barrier: &Arc<Barrier>,
    op: impl FnOnce() -> T + Send + 'static,
) -> JoinHandle<T> {
    let barrier = barrier.clone();
    thread::spawn(move || {
        barrier.wait();
        op()
    })
}

#[test]
fn test_concurrent_create_of_one_name() {
    let (store, fs) = new_fs(32);
    for i in 0..100 {
        fs.create(ROOT_INO, &format!("pre{:04}", i), FILE_MODE).unwrap();
    }
    let fs = Arc::new(fs);
    let free_inodes = store.free_inodes();

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fs = fs.clone();
            spawn_after(&barrier, move || fs.create(ROOT_INO, "x", FILE_MODE))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created: Vec<Ino> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(created.len(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.error(), Errno::EEXIST);
    }
    let mut names: Vec<String> = Vec::new();
    fs.readdir(ROOT_INO, 0, &mut names).unwrap();
    assert_eq!(names.iter().filter(|name| *name == "x").count(), 1);
    assert_eq!(fs.lookup(ROOT_INO, "x").unwrap(), created[0]);
    // The losers' inodes are freed again.
    assert_eq!(store.free_inodes(), free_inodes - 1);
}

#[test]
fn test_concurrent_unlink_of_one_name() {
    let (store, fs) = new_fs(32);
    let ino = fs.create(ROOT_INO, "x", FILE_MODE).unwrap();
    let fs = Arc::new(fs);

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fs = fs.clone();
            spawn_after(&barrier, move || fs.unlink(ROOT_INO, "x"))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.error(), Errno::ENOENT);
    }
    assert!(!store.inode_exists(ino));
}

#[test]
fn test_rmdir_races_create() {
    let (store, fs) = new_fs(32);
    let fs = Arc::new(fs);
    let free_inodes = store.free_inodes();

    for _ in 0..50 {
        let dir = fs.mkdir(ROOT_INO, "d", 0o755).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let remover = {
            let fs = fs.clone();
            spawn_after(&barrier, move || fs.rmdir(ROOT_INO, "d"))
        };
        let creator = {
            let fs = fs.clone();
            spawn_after(&barrier, move || fs.create(dir, "f", FILE_MODE))
        };
        let removed = remover.join().unwrap();
        let created = creator.join().unwrap();

        match (removed, created) {
            (Ok(()), Err(err)) => assert_eq!(err.error(), Errno::ENOENT),
            (Err(err), Ok(_)) => {
                assert_eq!(err.error(), Errno::ENOTEMPTY);
                fs.unlink(dir, "f").unwrap();
                fs.rmdir(ROOT_INO, "d").unwrap();
            }
            other => panic!("rmdir and create both won or both lost: {:?}", other),
        }
        assert_eq!(fs.lookup(ROOT_INO, "d").unwrap_err().error(), Errno::ENOENT);
    }
    assert_eq!(store.free_inodes(), free_inodes);
    assert_eq!(fs.registry().refs(ROOT_INO), Some(1));
}
