// SPDX-License-Identifier: MPL-2.0

//! Name-based operations over the object table and the directory records.

use crate::{
    config::Ext2Config,
    dir::{check_name, DirentCounter, DirentVisitor},
    inode::{FilePerm, FileType},
    object::{Object, ObjectFlags, ObjectGuard},
    prelude::*,
    registry::ObjectRegistry,
    store::BlockStore,
};

/// An opened ext2 object layer.
///
/// Every operation acquires the objects it needs from the registry and
/// releases them before returning, on success and on failure alike.
pub struct Ext2Fs {
    registry: ObjectRegistry,
    root_ino: Ino,
    /// The root stays acquired until unmount.
    root: Mutex<Option<Arc<Object>>>,
}

impl Ext2Fs {
    /// Opens the object layer on `store` with the directory `root_ino` as root.
    pub fn open(store: Arc<dyn BlockStore>, config: Ext2Config, root_ino: Ino) -> Result<Self> {
        if store.block_size() != config.block_size() {
            return_errno_with_message!(Errno::EINVAL, "block size does not match the store");
        }
        let registry = ObjectRegistry::new(store, &config);
        let root = registry.acquire(root_ino)?;
        if !root.is_dir() {
            registry.release(root)?;
            return_errno_with_message!(Errno::ENOTDIR, "root is not a directory");
        }
        debug!("ext2: opened with root inode {}", root_ino);
        Ok(Self {
            registry,
            root_ino,
            root: Mutex::new(Some(root)),
        })
    }

    /// Creates a root directory on an empty store and returns its inode number.
    ///
    /// Only the permission bits of `mode` are used.
    pub fn format_root(store: &Arc<dyn BlockStore>, mode: u16) -> Result<Ino> {
        let mode = dir_mode(mode);
        let (ino, desc) = store.inode_create(mode, 0)?;
        let root = Object::new(ino, desc, ObjectFlags::DIRTY, store.clone());
        let mut guard = root.lock();
        guard.insert_entry(".", mode, ino)?;
        guard.insert_entry("..", mode, ino)?;
        guard.set_links(2);
        guard.sync()?;
        Ok(ino)
    }

    pub fn root_ino(&self) -> Ino {
        self.root_ino
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Returns the inode number of `name` in the directory `dir`.
    pub fn lookup(&self, dir: Ino, name: &str) -> Result<Ino> {
        self.with_object(dir, |parent| parent.find(name))
    }

    /// Creates a non-directory inode with `mode` under `name` in `dir`.
    pub fn create(&self, dir: Ino, name: &str, mode: u16) -> Result<Ino> {
        if FileType::from_mode(mode)? == FileType::Dir {
            return_errno_with_message!(Errno::EINVAL, "directories are made by mkdir");
        }
        check_name(name)?;
        self.with_object(dir, |parent| {
            if !parent.is_dir() {
                return_errno!(Errno::ENOTDIR);
            }
            let child = self.registry.create(parent.ino(), mode)?;
            let result = Self::attach_file(parent, name, &child);
            self.finish(result, child)
        })
    }

    /// Adds the hard link `name` in `dir` to the non-directory `ino`.
    pub fn link(&self, dir: Ino, name: &str, ino: Ino) -> Result<()> {
        check_name(name)?;
        self.with_object(ino, |target| {
            if target.is_dir() {
                return_errno_with_message!(Errno::EPERM, "hard links to directories");
            }
            self.with_object(dir, |parent| {
                let mode = {
                    let mut guard = target.lock();
                    if guard.desc().links_count == 0 {
                        return_errno_with_message!(Errno::ENOENT, "the inode has been unlinked");
                    }
                    guard.inc_links()?;
                    guard.desc().mode
                };
                let result = {
                    let mut guard = parent.lock();
                    ensure_absent(&mut guard, name)
                        .and_then(|()| guard.insert_entry(name, mode, ino))
                };
                if result.is_err() {
                    target.lock().dec_links();
                }
                result
            })
        })
    }

    /// Removes the non-directory entry `name` from `dir`.
    ///
    /// The inode goes away with its last link once nobody holds it.
    pub fn unlink(&self, dir: Ino, name: &str) -> Result<()> {
        if is_dot_or_dotdot(name) {
            return_errno_with_message!(Errno::EISDIR, "unlink of a dot entry");
        }
        self.with_object(dir, |parent| {
            loop {
                let ino = parent.find(name)?;
                let unlinked = self.with_object(ino, |child| {
                    if child.is_dir() {
                        return_errno!(Errno::EISDIR);
                    }
                    let mut guard = parent.lock();
                    // The entry may have been replaced since the lookup.
                    if guard.find_entry(name)? != ino {
                        return Ok(false);
                    }
                    guard.remove_entry(name)?;
                    drop(guard);
                    child.lock().dec_links();
                    Ok(true)
                })?;
                if unlinked {
                    return Ok(());
                }
            }
        })
    }

    /// Creates the directory `name` in `dir` with the permission bits of `mode`.
    pub fn mkdir(&self, dir: Ino, name: &str, mode: u16) -> Result<Ino> {
        let mode = dir_mode(mode);
        check_name(name)?;
        self.with_object(dir, |parent| {
            if !parent.is_dir() {
                return_errno!(Errno::ENOTDIR);
            }
            let child = self.registry.create(parent.ino(), mode)?;
            let result = Self::attach_dir(parent, name, &child);
            self.finish(result, child)
        })
    }

    /// Removes the empty directory `name` from `dir`.
    ///
    /// The directory is locked before its parent, and the emptiness check and
    /// the removal of its entry happen under both locks.
    pub fn rmdir(&self, dir: Ino, name: &str) -> Result<()> {
        match name {
            "." => return_errno_with_message!(Errno::EINVAL, "rmdir of \".\""),
            ".." => return_errno_with_message!(Errno::ENOTEMPTY, "rmdir of \"..\""),
            _ => {}
        }
        self.with_object(dir, |parent| {
            loop {
                let ino = parent.find(name)?;
                if ino == parent.ino() {
                    return_errno_with_message!(Errno::EINVAL, "directory links to itself");
                }
                let removed = self.with_object(ino, |child| {
                    if !child.is_dir() {
                        return_errno!(Errno::ENOTDIR);
                    }
                    let mut child_guard = child.lock();
                    let mut parent_guard = parent.lock();
                    if parent_guard.find_entry(name)? != ino {
                        return Ok(false);
                    }
                    ensure_empty(&mut child_guard, name)?;
                    parent_guard.remove_entry(name)?;
                    parent_guard.dec_links();
                    child_guard.set_links(0);
                    debug!("ext2: removed directory {} ({})", name, ino);
                    Ok(true)
                })?;
                if removed {
                    return Ok(());
                }
            }
        })
    }

    /// Feeds the entries of `dir` from `offset` on to `visitor`.
    ///
    /// Returns the offset to continue from.
    pub fn readdir(
        &self,
        dir: Ino,
        offset: usize,
        visitor: &mut dyn DirentVisitor,
    ) -> Result<usize> {
        self.with_object(dir, |object| object.readdir_at(offset, visitor))
    }

    /// Writes back every resident object.
    pub fn sync(&self) -> Result<()> {
        self.registry.sync_all()
    }

    /// Releases the root and writes back and drops every object.
    pub fn unmount(&self) -> Result<()> {
        let root = self.root.lock().take();
        let released = match root {
            Some(root) => self.registry.release(root),
            None => Ok(()),
        };
        let result = self.registry.shutdown();
        debug!("ext2: unmounted");
        released.and(result)
    }

    /// Acquires `ino`, runs `op` on it and releases it again.
    fn with_object<T>(&self, ino: Ino, op: impl FnOnce(&Arc<Object>) -> Result<T>) -> Result<T> {
        let object = self.registry.acquire(ino)?;
        let result = op(&object);
        self.finish(result, object)
    }

    /// Releases `object` after an operation. The first error wins.
    fn finish<T>(&self, result: Result<T>, object: Arc<Object>) -> Result<T> {
        let released = self.registry.release(object);
        let value = result?;
        released?;
        Ok(value)
    }

    /// Links a freshly created file into `parent`. On failure the file is
    /// left without links so that its release destroys it.
    fn attach_file(parent: &Object, name: &str, child: &Object) -> Result<Ino> {
        let ino = child.ino();
        let mode = child.desc().mode;
        child.lock().set_links(1);
        let result = {
            let mut guard = parent.lock();
            ensure_absent(&mut guard, name)
                .and_then(|()| guard.insert_entry(name, mode, ino))
        };
        if let Err(err) = result {
            child.lock().set_links(0);
            return Err(err);
        }
        Ok(ino)
    }

    /// Fills a freshly created directory and links it into `parent`.
    /// On failure the directory is left without links.
    fn attach_dir(parent: &Object, name: &str, child: &Object) -> Result<Ino> {
        let ino = child.ino();
        let mode = child.desc().mode;
        let parent_mode = parent.desc().mode;
        let result = (|| {
            {
                let mut guard = child.lock();
                guard.insert_entry(".", mode, ino)?;
                guard.insert_entry("..", parent_mode, parent.ino())?;
                guard.set_links(2);
            }
            let mut guard = parent.lock();
            ensure_absent(&mut guard, name)?;
            guard.inc_links()?;
            guard
                .insert_entry(name, mode, ino)
                .inspect_err(|_| guard.dec_links())
        })();
        if let Err(err) = result {
            child.lock().set_links(0);
            return Err(err);
        }
        Ok(ino)
    }
}

fn dir_mode(mode: u16) -> u16 {
    FilePerm::from_bits_truncate(mode).bits() | FileType::Dir as u16
}

fn is_dot_or_dotdot(name: &str) -> bool {
    name == "." || name == ".."
}

/// Fails with `EEXIST` if `name` is taken in the locked directory, and with
/// `ENOENT` if the directory has been removed.
fn ensure_absent(parent: &mut ObjectGuard<'_>, name: &str) -> Result<()> {
    if parent.desc().links_count == 0 {
        return_errno_with_message!(Errno::ENOENT, "the directory has been removed");
    }
    match parent.find_entry(name) {
        Ok(_) => return_errno!(Errno::EEXIST),
        Err(err) if err.error() == Errno::ENOENT => Ok(()),
        Err(err) => Err(err),
    }
}

/// Fails with `ENOTEMPTY` unless the locked directory holds only "." and "..".
fn ensure_empty(dir: &mut ObjectGuard<'_>, name: &str) -> Result<()> {
    let empty = match dir.is_dir_empty() {
        Ok(empty) => empty,
        // Only a directory with more entries spans several blocks.
        Err(err) if err.error() == Errno::EBUSY => false,
        Err(err) => return Err(err),
    };
    if empty {
        return Ok(());
    }
    let mut counter = DirentCounter::new();
    if dir.readdir_at(0, &mut counter).is_ok() {
        debug!("ext2: {} still holds {} entries", name, counter.count());
    }
    return_errno!(Errno::ENOTEMPTY)
}
