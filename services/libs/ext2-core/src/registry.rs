// SPDX-License-Identifier: MPL-2.0

//! The table of resident objects.

use lru::LruCache;

use crate::{
    config::Ext2Config,
    inode::InodeDesc,
    object::{Object, ObjectFlags},
    prelude::*,
    store::BlockStore,
};

/// Keeps at most one object per inode number and a bounded number of objects overall.
///
/// Each resident object carries a reference count of un-released acquisitions.
/// Objects whose count dropped to zero stay resident on an LRU free list until
/// they are acquired again or evicted to admit another object.
///
/// The registry lock may be held while taking an object lock, never the other
/// way round. Callers must drop every `ObjectGuard` before calling into the registry.
///
/// Eviction writes the victim back and destruction frees its blocks with the
/// registry lock held. Concurrent callers spin on the lock until that I/O ends.
pub struct ObjectRegistry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
    store: Arc<dyn BlockStore>,
}

struct RegistryInner {
    slots: BTreeMap<Ino, Slot>,
    /// The unreferenced objects, least recently released first.
    free_list: LruCache<Ino, ()>,
    /// Counts objects that left the table by eviction or destruction.
    departures: u64,
}

struct Slot {
    object: Arc<Object>,
    refs: usize,
}

impl ObjectRegistry {
    pub fn new(store: Arc<dyn BlockStore>, config: &Ext2Config) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: BTreeMap::new(),
                free_list: LruCache::unbounded(),
                departures: 0,
            }),
            capacity: config.max_objects(),
            store,
        }
    }

    /// Returns the object of `ino`, loading it from the store if it is not resident.
    ///
    /// Fails with `ENOENT` if the store has no such inode and with `ENFILE`
    /// if the table is full of referenced objects.
    pub fn acquire(&self, ino: Ino) -> Result<Arc<Object>> {
        loop {
            let departures = {
                let mut inner = self.inner.lock();
                if let Some(object) = inner.get(ino) {
                    return Ok(object);
                }
                inner.departures
            };

            let desc = self.store.inode_get(ino)?;
            let mut inner = self.inner.lock();
            // Another caller may have admitted it meanwhile.
            if let Some(object) = inner.get(ino) {
                return Ok(object);
            }
            // An object that left the table meanwhile may have made `desc` stale.
            if inner.departures != departures {
                continue;
            }
            return self.admit(&mut inner, ino, desc, ObjectFlags::empty());
        }
    }

    /// Allocates a new inode with `mode` near `parent` and returns its object.
    ///
    /// The object starts dirty with one reference. If it cannot be admitted,
    /// the new inode is freed again.
    pub fn create(&self, parent: Ino, mode: u16) -> Result<Arc<Object>> {
        let (ino, desc) = self.store.inode_create(mode, parent)?;
        let mut inner = self.inner.lock();
        match self.admit(&mut inner, ino, desc, ObjectFlags::DIRTY) {
            Ok(object) => Ok(object),
            Err(err) => {
                drop(inner);
                if let Err(free_err) = self.store.inode_free(ino, &desc) {
                    warn!("ext2: cannot free unadmitted inode {}: {}", ino, free_err);
                }
                Err(err)
            }
        }
    }

    /// Gives back one reference to `object`.
    ///
    /// The last release of an object without links destroys it. Otherwise the
    /// last release puts the object at the most recently used end of the free list.
    pub fn release(&self, object: Arc<Object>) -> Result<()> {
        let ino = object.ino();
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(&ino) else {
            error!("ext2: release of inode {} which is not resident", ino);
            return_errno_with_message!(Errno::EINVAL, "the object is not resident");
        };
        if !Arc::ptr_eq(&slot.object, &object) {
            error!("ext2: release of a stale object for inode {}", ino);
            return_errno_with_message!(Errno::EINVAL, "the object is not resident");
        }
        drop(object);

        match slot.refs.checked_sub(1) {
            Some(refs) => slot.refs = refs,
            None => error!("ext2: reference count underflow of inode {}", ino),
        }
        if slot.refs > 0 {
            return Ok(());
        }

        if slot.object.links_count() == 0 {
            return self.destroy_locked(&mut inner, ino);
        }
        inner.free_list.put(ino, ());
        Ok(())
    }

    /// Writes `object` back to the store.
    ///
    /// On failure the object stays dirty and the error is returned.
    pub fn flush(&self, object: &Object) -> Result<()> {
        object.lock().sync().inspect_err(|err| {
            warn!("ext2: write-back of inode {} failed: {}", object.ino(), err);
        })
    }

    /// Removes `object` from the table and frees its blocks and inode.
    ///
    /// `object` must be the caller's only reference, otherwise this fails
    /// with `EBUSY` and nothing changes.
    pub fn destroy(&self, object: Arc<Object>) -> Result<()> {
        let ino = object.ino();
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get(&ino) else {
            error!("ext2: destroy of inode {} which is not resident", ino);
            return_errno_with_message!(Errno::EINVAL, "the object is not resident");
        };
        if !Arc::ptr_eq(&slot.object, &object) || slot.refs > 1 {
            return_errno_with_message!(Errno::EBUSY, "the object is still referenced");
        }
        drop(object);
        self.destroy_locked(&mut inner, ino)
    }

    /// Acquires `ino` as the mount point. Its indirect blocks are never written back.
    pub fn mount(&self, ino: Ino) -> Result<Arc<Object>> {
        let object = self.acquire(ino)?;
        object.lock().inner.flags.insert(ObjectFlags::MOUNT);
        Ok(object)
    }

    /// Writes back every resident object.
    ///
    /// Every object is tried. The first error is returned.
    pub fn sync_all(&self) -> Result<()> {
        let objects: Vec<Arc<Object>> = self
            .inner
            .lock()
            .slots
            .values()
            .map(|slot| slot.object.clone())
            .collect();

        let mut result = Ok(());
        for object in objects {
            if let Err(err) = self.flush(&object) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Writes back and drops every resident object.
    ///
    /// Handles still held by callers stay usable but are detached from the table.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut result = Ok(());
        for (ino, slot) in core::mem::take(&mut inner.slots) {
            if slot.refs > 0 {
                warn!("ext2: inode {} still has {} references at shutdown", ino, slot.refs);
            }
            match self.flush(&slot.object) {
                Ok(()) => slot.object.lock().drop_buffers(),
                Err(err) => result = result.and(Err(err)),
            }
        }
        inner.free_list.clear();
        inner.departures += 1;
        debug!("ext2: object table shut down");
        result
    }

    /// Returns the number of resident objects.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of resident objects without references.
    pub fn free_len(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the reference count of `ino`, or `None` if it is not resident.
    pub fn refs(&self, ino: Ino) -> Option<usize> {
        self.inner.lock().slots.get(&ino).map(|slot| slot.refs)
    }

    pub fn is_cached(&self, ino: Ino) -> bool {
        self.inner.lock().slots.contains_key(&ino)
    }

    pub fn is_on_free_list(&self, ino: Ino) -> bool {
        self.inner.lock().free_list.contains(&ino)
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Inserts a new object with one reference, evicting an unreferenced
    /// object first if the table is full.
    fn admit(
        &self,
        inner: &mut RegistryInner,
        ino: Ino,
        desc: InodeDesc,
        flags: ObjectFlags,
    ) -> Result<Arc<Object>> {
        if inner.slots.len() >= self.capacity {
            self.evict_one(inner)?;
        }
        let object = Object::new(ino, desc, flags, self.store.clone());
        inner.slots.insert(
            ino,
            Slot {
                object: object.clone(),
                refs: 1,
            },
        );
        debug!("ext2: admitted inode {}", ino);
        Ok(object)
    }

    /// Evicts the least recently released object.
    fn evict_one(&self, inner: &mut RegistryInner) -> Result<()> {
        let Some((victim, ())) = inner.free_list.pop_lru() else {
            return_errno_with_message!(Errno::ENFILE, "the object table is full");
        };
        let Some(slot) = inner.slots.get(&victim) else {
            error!("ext2: free list names inode {} which is not resident", victim);
            return_errno_with_message!(Errno::ENFILE, "the object table is full");
        };
        let object = slot.object.clone();

        if object.links_count() == 0 {
            inner.free_list.put(victim, ());
            return self.destroy_locked(inner, victim);
        }
        if let Err(err) = self.flush(&object) {
            inner.free_list.put(victim, ());
            inner.free_list.demote(&victim);
            return Err(err);
        }
        object.lock().drop_buffers();
        inner.slots.remove(&victim);
        inner.departures += 1;
        debug!("ext2: evicted inode {}", victim);
        Ok(())
    }

    /// Frees the blocks and the inode of `ino` and removes it from the table.
    ///
    /// If the store fails, the object stays resident without references so
    /// that the next release retries.
    fn destroy_locked(&self, inner: &mut RegistryInner, ino: Ino) -> Result<()> {
        let Some(slot) = inner.slots.get(&ino) else {
            error!("ext2: destroy of inode {} which is not resident", ino);
            return_errno_with_message!(Errno::EINVAL, "the object is not resident");
        };
        let object = slot.object.clone();

        let mut guard = object.lock();
        let result = guard.truncate(0).and_then(|()| {
            let desc = *guard.desc();
            self.store.inode_free(ino, &desc)
        });
        if let Err(err) = result {
            drop(guard);
            warn!("ext2: cannot destroy inode {}: {}", ino, err);
            if let Some(slot) = inner.slots.get_mut(&ino) {
                slot.refs = 0;
            }
            inner.free_list.put(ino, ());
            return Err(err);
        }
        guard.drop_buffers();
        drop(guard);

        inner.slots.remove(&ino);
        inner.free_list.pop(&ino);
        inner.departures += 1;
        debug!("ext2: destroyed inode {}", ino);
        Ok(())
    }
}

impl RegistryInner {
    /// Takes one more reference to a resident object.
    fn get(&mut self, ino: Ino) -> Option<Arc<Object>> {
        let slot = self.slots.get_mut(&ino)?;
        if slot.refs == 0 {
            self.free_list.pop(&ino);
        }
        slot.refs += 1;
        Some(slot.object.clone())
    }
}

impl Drop for ObjectRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("ext2: write-back at teardown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::{block_map::BID_SIZE, inode::INDIRECT, mem_store::MemStore};

    const BLOCK_SIZE: usize = 1024;

    fn setup(capacity: usize) -> (Arc<MemStore>, ObjectRegistry) {
        let store = Arc::new(MemStore::new(BLOCK_SIZE, 256, 64).unwrap());
        let config = Ext2Config::new(BLOCK_SIZE, capacity).unwrap();
        let registry = ObjectRegistry::new(store.clone(), &config);
        (store, registry)
    }

    fn new_inodes(store: &MemStore, count: usize) -> Vec<Ino> {
        (0..count)
            .map(|_| {
                let (ino, mut desc) = store.inode_create(0o100644, 0).unwrap();
                desc.links_count = 1;
                store.inode_set(ino, &desc).unwrap();
                ino
            })
            .collect()
    }

    /// Checks that an object is on the free list iff it has no references.
    fn check_free_list(registry: &ObjectRegistry, inos: &[Ino]) {
        for ino in inos {
            if let Some(refs) = registry.refs(*ino) {
                assert_eq!(registry.is_on_free_list(*ino), refs == 0);
            } else {
                assert!(!registry.is_on_free_list(*ino));
            }
        }
    }

    #[test]
    fn acquire_returns_the_same_object() {
        let (store, registry) = setup(8);
        let inos = new_inodes(&store, 1);

        let first = registry.acquire(inos[0]).unwrap();
        let second = registry.acquire(inos[0]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.refs(inos[0]), Some(2));
        assert!(!first.is_dirty());

        registry.release(first).unwrap();
        check_free_list(&registry, &inos);
        registry.release(second).unwrap();
        assert_eq!(registry.refs(inos[0]), Some(0));
        check_free_list(&registry, &inos);

        // Reacquiring takes it off the free list without a store round trip.
        let third = registry.acquire(inos[0]).unwrap();
        assert_eq!(registry.free_len(), 0);
        check_free_list(&registry, &inos);
        registry.release(third).unwrap();
    }

    #[test]
    fn acquire_missing_inode() {
        let (_store, registry) = setup(8);
        assert_eq!(registry.acquire(40).unwrap_err().error(), Errno::ENOENT);
        assert!(registry.is_empty());
    }

    #[test]
    fn evicts_least_recently_released() {
        let (store, registry) = setup(3);
        let inos = new_inodes(&store, 4);

        let objects: Vec<_> = inos[..3]
            .iter()
            .map(|ino| registry.acquire(*ino).unwrap())
            .collect();
        // Release in the order 1, 0, 2.
        let mut objects: Vec<_> = objects.into_iter().map(Some).collect();
        for idx in [1, 0, 2] {
            registry.release(objects[idx].take().unwrap()).unwrap();
        }

        let fourth = registry.acquire(inos[3]).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(!registry.is_cached(inos[1]));
        assert!(registry.is_cached(inos[0]));
        assert!(registry.is_cached(inos[2]));
        check_free_list(&registry, &inos);
        registry.release(fourth).unwrap();
    }

    #[test]
    fn full_table_fails_with_enfile() {
        let (store, registry) = setup(2);
        let inos = new_inodes(&store, 3);
        let first = registry.acquire(inos[0]).unwrap();
        let second = registry.acquire(inos[1]).unwrap();

        assert_eq!(registry.acquire(inos[2]).unwrap_err().error(), Errno::ENFILE);
        assert!(!registry.is_cached(inos[2]));

        let free_inodes = store.free_inodes();
        assert_eq!(
            registry.create(0, 0o100644).unwrap_err().error(),
            Errno::ENFILE
        );
        assert_eq!(store.free_inodes(), free_inodes);
        assert_eq!(registry.len(), 2);

        registry.release(first).unwrap();
        registry.release(second).unwrap();
    }

    #[test]
    fn eviction_writes_back_the_victim() {
        let (store, registry) = setup(1);
        let inos = new_inodes(&store, 2);

        let object = registry.acquire(inos[0]).unwrap();
        object.lock().desc_mut().uid = 42;
        registry.release(object).unwrap();

        let other = registry.acquire(inos[1]).unwrap();
        assert_eq!(store.stored_inode(inos[0]).unwrap().uid, 42);
        registry.release(other).unwrap();
    }

    #[test]
    fn failed_eviction_keeps_the_victim() {
        let (store, registry) = setup(1);
        let inos = new_inodes(&store, 2);

        let object = registry.acquire(inos[0]).unwrap();
        object.lock().desc_mut().uid = 7;
        registry.release(object).unwrap();

        store.set_read_only(true);
        assert_eq!(registry.acquire(inos[1]).unwrap_err().error(), Errno::EROFS);
        assert!(registry.is_on_free_list(inos[0]));
        assert!(!registry.is_cached(inos[1]));

        store.set_read_only(false);
        let other = registry.acquire(inos[1]).unwrap();
        assert_eq!(store.stored_inode(inos[0]).unwrap().uid, 7);
        registry.release(other).unwrap();
    }

    #[test]
    fn unlinked_object_is_destroyed_on_last_release() {
        let (store, registry) = setup(8);
        let free_blocks = store.free_blocks();
        let free_inodes = store.free_inodes();

        let object = registry.create(0, 0o100644).unwrap();
        let ino = object.ino();
        assert!(object.is_dirty());
        {
            let mut guard = object.lock();
            guard.set_links(1);
            guard.write_at(0, &[1u8; 3 * BLOCK_SIZE]).unwrap();
        }
        let extra = registry.acquire(ino).unwrap();
        extra.lock().dec_links();

        registry.release(extra).unwrap();
        assert!(registry.is_cached(ino));
        registry.release(object).unwrap();
        assert!(!registry.is_cached(ino));
        assert!(!store.inode_exists(ino));
        assert_eq!(store.free_blocks(), free_blocks);
        assert_eq!(store.free_inodes(), free_inodes);
    }

    #[test]
    fn destroy_requires_sole_reference() {
        let (store, registry) = setup(8);
        let inos = new_inodes(&store, 1);
        let first = registry.acquire(inos[0]).unwrap();
        let second = registry.acquire(inos[0]).unwrap();
        assert_eq!(
            registry.destroy(first.clone()).unwrap_err().error(),
            Errno::EBUSY
        );
        registry.release(second).unwrap();
        registry.destroy(first).unwrap();
        assert!(!store.inode_exists(inos[0]));
        assert!(registry.is_empty());
    }

    #[test]
    fn flush_failure_keeps_the_object_dirty() {
        let (store, registry) = setup(8);
        let object = registry.create(0, 0o100644).unwrap();
        object.lock().set_links(1);

        store.set_read_only(true);
        assert_eq!(registry.flush(&object).unwrap_err().error(), Errno::EROFS);
        assert!(object.is_dirty());

        store.set_read_only(false);
        registry.flush(&object).unwrap();
        assert!(!object.is_dirty());
        assert_eq!(store.stored_inode(object.ino()).unwrap().links_count, 1);
        registry.release(object).unwrap();
    }

    #[test]
    fn mount_point_skips_indirect_writeback() {
        let (store, registry) = setup(8);
        let inos = new_inodes(&store, 1);
        let root = registry.mount(inos[0]).unwrap();
        assert!(root.is_mount());

        let top = {
            let mut guard = root.lock();
            guard.write_at(12 * BLOCK_SIZE as u64, &[5u8; 4]).unwrap();
            guard.desc().block[INDIRECT]
        };
        let writes = store.block_writes();
        registry.flush(&root).unwrap();
        assert!(!root.is_dirty());
        assert_eq!(store.block_writes(), writes);

        let mut raw = vec![0u8; BLOCK_SIZE];
        store.read_block(top, &mut raw).unwrap();
        assert!(raw[..BID_SIZE].iter().all(|b| *b == 0));
        registry.release(root).unwrap();
    }

    #[test]
    fn release_of_unknown_object() {
        let (store, registry) = setup(8);
        let inos = new_inodes(&store, 1);
        let object = registry.acquire(inos[0]).unwrap();
        let foreign = Object::new(inos[0], object.desc(), ObjectFlags::empty(), store.clone());
        assert_eq!(registry.release(foreign).unwrap_err().error(), Errno::EINVAL);
        assert_eq!(registry.refs(inos[0]), Some(1));
        registry.release(object).unwrap();
    }

    #[test]
    fn concurrent_acquire_shares_identity() {
        let (store, registry) = setup(4);
        let inos = new_inodes(&store, 1);
        let ino = inos[0];
        let registry = Arc::new(registry);
        let pinned = registry.acquire(ino).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let pinned = pinned.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let object = registry.acquire(ino).unwrap();
                        assert!(Arc::ptr_eq(&object, &pinned));
                        registry.release(object).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.refs(ino), Some(1));
        registry.release(pinned).unwrap();
        assert_eq!(registry.refs(ino), Some(0));
        assert!(registry.is_on_free_list(ino));
    }

    #[test]
    fn concurrent_admission_shares_identity() {
        let (store, registry) = setup(4);
        let ino = new_inodes(&store, 1)[0];
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.acquire(ino).unwrap()
                })
            })
            .collect();
        let objects: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(objects.iter().all(|object| Arc::ptr_eq(object, &objects[0])));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.refs(ino), Some(8));
        for object in objects {
            registry.release(object).unwrap();
        }
        assert_eq!(registry.refs(ino), Some(0));
        assert!(registry.is_on_free_list(ino));
    }

    #[test]
    fn admission_races_eviction() {
        let (store, registry) = setup(2);
        let inos = new_inodes(&store, 6);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                let inos = inos.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let ino = inos[(t + i) % inos.len()];
                        let object = match registry.acquire(ino) {
                            Ok(object) => object,
                            Err(err) => {
                                assert_eq!(err.error(), Errno::ENFILE);
                                continue;
                            }
                        };
                        object.lock().desc_mut().uid = ino;
                        let again = registry.acquire(ino).unwrap();
                        assert!(Arc::ptr_eq(&object, &again));
                        registry.release(again).unwrap();
                        registry.release(object).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.len() <= registry.capacity());
        check_free_list(&registry, &inos);
        for ino in &inos {
            assert_eq!(registry.refs(*ino).unwrap_or(0), 0);
        }
        registry.sync_all().unwrap();
        for ino in &inos {
            assert_eq!(store.stored_inode(*ino).unwrap().uid, *ino);
        }
    }

    #[test]
    fn double_release_is_clamped() {
        let (store, registry) = setup(4);
        let ino = new_inodes(&store, 1)[0];
        let object = registry.acquire(ino).unwrap();
        let copy = object.clone();

        registry.release(object).unwrap();
        registry.release(copy).unwrap();
        assert_eq!(registry.refs(ino), Some(0));
        assert!(registry.is_on_free_list(ino));
        assert_eq!(registry.free_len(), 1);

        let object = registry.acquire(ino).unwrap();
        assert_eq!(registry.refs(ino), Some(1));
        registry.release(object).unwrap();
    }

    #[test]
    fn shutdown_writes_back_everything() {
        let (store, registry) = setup(8);
        let object = registry.create(0, 0o100644).unwrap();
        let ino = object.ino();
        object.lock().set_links(3);
        registry.release(object).unwrap();

        registry.sync_all().unwrap();
        assert_eq!(store.stored_inode(ino).unwrap().links_count, 3);
        registry.shutdown().unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.free_len(), 0);
    }
}
