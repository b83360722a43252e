// SPDX-License-Identifier: MPL-2.0

use crate::{block_map::IndirectBlock, inode::InodeDesc, prelude::*, store::BlockStore};

bitflags! {
    /// The state bits of an object.
    pub struct ObjectFlags: u8 {
        /// The in-memory inode differs from the last one written to the store.
        const DIRTY = 1 << 0;
        /// The object stands for a mount point. Its indirect blocks are
        /// never written back.
        const MOUNT = 1 << 1;
    }
}

/// The in-memory object of one on-disk inode.
///
/// Objects are owned by the `ObjectRegistry`, which hands out `Arc` handles.
/// Two handles for the same inode number always point to the same object.
pub struct Object {
    ino: Ino,
    inner: Mutex<ObjectInner>,
    store: Arc<dyn BlockStore>,
}

pub(crate) struct ObjectInner {
    pub(crate) desc: InodeDesc,
    /// The cached top-level single, double and treble indirect blocks.
    pub(crate) indirect: [Option<IndirectBlock>; 3],
    pub(crate) flags: ObjectFlags,
}

impl Object {
    pub(crate) fn new(
        ino: Ino,
        desc: InodeDesc,
        flags: ObjectFlags,
        store: Arc<dyn BlockStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            inner: Mutex::new(ObjectInner {
                desc,
                indirect: [None, None, None],
                flags,
            }),
            store,
        })
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Locks the object for inspection or mutation.
    ///
    /// The guard must be dropped before the object is passed back to the registry.
    pub fn lock(&self) -> ObjectGuard<'_> {
        ObjectGuard {
            object: self,
            inner: self.inner.lock(),
        }
    }

    /// Returns a copy of the in-memory inode.
    pub fn desc(&self) -> InodeDesc {
        self.inner.lock().desc
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().desc.is_dir()
    }

    pub fn links_count(&self) -> u16 {
        self.inner.lock().desc.links_count
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().flags.contains(ObjectFlags::DIRTY)
    }

    pub fn is_mount(&self) -> bool {
        self.inner.lock().flags.contains(ObjectFlags::MOUNT)
    }

    pub(crate) fn store(&self) -> &dyn BlockStore {
        self.store.as_ref()
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object").field("ino", &self.ino).finish()
    }
}

/// The locked state of an object.
pub struct ObjectGuard<'a> {
    pub(crate) object: &'a Object,
    pub(crate) inner: MutexGuard<'a, ObjectInner>,
}

impl ObjectGuard<'_> {
    pub fn ino(&self) -> Ino {
        self.object.ino
    }

    pub fn desc(&self) -> &InodeDesc {
        &self.inner.desc
    }

    /// Returns the inode for mutation and marks the object dirty.
    pub fn desc_mut(&mut self) -> &mut InodeDesc {
        self.inner.flags.insert(ObjectFlags::DIRTY);
        &mut self.inner.desc
    }

    pub fn flags(&self) -> ObjectFlags {
        self.inner.flags
    }

    pub fn block_size(&self) -> usize {
        self.object.store.block_size()
    }

    pub fn inc_links(&mut self) -> Result<()> {
        let desc = self.desc_mut();
        desc.links_count = desc
            .links_count
            .checked_add(1)
            .ok_or(Error::new(Errno::EMLINK))?;
        Ok(())
    }

    /// Decrements the link count, clamping at zero.
    pub fn dec_links(&mut self) {
        let ino = self.ino();
        let desc = self.desc_mut();
        match desc.links_count.checked_sub(1) {
            Some(links) => desc.links_count = links,
            None => error!("ext2: link count underflow of inode {}", ino),
        }
    }

    pub fn set_links(&mut self, links: u16) {
        self.desc_mut().links_count = links;
    }

    /// Writes the object back to the store.
    ///
    /// A dirty inode is written and the dirty bit cleared only on success.
    /// Unless the object is a mount point, dirty indirect blocks are written too.
    pub fn sync(&mut self) -> Result<()> {
        let object = self.object;
        if self.inner.flags.contains(ObjectFlags::DIRTY) {
            object.store.inode_set(object.ino, &self.inner.desc)?;
            self.inner.flags.remove(ObjectFlags::DIRTY);
        }

        if self.inner.flags.contains(ObjectFlags::MOUNT) {
            return Ok(());
        }

        for block in self.inner.indirect.iter_mut().flatten() {
            if block.is_dirty() {
                object.store.write_block(block.bid(), block.as_bytes())?;
                block.mark_clean();
            }
        }
        Ok(())
    }

    /// Drops the cached indirect blocks without writing them.
    pub(crate) fn drop_buffers(&mut self) {
        self.inner.indirect = [None, None, None];
    }
}
