// SPDX-License-Identifier: MPL-2.0

//! A RAM-backed block and inode store.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use id_alloc::IdAlloc;

use crate::{config::Ext2Config, inode::InodeDesc, prelude::*, store::BlockStore};

/// Inode numbers below this one are reserved, so the first inode created
/// on a fresh store is the root directory.
const FIRST_INO: usize = crate::inode::ROOT_INO as usize;

/// A block and inode store kept entirely in memory.
///
/// Block 0 is never handed out, matching the ext2 convention that a zero
/// block pointer marks a hole.
pub struct MemStore {
    block_size: usize,
    inner: Mutex<Inner>,
    read_only: AtomicBool,
    inode_writes: AtomicUsize,
    block_writes: AtomicUsize,
}

struct Inner {
    blocks: Vec<Box<[u8]>>,
    block_bitmap: IdAlloc,
    free_blocks: usize,
    inode_bitmap: IdAlloc,
    free_inodes: usize,
    inodes: BTreeMap<Ino, InodeDesc>,
}

impl MemStore {
    /// Creates a zeroed store of `blocks_count` blocks and `inodes_count` inode slots.
    pub fn new(block_size: usize, blocks_count: usize, inodes_count: usize) -> Result<Self> {
        // Reuse the config checks for the block size.
        Ext2Config::new(block_size, 1)?;
        if blocks_count < 2 || inodes_count <= FIRST_INO {
            return_errno_with_message!(Errno::EINVAL, "store is too small");
        }

        let mut block_bitmap = IdAlloc::with_capacity(blocks_count);
        block_bitmap.alloc_specific(0);
        let mut inode_bitmap = IdAlloc::with_capacity(inodes_count);
        for reserved in 0..FIRST_INO {
            inode_bitmap.alloc_specific(reserved);
        }

        let inner = Inner {
            blocks: (0..blocks_count)
                .map(|_| vec![0u8; block_size].into_boxed_slice())
                .collect(),
            block_bitmap,
            free_blocks: blocks_count - 1,
            inode_bitmap,
            free_inodes: inodes_count - FIRST_INO,
            inodes: BTreeMap::new(),
        };
        Ok(Self {
            block_size,
            inner: Mutex::new(inner),
            read_only: AtomicBool::new(false),
            inode_writes: AtomicUsize::new(0),
            block_writes: AtomicUsize::new(0),
        })
    }

    /// Makes every later mutation fail with `EROFS`, or lifts that again.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().free_blocks
    }

    pub fn free_inodes(&self) -> usize {
        self.inner.lock().free_inodes
    }

    pub fn inode_exists(&self, ino: Ino) -> bool {
        self.inner.lock().inodes.contains_key(&ino)
    }

    /// Returns the last persisted record of `ino`.
    pub fn stored_inode(&self, ino: Ino) -> Option<InodeDesc> {
        self.inner.lock().inodes.get(&ino).copied()
    }

    /// Returns how many times an inode record was written.
    pub fn inode_writes(&self) -> usize {
        self.inode_writes.load(Ordering::Relaxed)
    }

    /// Returns how many blocks were written.
    pub fn block_writes(&self) -> usize {
        self.block_writes.load(Ordering::Relaxed)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return_errno_with_message!(Errno::EROFS, "the store is read-only");
        }
        Ok(())
    }

    fn check_block(&self, inner: &Inner, bid: Bid, len: usize) -> Result<()> {
        if len != self.block_size {
            return_errno_with_message!(Errno::EINVAL, "buffer is not one block long");
        }
        if bid == 0 || bid as usize >= inner.blocks.len() {
            return_errno_with_message!(Errno::EIO, "block number out of range");
        }
        Ok(())
    }
}

impl BlockStore for MemStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, bid: Bid, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        self.check_block(&inner, bid, buf.len())?;
        buf.copy_from_slice(&inner.blocks[bid as usize]);
        Ok(())
    }

    fn write_block(&self, bid: Bid, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        self.check_block(&inner, bid, buf.len())?;
        inner.blocks[bid as usize].copy_from_slice(buf);
        self.block_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn alloc_block(&self, _goal: Ino) -> Result<Bid> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let Some(bid) = inner.block_bitmap.alloc() else {
            return_errno_with_message!(Errno::ENOSPC, "no free block");
        };
        inner.free_blocks -= 1;
        inner.blocks[bid].fill(0);
        Ok(bid as Bid)
    }

    fn free_block(&self, bid: Bid) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let idx = bid as usize;
        if idx == 0 || idx >= inner.blocks.len() || !inner.block_bitmap.is_allocated(idx) {
            return_errno_with_message!(Errno::EINVAL, "freeing an unallocated block");
        }
        inner.block_bitmap.free(idx);
        inner.free_blocks += 1;
        Ok(())
    }

    fn inode_create(&self, mode: u16, _parent: Ino) -> Result<(Ino, InodeDesc)> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let Some(ino) = inner.inode_bitmap.alloc() else {
            return_errno_with_message!(Errno::ENOSPC, "no free inode");
        };
        inner.free_inodes -= 1;
        let ino = ino as Ino;
        let desc = InodeDesc::new(mode);
        inner.inodes.insert(ino, desc);
        Ok((ino, desc))
    }

    fn inode_get(&self, ino: Ino) -> Result<InodeDesc> {
        self.inner
            .lock()
            .inodes
            .get(&ino)
            .copied()
            .ok_or(Error::with_message(Errno::ENOENT, "inode not allocated"))
    }

    fn inode_set(&self, ino: Ino, desc: &InodeDesc) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let Some(slot) = inner.inodes.get_mut(&ino) else {
            return_errno_with_message!(Errno::ENOENT, "inode not allocated");
        };
        *slot = *desc;
        self.inode_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn inode_free(&self, ino: Ino, _desc: &InodeDesc) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if inner.inodes.remove(&ino).is_none() {
            return_errno_with_message!(Errno::ENOENT, "inode not allocated");
        }
        inner.inode_bitmap.free(ino as usize);
        inner.free_inodes += 1;
        Ok(())
    }
}
