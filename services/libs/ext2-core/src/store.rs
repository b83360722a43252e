// SPDX-License-Identifier: MPL-2.0

use crate::{inode::InodeDesc, prelude::*};

/// The block and inode store underneath the object layer.
///
/// Implementations persist raw blocks and inode records. Every block transfer
/// moves exactly one whole block and is atomic at that granularity.
pub trait BlockStore: Send + Sync {
    /// Returns the size of a block in bytes.
    fn block_size(&self) -> usize;

    /// Reads the block `bid` into `buf`, which is exactly one block long.
    fn read_block(&self, bid: Bid, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf`, which is exactly one block long, to the block `bid`.
    fn write_block(&self, bid: Bid, buf: &[u8]) -> Result<()>;

    /// Allocates a data block, preferably close to the inode `goal`.
    ///
    /// Returns `ENOSPC` if the device is full.
    fn alloc_block(&self, goal: Ino) -> Result<Bid>;

    /// Returns the block `bid` to the free pool.
    fn free_block(&self, bid: Bid) -> Result<()>;

    /// Allocates an on-disk inode with `mode`, placed with `parent` as a hint.
    ///
    /// Returns `ENOSPC` if no inode slot is free.
    fn inode_create(&self, mode: u16, parent: Ino) -> Result<(Ino, InodeDesc)>;

    /// Loads the inode record `ino`, or fails with `ENOENT`.
    fn inode_get(&self, ino: Ino) -> Result<InodeDesc>;

    /// Persists the inode record `ino`.
    fn inode_set(&self, ino: Ino, desc: &InodeDesc) -> Result<()>;

    /// Releases the inode slot `ino` whose last record is `desc`.
    fn inode_free(&self, ino: Ino, desc: &InodeDesc) -> Result<()>;
}
