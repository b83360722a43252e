// SPDX-License-Identifier: MPL-2.0

//! Inode-relative block I/O over the direct and indirect block pointers.

use crate::{
    inode::{DIRECT_CNT, INDIRECT},
    object::{ObjectFlags, ObjectGuard},
    prelude::*,
    store::BlockStore,
};

/// The size of of the block id.
pub const BID_SIZE: usize = core::mem::size_of::<Bid>();

/// Represents the various ways in which a file block can be located.
///
/// The indices of the indirect variants are the positions inside the first,
/// second and third level tables. The first level table is the one referenced
/// from the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidPath {
    /// Direct reference to a block through the inode.
    Direct(usize),
    /// Single level of indirection.
    Indirect(usize),
    /// Double level of indirection.
    DbIndirect(usize, usize),
    /// Treble level of indirection.
    TbIndirect(usize, usize, usize),
}

impl BidPath {
    /// Locates the file block `file_bid` for a filesystem with `block_size` bytes per block.
    ///
    /// Returns `EFBIG` if the block is beyond the treble indirect range.
    pub fn new(file_bid: u64, block_size: usize) -> Result<Self> {
        let per_block = (block_size / BID_SIZE) as u64;
        let direct_cnt = DIRECT_CNT as u64;
        let db_cnt = per_block * per_block;
        let tb_cnt = db_cnt * per_block;

        let mut bid = file_bid;
        if bid < direct_cnt {
            return Ok(Self::Direct(bid as usize));
        }
        bid -= direct_cnt;
        if bid < per_block {
            return Ok(Self::Indirect(bid as usize));
        }
        bid -= per_block;
        if bid < db_cnt {
            return Ok(Self::DbIndirect(
                (bid / per_block) as usize,
                (bid % per_block) as usize,
            ));
        }
        bid -= db_cnt;
        if bid < tb_cnt {
            return Ok(Self::TbIndirect(
                (bid / db_cnt) as usize,
                ((bid / per_block) % per_block) as usize,
                (bid % per_block) as usize,
            ));
        }
        return_errno_with_message!(Errno::EFBIG, "file block beyond the treble indirect range")
    }

    /// Returns the level of the cached indirect block the path starts from,
    /// together with the table indices along the path. `None` for a direct block.
    fn indirect(&self) -> Option<(usize, Vec<usize>)> {
        match *self {
            Self::Direct(_) => None,
            Self::Indirect(a) => Some((0, vec![a])),
            Self::DbIndirect(a, b) => Some((1, vec![a, b])),
            Self::TbIndirect(a, b, c) => Some((2, vec![a, b, c])),
        }
    }
}

/// A cached top-level indirect block.
#[derive(Clone, Debug)]
pub(crate) struct IndirectBlock {
    bid: Bid,
    data: Box<[u8]>,
    dirty: bool,
}

impl IndirectBlock {
    fn load(store: &dyn BlockStore, bid: Bid) -> Result<Self> {
        let mut data = vec![0u8; store.block_size()].into_boxed_slice();
        store.read_block(bid, &mut data)?;
        Ok(Self {
            bid,
            data,
            dirty: false,
        })
    }

    /// Creates a table for a newly allocated block. It is dirty until written.
    fn zeroed(bid: Bid, block_size: usize) -> Self {
        Self {
            bid,
            data: vec![0u8; block_size].into_boxed_slice(),
            dirty: true,
        }
    }

    pub fn bid(&self) -> Bid {
        self.bid
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn read_bid(&self, idx: usize) -> Bid {
        table_entry(&self.data, idx)
    }

    /// Writes a bid at `idx` and marks the block dirty.
    pub fn write_bid(&mut self, idx: usize, bid: Bid) {
        set_table_entry(&mut self.data, idx, bid);
        self.dirty = true;
    }
}

fn table_entry(table: &[u8], idx: usize) -> Bid {
    let mut raw = [0u8; BID_SIZE];
    raw.copy_from_slice(&table[idx * BID_SIZE..(idx + 1) * BID_SIZE]);
    Bid::from_le_bytes(raw)
}

fn set_table_entry(table: &mut [u8], idx: usize, bid: Bid) {
    table[idx * BID_SIZE..(idx + 1) * BID_SIZE].copy_from_slice(&bid.to_le_bytes());
}

/// Fails with `EFBIG` if a file of `size` bytes needs a block beyond the
/// treble indirect range.
fn check_size(size: u64, block_size: usize) -> Result<()> {
    if size > 0 {
        BidPath::new((size - 1) / block_size as u64, block_size)?;
    }
    Ok(())
}

fn is_table_empty(table: &[u8]) -> bool {
    table.iter().all(|byte| *byte == 0)
}

/// A table below the top level, read through the store.
struct Table {
    bid: Bid,
    data: Vec<u8>,
}

impl ObjectGuard<'_> {
    /// Reads from the inode-relative `offset` into `buf`.
    ///
    /// Reading stops at the inode size. Holes read as zeros.
    /// Returns the number of bytes read.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.inner.desc.size;
        if offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let block_size = self.block_size();
        let object = self.object;
        let store = object.store();

        let mut done = 0;
        let mut block_buf = vec![0u8; block_size];
        while done < len {
            let pos = offset + done as u64;
            let file_bid = pos / block_size as u64;
            let in_block = (pos % block_size as u64) as usize;
            let n = (block_size - in_block).min(len - done);
            let dst = &mut buf[done..done + n];

            match self.lookup_block(file_bid)? {
                None => dst.fill(0),
                Some(bid) if n == block_size => store.read_block(bid, dst)?,
                Some(bid) => {
                    store.read_block(bid, &mut block_buf)?;
                    dst.copy_from_slice(&block_buf[in_block..in_block + n]);
                }
            }
            done += n;
        }
        Ok(len)
    }

    /// Writes `buf` at the inode-relative `offset`, allocating blocks as needed.
    ///
    /// The inode size grows to cover the written range.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let block_size = self.block_size();
        let Some(end) = offset.checked_add(buf.len() as u64) else {
            return_errno_with_message!(Errno::EFBIG, "write range overflows");
        };
        check_size(end, block_size)?;
        let object = self.object;
        let store = object.store();

        let mut done = 0;
        let mut block_buf = vec![0u8; block_size];
        while done < buf.len() {
            let pos = offset + done as u64;
            let file_bid = pos / block_size as u64;
            let in_block = (pos % block_size as u64) as usize;
            let n = (block_size - in_block).min(buf.len() - done);
            let src = &buf[done..done + n];

            let (bid, fresh) = self.map_block(file_bid)?;
            if n == block_size {
                store.write_block(bid, src)?;
            } else {
                if fresh {
                    block_buf.fill(0);
                } else {
                    store.read_block(bid, &mut block_buf)?;
                }
                block_buf[in_block..in_block + n].copy_from_slice(src);
                store.write_block(bid, &block_buf)?;
            }
            done += n;
        }

        let desc = self.desc_mut();
        if end > desc.size {
            desc.size = end;
        }
        Ok(())
    }

    /// Shrinks or grows the inode to `new_size`.
    ///
    /// Blocks at or beyond the new block count are freed, and so are the
    /// indirect tables left without entries.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        let block_size = self.block_size();
        check_size(new_size, block_size)?;
        let old_blocks = self.inner.desc.blocks_count(block_size);
        let new_blocks = new_size.div_ceil(block_size as u64);
        for file_bid in (new_blocks..old_blocks).rev() {
            self.free_block(file_bid)?;
        }
        self.desc_mut().size = new_size;
        Ok(())
    }

    /// Returns the device block of `file_bid`, or `None` for a hole.
    pub fn lookup_block(&mut self, file_bid: u64) -> Result<Option<Bid>> {
        let object = self.object;
        let store = object.store();
        let (level, indices) = match BidPath::new(file_bid, self.block_size())? {
            BidPath::Direct(idx) => return Ok(non_zero(self.inner.desc.block[idx])),
            path => path.indirect().unwrap_or_default(),
        };

        let Some(top) = self.top_block(level)? else {
            return Ok(None);
        };
        let mut bid = top.read_bid(indices[0]);
        for idx in &indices[1..] {
            if bid == 0 {
                return Ok(None);
            }
            let table = read_table(store, bid)?;
            bid = table_entry(&table.data, *idx);
        }
        Ok(non_zero(bid))
    }

    /// Returns the device block of `file_bid`, allocating it and any missing
    /// table on the way. The flag is set if the data block is new.
    fn map_block(&mut self, file_bid: u64) -> Result<(Bid, bool)> {
        let block_size = self.block_size();
        let object = self.object;
        let store = object.store();
        let ino = object.ino();

        let (level, indices) = match BidPath::new(file_bid, block_size)? {
            BidPath::Direct(idx) => {
                let bid = self.inner.desc.block[idx];
                if bid != 0 {
                    return Ok((bid, false));
                }
                let bid = store.alloc_block(ino)?;
                self.desc_mut().block[idx] = bid;
                return Ok((bid, true));
            }
            path => path.indirect().unwrap_or_default(),
        };

        if self.inner.desc.block[INDIRECT + level] == 0 {
            let bid = store.alloc_block(ino)?;
            self.inner.indirect[level] = Some(IndirectBlock::zeroed(bid, block_size));
            self.desc_mut().block[INDIRECT + level] = bid;
        }
        self.top_block(level)?;
        let Some(top) = self.inner.indirect[level].as_mut() else {
            return_errno_with_message!(Errno::EIO, "indirect block is not cached");
        };

        let last = indices.len() - 1;
        let mut bid = top.read_bid(indices[0]);
        let mut fresh = false;
        if bid == 0 {
            bid = store.alloc_block(ino)?;
            if last > 0 {
                store.write_block(bid, &vec![0u8; block_size])?;
            } else {
                fresh = true;
            }
            top.write_bid(indices[0], bid);
        }

        for (depth, idx) in indices.iter().enumerate().skip(1) {
            let mut table = read_table(store, bid)?;
            let entry = table_entry(&table.data, *idx);
            if entry != 0 {
                bid = entry;
                continue;
            }
            let new_bid = store.alloc_block(ino)?;
            if depth < last {
                store.write_block(new_bid, &vec![0u8; block_size])?;
            } else {
                fresh = true;
            }
            set_table_entry(&mut table.data, *idx, new_bid);
            store.write_block(table.bid, &table.data)?;
            bid = new_bid;
        }
        Ok((bid, fresh))
    }

    /// Frees the data block of `file_bid`, then every table that becomes empty.
    fn free_block(&mut self, file_bid: u64) -> Result<()> {
        let object = self.object;
        let store = object.store();

        let (level, indices) = match BidPath::new(file_bid, self.block_size())? {
            BidPath::Direct(idx) => {
                let bid = self.inner.desc.block[idx];
                if bid != 0 {
                    store.free_block(bid)?;
                    self.desc_mut().block[idx] = 0;
                }
                return Ok(());
            }
            path => path.indirect().unwrap_or_default(),
        };

        if self.top_block(level)?.is_none() {
            return Ok(());
        }
        let Some(top) = self.inner.indirect[level].as_mut() else {
            return Ok(());
        };

        // Collect the tables below the top level along the path.
        let mut tables: Vec<Table> = Vec::with_capacity(indices.len() - 1);
        let mut bid = top.read_bid(indices[0]);
        for idx in &indices[1..] {
            if bid == 0 {
                return Ok(());
            }
            let table = read_table(store, bid)?;
            bid = table_entry(&table.data, *idx);
            tables.push(table);
        }
        if bid == 0 {
            return Ok(());
        }
        store.free_block(bid)?;

        // Clear the entry bottom-up, freeing tables left empty.
        let mut child_freed = true;
        for (depth, table) in tables.iter_mut().enumerate().rev() {
            if !child_freed {
                break;
            }
            set_table_entry(&mut table.data, indices[depth + 1], 0);
            if is_table_empty(&table.data) {
                store.free_block(table.bid)?;
            } else {
                store.write_block(table.bid, &table.data)?;
                child_freed = false;
            }
        }
        if !child_freed {
            return Ok(());
        }

        top.write_bid(indices[0], 0);
        if is_table_empty(top.as_bytes()) {
            let top_bid = top.bid();
            store.free_block(top_bid)?;
            self.inner.indirect[level] = None;
            self.desc_mut().block[INDIRECT + level] = 0;
        }
        Ok(())
    }

    /// Returns the cached top-level indirect block of `level`, loading it on first use.
    fn top_block(&mut self, level: usize) -> Result<Option<&mut IndirectBlock>> {
        let bid = self.inner.desc.block[INDIRECT + level];
        if bid == 0 {
            self.inner.indirect[level] = None;
            return Ok(None);
        }
        let cached = self.inner.indirect[level]
            .as_ref()
            .is_some_and(|block| block.bid() == bid);
        if !cached {
            let object = self.object;
            let block = IndirectBlock::load(object.store(), bid)?;
            self.inner.indirect[level] = Some(block);
        }
        Ok(self.inner.indirect[level].as_mut())
    }

    /// Returns `true` if the object carries dirty cached indirect blocks.
    pub fn has_dirty_buffers(&self) -> bool {
        !self.inner.flags.contains(ObjectFlags::MOUNT)
            && self
                .inner
                .indirect
                .iter()
                .flatten()
                .any(|block| block.is_dirty())
    }
}

fn read_table(store: &dyn BlockStore, bid: Bid) -> Result<Table> {
    let mut data = vec![0u8; store.block_size()];
    store.read_block(bid, &mut data)?;
    Ok(Table { bid, data })
}

fn non_zero(bid: Bid) -> Option<Bid> {
    (bid != 0).then_some(bid)
}
