// SPDX-License-Identifier: MPL-2.0

//! Directory records inside the blocks of a directory object.
//!
//! A directory is a sequence of blocks. Every block holds a run of records
//! starting at offset 0, and the record lengths of a block sum up to the
//! block size. Insertion only touches the last block. Removal keeps the
//! sequence free of empty blocks by moving the last block into the hole.

mod entry;
mod visitor;

pub(crate) use self::entry::check_name;
use self::entry::{
    min_rec_len, read_record, record_name, set_rec_len, write_record, DirEntryHeader, Records,
    HEADER_LEN,
};
pub use self::{
    entry::{DirEntry, DirEntryType},
    visitor::{DirentCounter, DirentVisitor},
};
use crate::{
    inode::FileType,
    object::{Object, ObjectGuard},
    prelude::*,
};

impl<'g> ObjectGuard<'g> {
    /// Returns the inode number recorded under `name`.
    pub fn find_entry(&mut self, name: &str) -> Result<Ino> {
        check_name(name)?;
        self.check_dir()?;

        let mut block = vec![0u8; self.block_size()];
        for idx in 0..self.dir_blocks() {
            self.read_dir_block(idx, &mut block)?;
            trace!("ext2: scan block {} of dir {} for {}", idx, self.ino(), name);
            if let Some((_, _, header)) = locate(&block, name)? {
                return Ok(header.ino());
            }
        }
        return_errno!(Errno::ENOENT)
    }

    /// Appends a record for `name` pointing at `ino`, whose mode is `mode`.
    ///
    /// The record goes into the tail of the last block, which grows the
    /// directory by one block if it does not fit.
    pub fn insert_entry(&mut self, name: &str, mode: u16, ino: Ino) -> Result<()> {
        check_name(name)?;
        self.check_dir()?;
        let type_ = DirEntryType::from(FileType::from_mode(mode)?);

        let block_size = self.block_size();
        let needed = min_rec_len(name.len());
        let nblocks = self.dir_blocks();
        let mut block = vec![0u8; block_size];

        let mut slot = None;
        if nblocks > 0 {
            let idx = nblocks - 1;
            self.read_dir_block(idx, &mut block)?;
            let mut last = None;
            for record in Records::new(&block) {
                last = Some(record?);
            }
            let Some((offset, header)) = last else {
                return_errno_with_message!(Errno::EUCLEAN, "directory block without records");
            };
            let used = header.used_len();
            let tail = header.rec_len() - used;
            if needed <= tail {
                if used > 0 {
                    set_rec_len(&mut block, offset, used);
                }
                slot = Some((idx, offset + used, tail));
            }
        }
        let (idx, offset, rec_len) = match slot {
            Some(slot) => slot,
            None => {
                block.fill(0);
                (nblocks, 0, block_size)
            }
        };

        write_record(&mut block, offset, rec_len, ino, name, type_);
        self.write_dir_block(idx, &block)?;
        debug!("ext2: inserted {} -> {} into dir {}", name, ino, self.ino());
        Ok(())
    }

    /// Removes the record of `name` and returns the inode number it pointed at.
    pub fn remove_entry(&mut self, name: &str) -> Result<Ino> {
        check_name(name)?;
        self.check_dir()?;

        let block_size = self.block_size();
        let nblocks = self.dir_blocks();
        let mut block = vec![0u8; block_size];
        for idx in 0..nblocks {
            self.read_dir_block(idx, &mut block)?;
            let Some((offset, prev, header)) = locate(&block, name)? else {
                continue;
            };

            match prev {
                Some((prev_offset, prev_header)) => {
                    let rec_len = prev_header.rec_len() + header.rec_len();
                    set_rec_len(&mut block, prev_offset, rec_len);
                    self.write_dir_block(idx, &block)?;
                }
                None if header.rec_len() == block_size => {
                    let last = nblocks - 1;
                    if idx != last {
                        self.read_dir_block(last, &mut block)?;
                        self.write_dir_block(idx, &block)?;
                    }
                    self.truncate(last * block_size as u64)?;
                }
                None => {
                    debug_assert_eq!(offset, 0);
                    let next_offset = header.rec_len();
                    let next = read_record(&block, next_offset)?;
                    let end = next_offset + HEADER_LEN + next.name_len();
                    block.copy_within(next_offset..end, 0);
                    set_rec_len(&mut block, 0, next_offset + next.rec_len());
                    self.write_dir_block(idx, &block)?;
                }
            }
            debug!("ext2: removed {} from dir {}", name, self.ino());
            return Ok(header.ino());
        }
        return_errno!(Errno::ENOENT)
    }

    /// Returns whether the directory holds nothing but "." and "..".
    ///
    /// A directory spanning more than one block is reported as `EBUSY`, and
    /// one not starting with "." and ".." as `EUCLEAN`.
    pub fn is_dir_empty(&mut self) -> Result<bool> {
        self.check_dir()?;
        match self.dir_blocks() {
            0 => return Ok(true),
            1 => {}
            _ => return_errno_with_message!(Errno::EBUSY, "directory spans several blocks"),
        }

        let block_size = self.block_size();
        let mut block = vec![0u8; block_size];
        self.read_dir_block(0, &mut block)?;

        let dot = read_record(&block, 0)?;
        if record_name(&block, 0, &dot) != b"." {
            return_errno_with_message!(Errno::EUCLEAN, "directory does not start with \".\"");
        }
        let dotdot_offset = dot.rec_len();
        if dotdot_offset >= block_size {
            return_errno_with_message!(Errno::EUCLEAN, "directory lacks \"..\"");
        }
        let dotdot = read_record(&block, dotdot_offset)?;
        if record_name(&block, dotdot_offset, &dotdot) != b".." {
            return_errno_with_message!(Errno::EUCLEAN, "directory lacks \"..\"");
        }
        Ok(dotdot_offset + dotdot.rec_len() == block_size)
    }

    /// Returns an iterator over the records from the directory byte `offset` on.
    pub fn entries_from(&mut self, offset: usize) -> DirEntryReader<'_, 'g> {
        DirEntryReader::new(self, offset)
    }

    /// Feeds the records from `offset` on to `visitor`.
    ///
    /// Returns the offset to continue from.
    pub fn readdir_at(&mut self, offset: usize, visitor: &mut dyn DirentVisitor) -> Result<usize> {
        self.check_dir()?;
        let mut reader = DirEntryReader::new(self, offset);
        let mut visited = false;
        loop {
            let Some(next) = reader.next() else {
                break;
            };
            let (entry_offset, entry) = next?;
            if let Err(err) = visitor.visit(&entry.name, entry.ino, entry.type_, entry_offset) {
                if !visited {
                    return Err(err);
                }
                return Ok(entry_offset);
            }
            visited = true;
        }
        Ok(reader.offset.max(offset))
    }

    fn check_dir(&self) -> Result<()> {
        if !self.desc().is_dir() {
            return_errno!(Errno::ENOTDIR);
        }
        Ok(())
    }

    fn dir_blocks(&self) -> u64 {
        self.desc().blocks_count(self.block_size())
    }

    fn read_dir_block(&mut self, idx: u64, block: &mut [u8]) -> Result<()> {
        let offset = idx * block.len() as u64;
        let len = self.read_at(offset, block)?;
        block[len..].fill(0);
        Ok(())
    }

    fn write_dir_block(&mut self, idx: u64, block: &[u8]) -> Result<()> {
        self.write_at(idx * block.len() as u64, block)
    }
}

/// The match of a name inside one block: its offset, the record before it
/// in the same block, and its header.
type Located = (usize, Option<(usize, DirEntryHeader)>, DirEntryHeader);

fn locate(block: &[u8], name: &str) -> Result<Option<Located>> {
    let mut prev = None;
    for record in Records::new(block) {
        let (offset, header) = record?;
        if !header.is_unused() && record_name(block, offset, &header) == name.as_bytes() {
            return Ok(Some((offset, prev, header)));
        }
        prev = Some((offset, header));
    }
    Ok(None)
}

/// A lazy walk over the records of a directory.
///
/// It yields each used record with its directory byte offset and can start
/// from any offset handed out earlier.
pub struct DirEntryReader<'a, 'g> {
    guard: &'a mut ObjectGuard<'g>,
    offset: usize,
    block: Vec<u8>,
    loaded: Option<usize>,
    /// Whether `offset` is known to sit on a record boundary.
    aligned: bool,
}

impl<'a, 'g> DirEntryReader<'a, 'g> {
    fn new(guard: &'a mut ObjectGuard<'g>, offset: usize) -> Self {
        let block = vec![0u8; guard.block_size()];
        Self {
            guard,
            offset,
            block,
            loaded: None,
            aligned: false,
        }
    }

    /// Returns the offset of the next record to read.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn stop(&mut self) {
        self.offset = usize::MAX;
    }
}

impl Iterator for DirEntryReader<'_, '_> {
    type Item = Result<(usize, DirEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let block_size = self.block.len();
        loop {
            if self.offset as u64 >= self.guard.desc().size {
                return None;
            }
            let idx = self.offset / block_size;
            let in_block = self.offset % block_size;
            if self.loaded != Some(idx) {
                if let Err(err) = self.guard.read_dir_block(idx as u64, &mut self.block) {
                    self.stop();
                    return Some(Err(err));
                }
                self.loaded = Some(idx);
            }

            if !self.aligned {
                self.aligned = true;
                // Move to the first record at or after the requested offset.
                let start = Records::new(&self.block).find_map(|record| match record {
                    Ok((offset, _)) if offset >= in_block => Some(Ok(offset)),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                });
                let start = match start {
                    Some(Ok(offset)) => offset,
                    Some(Err(err)) => {
                        self.stop();
                        return Some(Err(err));
                    }
                    None => block_size,
                };
                self.offset = idx * block_size + start;
                continue;
            }

            let header = match read_record(&self.block, in_block) {
                Ok(header) => header,
                Err(err) => {
                    self.stop();
                    return Some(Err(err));
                }
            };
            let offset = self.offset;
            self.offset += header.rec_len();
            if header.is_unused() {
                continue;
            }
            let name = String::from_utf8_lossy(record_name(&self.block, in_block, &header));
            let entry = DirEntry {
                ino: header.ino(),
                name: name.into_owned(),
                type_: DirEntryType::try_from(header.file_type).unwrap_or(DirEntryType::Unknown),
            };
            return Some(Ok((offset, entry)));
        }
    }
}

impl Object {
    /// Looks up `name` in this directory.
    pub fn find(&self, name: &str) -> Result<Ino> {
        self.lock().find_entry(name)
    }

    /// Adds a record for `name` to this directory.
    pub fn insert(&self, name: &str, mode: u16, ino: Ino) -> Result<()> {
        self.lock().insert_entry(name, mode, ino)
    }

    /// Removes the record for `name` from this directory.
    pub fn remove(&self, name: &str) -> Result<Ino> {
        self.lock().remove_entry(name)
    }

    pub fn is_empty_dir(&self) -> Result<bool> {
        self.lock().is_dir_empty()
    }

    pub fn readdir_at(&self, offset: usize, visitor: &mut dyn DirentVisitor) -> Result<usize> {
        self.lock().readdir_at(offset, visitor)
    }
}
