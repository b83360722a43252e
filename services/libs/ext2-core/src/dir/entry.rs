// SPDX-License-Identifier: MPL-2.0

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
    inode::{FileType, MAX_FNAME_LEN},
    prelude::*,
};

/// The little-endian header of a directory record. The name follows without padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct DirEntryHeader {
    ino: U32,
    rec_len: U16,
    name_len: u8,
    pub file_type: u8,
}

pub(crate) const HEADER_LEN: usize = core::mem::size_of::<DirEntryHeader>();

const _: () = assert!(HEADER_LEN == 8);

impl DirEntryHeader {
    pub fn ino(&self) -> Ino {
        self.ino.get()
    }

    /// Returns the bytes the record occupies, padding included.
    pub fn rec_len(&self) -> usize {
        self.rec_len.get() as usize
    }

    pub fn name_len(&self) -> usize {
        self.name_len as usize
    }

    /// Returns `true` if the record does not name an inode.
    pub fn is_unused(&self) -> bool {
        self.ino() == 0 || self.name_len == 0
    }

    /// Returns the bytes the record needs, or zero for an unused record.
    pub fn used_len(&self) -> usize {
        if self.is_unused() {
            0
        } else {
            min_rec_len(self.name_len())
        }
    }
}

/// The type tag stored in a directory record.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum DirEntryType {
    Unknown = 0,
    File = 1,
    Dir = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl From<FileType> for DirEntryType {
    fn from(file_type: FileType) -> Self {
        match file_type {
            FileType::Fifo => Self::Fifo,
            FileType::Char => Self::CharDevice,
            FileType::Dir => Self::Dir,
            FileType::Block => Self::BlockDevice,
            FileType::File => Self::File,
            FileType::Symlink => Self::Symlink,
            FileType::Socket => Self::Socket,
        }
    }
}

/// A directory record as handed to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub type_: DirEntryType,
}

/// Returns the size of the smallest record holding a name of `name_len` bytes.
pub(crate) fn min_rec_len(name_len: usize) -> usize {
    (HEADER_LEN + name_len).align_up(4)
}

/// Checks that `name` can be stored in a record.
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return_errno_with_message!(Errno::EINVAL, "empty file name");
    }
    if name.len() > MAX_FNAME_LEN {
        return_errno!(Errno::ENAMETOOLONG);
    }
    Ok(())
}

/// Parses the record at `offset` of `block`.
///
/// Fails with `EUCLEAN` if the record is truncated, or if its length is zero,
/// not a multiple of four or runs past the end of the block.
pub(crate) fn read_record(block: &[u8], offset: usize) -> Result<DirEntryHeader> {
    let Some(bytes) = block.get(offset..) else {
        return_errno_with_message!(Errno::EUCLEAN, "record offset beyond the block");
    };
    let (header, _) = DirEntryHeader::read_from_prefix(bytes)
        .map_err(|_| Error::with_message(Errno::EUCLEAN, "truncated directory record"))?;
    let rec_len = header.rec_len();
    if rec_len == 0 {
        return_errno_with_message!(Errno::EUCLEAN, "zero record length");
    }
    if rec_len % 4 != 0 {
        return_errno_with_message!(Errno::EUCLEAN, "misaligned record length");
    }
    if offset + rec_len > block.len() || HEADER_LEN + header.name_len() > rec_len {
        return_errno_with_message!(Errno::EUCLEAN, "record runs past the block end");
    }
    Ok(header)
}

/// Returns the name bytes of the record at `offset`.
pub(crate) fn record_name<'a>(
    block: &'a [u8],
    offset: usize,
    header: &DirEntryHeader,
) -> &'a [u8] {
    let start = offset + HEADER_LEN;
    &block[start..start + header.name_len()]
}

/// Overwrites the record length of the record at `offset`.
pub(crate) fn set_rec_len(block: &mut [u8], offset: usize, rec_len: usize) {
    let field = offset + core::mem::offset_of!(DirEntryHeader, rec_len);
    block[field..field + 2].copy_from_slice(U16::new(rec_len as u16).as_bytes());
}

/// Writes a whole record at `offset`.
pub(crate) fn write_record(
    block: &mut [u8],
    offset: usize,
    rec_len: usize,
    ino: Ino,
    name: &str,
    type_: DirEntryType,
) {
    let header = DirEntryHeader {
        ino: U32::new(ino),
        rec_len: U16::new(rec_len as u16),
        name_len: name.len() as u8,
        file_type: type_ as u8,
    };
    block[offset..offset + HEADER_LEN].copy_from_slice(header.as_bytes());
    let start = offset + HEADER_LEN;
    block[start..start + name.len()].copy_from_slice(name.as_bytes());
}

/// Walks the records of one directory block from its start.
pub(crate) struct Records<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> Records<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self { block, offset: 0 }
    }
}

impl Iterator for Records<'_> {
    /// The offset of a record inside the block and its header.
    type Item = Result<(usize, DirEntryHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.len() {
            return None;
        }
        match read_record(self.block, self.offset) {
            Ok(header) => {
                let offset = self.offset;
                self.offset += header.rec_len();
                Some(Ok((offset, header)))
            }
            Err(err) => {
                self.offset = self.block.len();
                Some(Err(err))
            }
        }
    }
}
