// SPDX-License-Identifier: MPL-2.0

//! The in-memory copy of an on-disk inode record.

use crate::prelude::*;

/// The inode number. Zero never names an inode.
pub type Ino = u32;
/// The device block number. Zero marks an unallocated block.
pub type Bid = u32;

/// The inode number of the root directory.
pub const ROOT_INO: Ino = 2;
/// Max length of file name.
pub const MAX_FNAME_LEN: usize = 255;

/// Direct pointers to blocks.
pub const DIRECT_CNT: usize = 12;
/// The index of the indirect pointer.
pub const INDIRECT: usize = DIRECT_CNT;
/// The index of the doubly indirect pointer.
pub const DB_INDIRECT: usize = INDIRECT + 1;
/// The index of the trebly indirect pointer.
pub const TB_INDIRECT: usize = DB_INDIRECT + 1;
/// The number of block pointers.
pub const BLOCK_PTR_CNT: usize = TB_INDIRECT + 1;

const TYPE_MASK: u16 = 0o170000;

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum FileType {
    /// FIFO special file
    Fifo = 0o010000,
    /// Character device
    Char = 0o020000,
    /// Directory
    Dir = 0o040000,
    /// Block device
    Block = 0o060000,
    /// Regular file
    File = 0o100000,
    /// Symbolic link
    Symlink = 0o120000,
    /// Socket
    Socket = 0o140000,
}

impl FileType {
    /// Parses the type bits of `mode`.
    ///
    /// A mode without type bits describes a regular file.
    pub fn from_mode(mode: u16) -> Result<Self> {
        let bits = mode & TYPE_MASK;
        if bits == 0 {
            return Ok(Self::File);
        }
        Self::try_from(bits).map_err(|_| Error::with_message(Errno::EINVAL, "invalid file type"))
    }
}

bitflags! {
    pub struct FilePerm: u16 {
        /// set-user-ID
        const S_ISUID = 0o4000;
        /// set-group-ID
        const S_ISGID = 0o2000;
        /// sticky bit
        const S_ISVTX = 0o1000;
        /// read by owner
        const S_IRUSR = 0o0400;
        /// write by owner
        const S_IWUSR = 0o0200;
        /// execute/search by owner
        const S_IXUSR = 0o0100;
        /// read by group
        const S_IRGRP = 0o0040;
        /// write by group
        const S_IWGRP = 0o0020;
        /// execute/search by group
        const S_IXGRP = 0o0010;
        /// read by others
        const S_IROTH = 0o0004;
        /// write by others
        const S_IWOTH = 0o0002;
        /// execute/search by others
        const S_IXOTH = 0o0001;
    }
}

/// The inode record as the object layer sees it.
///
/// The byte layout on disk is owned by the block store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InodeDesc {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    pub flags: u32,
    pub block: [Bid; BLOCK_PTR_CNT],
}

impl InodeDesc {
    /// Creates an empty inode record with `mode`.
    pub fn new(mode: u16) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> Result<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn file_perm(&self) -> FilePerm {
        FilePerm::from_bits_truncate(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & TYPE_MASK == FileType::Dir as u16
    }

    /// Returns the number of file blocks spanned by `size`.
    pub fn blocks_count(&self, block_size: usize) -> u64 {
        self.size.div_ceil(block_size as u64)
    }
}
