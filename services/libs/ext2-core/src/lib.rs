// SPDX-License-Identifier: MPL-2.0

//! The in-memory object layer and directory-record manager of an ext2 driver.
//!
//! An `ObjectRegistry` keeps at most one `Object` per on-disk inode and
//! bounds the number of resident objects with an LRU of unreferenced ones.
//! Directory objects store their records in whole blocks that are kept free
//! of holes. `Ext2Fs` composes both into lookup, link, unlink, mkdir, rmdir
//! and readdir over a `BlockStore`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub use self::{
    config::Ext2Config,
    dir::{DirEntry, DirEntryReader, DirEntryType, DirentCounter, DirentVisitor},
    error::{Errno, Error},
    fs::Ext2Fs,
    inode::{Bid, FilePerm, FileType, InodeDesc, Ino, ROOT_INO},
    mem_store::MemStore,
    object::{Object, ObjectFlags, ObjectGuard},
    registry::ObjectRegistry,
    store::BlockStore,
};

pub mod config;
pub mod error;
pub mod inode;
pub mod store;

mod block_map;
mod dir;
mod fs;
mod mem_store;
mod object;
mod prelude;
mod registry;

#[cfg(test)]
mod test;
