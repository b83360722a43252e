// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The smallest block size allowed by ext2.
pub const MIN_BLOCK_SIZE: usize = 1024;
/// The largest block size. A full-block directory record must fit `rec_len`.
pub const MAX_BLOCK_SIZE: usize = 32768;
/// The default capacity of the object table.
pub const DEFAULT_MAX_OBJECTS: usize = 512;

/// The tunables of an ext2 object layer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2Config {
    block_size: usize,
    max_objects: usize,
}

impl Ext2Config {
    /// Creates a config after checking both values.
    ///
    /// The block size must be a power of two within
    /// `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`, and the object table must hold
    /// at least one object.
    pub fn new(block_size: usize, max_objects: usize) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return_errno_with_message!(Errno::EINVAL, "unsupported block size");
        }
        if max_objects == 0 {
            return_errno_with_message!(Errno::EINVAL, "the object table cannot be empty");
        }
        Ok(Self {
            block_size,
            max_objects,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the maximum number of objects resident in the registry.
    pub fn max_objects(&self) -> usize {
        self.max_objects
    }
}

impl Default for Ext2Config {
    fn default() -> Self {
        Self {
            block_size: MIN_BLOCK_SIZE,
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }
}
