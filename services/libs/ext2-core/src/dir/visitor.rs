// SPDX-License-Identifier: MPL-2.0

use super::DirEntryType;
use crate::prelude::*;

/// Receives the live records of a directory in on-disk order.
pub trait DirentVisitor {
    /// Visits the record of `name` at the directory byte `offset`.
    ///
    /// Returning an error stops `readdir_at` before the next entry. The entry
    /// that failed is not consumed, so reading resumes from its offset.
    fn visit(&mut self, name: &str, ino: Ino, type_: DirEntryType, offset: usize) -> Result<()>;
}

impl DirentVisitor for Vec<String> {
    fn visit(&mut self, name: &str, _ino: Ino, _type: DirEntryType, _offset: usize) -> Result<()> {
        self.push(name.into());
        Ok(())
    }
}

/// Counts the records of a directory other than "." and "..".
#[derive(Default)]
pub struct DirentCounter(usize);

impl DirentCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn count(&self) -> usize {
        self.0
    }
}

impl DirentVisitor for DirentCounter {
    fn visit(&mut self, name: &str, _ino: Ino, _type: DirEntryType, _offset: usize) -> Result<()> {
        if name != "." && name != ".." {
            self.0 += 1;
        }
        Ok(())
    }
}
