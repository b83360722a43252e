// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::String,
    sync::Arc,
    vec,
    vec::Vec,
};
pub(crate) use core::fmt::Debug;

pub(crate) use align_ext::AlignExt;
pub(crate) use bitflags::bitflags;
pub(crate) use int_to_c_enum::TryFromInt;
pub(crate) use log::{debug, error, trace, warn};
pub(crate) use spin::{Mutex, MutexGuard};

pub(crate) use crate::{
    error::{Errno, Error, Result},
    inode::{Bid, Ino},
    return_errno, return_errno_with_message,
};
