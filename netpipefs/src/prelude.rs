// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use std::{
    boxed::Box,
    collections::VecDeque,
    string::{String, ToString},
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    vec,
    vec::Vec,
};

pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::error::{Errno, Error};
pub(crate) use crate::{return_errno, return_errno_with_message};

pub type Result<T> = core::result::Result<T, Error>;
