// SPDX-License-Identifier: MPL-2.0

//! netpipefs: a mountable filesystem whose regular files behave like named
//! pipes stretched across a TCP link between two symmetric peers. Bytes
//! written into a file on one host come out of the same-named file on the
//! other.
//!
//! The crate splits into the per-file pipe engine ([`pipe`]), the peer link
//! ([`net`]), and the FUSE shim ([`fs`]). The engine is usable without a
//! mount, which is how the tests drive it.

pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod net;
pub mod pipe;
pub mod prelude;

pub use error::{Errno, Error};
pub use prelude::Result;
