// SPDX-License-Identifier: MPL-2.0

//! The peer link: wire codec, serialized send half, pairing, and the
//! dispatcher owning the receive half.

pub mod connect;
pub mod dispatcher;
pub mod frame;
pub mod transport;
