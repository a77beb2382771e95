// SPDX-License-Identifier: MPL-2.0

//! Encoding and decoding of the six wire frames.
//!
//! A frame is one kind byte followed by kind-specific fields. Paths are a
//! `u32` length plus UTF-8 bytes; payload and credit counts are a `u32`.
//! The peers run the same binary on both ends of the link, so fields travel
//! in native byte order.
//!
//! WRITE and FLUSH frames are followed by `len` raw payload bytes. The
//! decoder deliberately leaves them on the stream: the engine consumes them
//! straight into waiting requests or the ring buffer, without staging.

use std::io;

use crate::{pipe::PipeMode, prelude::*};

/// Longest path accepted off the wire.
const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Open = 1,
    Close = 2,
    Write = 3,
    Flush = 4,
    Read = 5,
    ReadRequest = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Close),
            3 => Ok(FrameKind::Write),
            4 => Ok(FrameKind::Flush),
            5 => Ok(FrameKind::Read),
            6 => Ok(FrameKind::ReadRequest),
            _ => Err(Error::with_message(Errno::EPROTO, "unknown frame kind")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The peer opened `path` in `mode`.
    Open { path: String, mode: PipeMode },
    /// The peer closed one handle on `path`.
    Close { path: String, mode: PipeMode },
    /// `len` payload bytes follow on the stream.
    Write { path: String, len: usize },
    /// Same as [`Frame::Write`]; emitted when the sender drains its own
    /// buffer. Kept distinct for tracing only.
    Flush { path: String, len: usize },
    /// The peer consumed `len` bytes from its receive buffer (credit
    /// return).
    Read { path: String, len: usize },
    /// The peer advertises willingness to accept `len` more bytes (credit
    /// grant).
    ReadRequest { path: String, len: usize },
}

impl Frame {
    /// Serializes the frame header. WRITE/FLUSH payload bytes are not part
    /// of the header; the transport appends them under the same send-lock
    /// hold.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, path, arg) = match self {
            Frame::Open { path, mode } => (FrameKind::Open, path, mode.as_wire() as u32),
            Frame::Close { path, mode } => (FrameKind::Close, path, mode.as_wire() as u32),
            Frame::Write { path, len } => (FrameKind::Write, path, *len as u32),
            Frame::Flush { path, len } => (FrameKind::Flush, path, *len as u32),
            Frame::Read { path, len } => (FrameKind::Read, path, *len as u32),
            Frame::ReadRequest { path, len } => (FrameKind::ReadRequest, path, *len as u32),
        };

        let mut buf = Vec::with_capacity(1 + 4 + path.len() + 4);
        buf.push(kind as u8);
        buf.extend_from_slice(&(path.len() as u32).to_ne_bytes());
        buf.extend_from_slice(path.as_bytes());
        match kind {
            FrameKind::Open | FrameKind::Close => buf.push(arg as u8),
            _ => buf.extend_from_slice(&arg.to_ne_bytes()),
        }
        buf
    }

    pub fn path(&self) -> &str {
        match self {
            Frame::Open { path, .. }
            | Frame::Close { path, .. }
            | Frame::Write { path, .. }
            | Frame::Flush { path, .. }
            | Frame::Read { path, .. }
            | Frame::ReadRequest { path, .. } => path,
        }
    }
}

/// Reads one frame header off the stream.
///
/// End of stream and short reads surface as `ECONNRESET`; the caller treats
/// both as peer disconnection.
pub fn read_frame<R: io::Read + ?Sized>(reader: &mut R) -> Result<Frame> {
    let kind = FrameKind::try_from(read_u8(reader)?)?;
    let path = read_path(reader)?;

    let frame = match kind {
        FrameKind::Open => Frame::Open {
            path,
            mode: PipeMode::from_wire(read_u8(reader)?)?,
        },
        FrameKind::Close => Frame::Close {
            path,
            mode: PipeMode::from_wire(read_u8(reader)?)?,
        },
        FrameKind::Write => Frame::Write {
            path,
            len: read_u32(reader)? as usize,
        },
        FrameKind::Flush => Frame::Flush {
            path,
            len: read_u32(reader)? as usize,
        },
        FrameKind::Read => Frame::Read {
            path,
            len: read_u32(reader)? as usize,
        },
        FrameKind::ReadRequest => Frame::ReadRequest {
            path,
            len: read_u32(reader)? as usize,
        },
    };
    Ok(frame)
}

/// Consumes and discards `len` payload bytes, keeping the stream framed.
/// Used when a WRITE/FLUSH arrives for a path with no local pipe.
pub fn discard_payload<R: io::Read + ?Sized>(reader: &mut R, len: usize) -> Result<()> {
    let mut scratch = [0u8; 1024];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(scratch.len());
        reader.read_exact(&mut scratch[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

fn read_u8<R: io::Read + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_u32<R: io::Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_ne_bytes(bytes))
}

fn read_path<R: io::Read + ?Sized>(reader: &mut R) -> Result<String> {
    let len = read_u32(reader)? as usize;
    if len > MAX_PATH_LEN {
        return_errno_with_message!(Errno::EPROTO, "path length exceeds the limit");
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::with_message(Errno::EPROTO, "path is not valid utf-8"))
}
