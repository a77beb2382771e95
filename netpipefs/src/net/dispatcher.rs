// SPDX-License-Identifier: MPL-2.0

use std::{io, thread};

use crate::{
    net::frame::{self, Frame},
    pipe::PipeRegistry,
    prelude::*,
};

/// Spawns the thread that owns the receive half of the peer link.
///
/// The thread decodes one frame at a time and hands it to the engine entry
/// point for its path. It never waits on a user condvar; payload delivery
/// in `recv` completes without blocking. Any receive failure, including a
/// clean EOF, means the peer is gone: every pipe is force-exited and the
/// thread ends.
pub fn spawn(
    reader: Box<dyn io::Read + Send>,
    registry: Arc<PipeRegistry>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("netpipefs-dispatcher".into())
        .spawn(move || run(reader, registry))
}

fn run(mut reader: Box<dyn io::Read + Send>, registry: Arc<PipeRegistry>) {
    let reader = &mut *reader;
    loop {
        let frame = match frame::read_frame(reader) {
            Ok(frame) => frame,
            Err(e) => {
                info!("peer link closed: {}", e);
                break;
            }
        };
        trace!("recv frame {:?}", frame);
        if let Err(e) = dispatch(reader, &registry, frame) {
            warn!("frame dispatch failed: {}", e);
            break;
        }
    }
    registry.force_exit_all();
}

fn dispatch<R: io::Read + ?Sized>(
    reader: &mut R,
    registry: &PipeRegistry,
    frame: Frame,
) -> Result<()> {
    match frame {
        Frame::Open { path, mode } => {
            registry.open_update(&path, mode);
            Ok(())
        }
        Frame::Close { path, mode } => {
            registry.close_update(&path, mode);
            Ok(())
        }
        Frame::Write { path, len } | Frame::Flush { path, len } => match registry.get(&path) {
            Some(pipe) => pipe.recv(reader, len),
            None => {
                debug!("payload for unknown pipe {}, discarding", path);
                frame::discard_payload(reader, len)
            }
        },
        Frame::Read { path, len } => {
            if let Some(pipe) = registry.get(&path) {
                pipe.read_update(len)?;
            }
            Ok(())
        }
        Frame::ReadRequest { path, len } => {
            if let Some(pipe) = registry.get(&path) {
                pipe.read_request(len)?;
            }
            Ok(())
        }
    }
}
