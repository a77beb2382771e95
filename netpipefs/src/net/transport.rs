// SPDX-License-Identifier: MPL-2.0

use std::{
    io::Write,
    sync::{Mutex, PoisonError},
};

use crate::{net::frame::Frame, prelude::*};

/// The send half of the peer link.
///
/// One mutex serializes frame emission: header and payload are written under
/// a single hold, so frames from different threads never interleave. The
/// receive half never lives here; it is owned by the dispatcher.
pub struct Transport {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl Transport {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Emits a frame with no payload (OPEN, CLOSE, READ, READ-REQUEST).
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        trace!("send frame {:?}", frame);
        self.send(&frame.encode(), &[])
    }

    /// Emits a WRITE or FLUSH frame whose payload is gathered from up to
    /// two slices, so a wrapped ring-buffer head never needs a staging copy.
    pub fn send_payload(&self, path: &str, flush: bool, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let frame = if flush {
            Frame::Flush {
                path: path.to_string(),
                len,
            }
        } else {
            Frame::Write {
                path: path.to_string(),
                len,
            }
        };
        trace!("send frame {:?}", frame);
        self.send(&frame.encode(), parts)
    }

    fn send(&self, header: &[u8], parts: &[&[u8]]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(header)?;
        for part in parts {
            writer.write_all(part)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::net::frame::read_frame;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn payload_parts_are_gathered_in_order() {
        let buf = SharedBuf::default();
        let transport = Transport::new(buf.clone());

        transport
            .send_payload("/p", false, &[b"he", b"llo"])
            .unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let mut cursor = io::Cursor::new(bytes);
        let frame = read_frame(&mut cursor).unwrap();
        assert_eq!(
            frame,
            Frame::Write {
                path: "/p".into(),
                len: 5
            }
        );
        let mut payload = [0u8; 5];
        io::Read::read_exact(&mut cursor, &mut payload).unwrap();
        assert_eq!(&payload, b"hello");
    }
}
