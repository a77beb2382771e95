// SPDX-License-Identifier: MPL-2.0

//! The per-file pipe engine.
//!
//! A [`NetPipe`] exists once per path open on this peer. Local writers push
//! bytes toward the peer under a credit limit (`remote_max` minus
//! `remote_size`), overflowing into a local ring buffer; the dispatcher
//! delivers arriving bytes to parked readers or buffers them ahead of the
//! next read. Suspended calls park as owned request nodes on per-direction
//! FIFOs and sleep on one of three condvars while the single pipe mutex is
//! released.
//!
//! Lock order is registry, then pipe mutex, then the transport send lock. A
//! holder of the pipe mutex may emit a frame; the dispatcher takes the pipe
//! mutex only after reading a frame header with no lock held.

mod registry;
mod request;

use std::{fmt, io, sync::PoisonError};

pub use registry::PipeRegistry;
use ring_buffer::RingBuffer;

use crate::{
    events::{IoEvents, PollObserver},
    net::{frame::Frame, transport::Transport},
    prelude::*,
};
use request::{IoRequest, RequestQueue};

/// The direction a handle opens a pipe in. A path carries bytes one way;
/// whichever peer opens it for writing owns the sending end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    Read,
    Write,
}

impl PipeMode {
    pub(crate) fn as_wire(self) -> u8 {
        match self {
            PipeMode::Read => b'R',
            PipeMode::Write => b'W',
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            b'R' => Ok(PipeMode::Read),
            b'W' => Ok(PipeMode::Write),
            _ => Err(Error::with_message(Errno::EPROTO, "unknown open mode")),
        }
    }
}

/// A diagnostic snapshot of a pipe's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeState {
    pub buffered: usize,
    pub remote_max: usize,
    pub remote_size: usize,
    pub readers: usize,
    pub writers: usize,
}

pub struct NetPipe {
    path: String,
    transport: Arc<Transport>,
    inner: Mutex<PipeInner>,
    /// Wakes blocking opens when a participant appears.
    can_open: Condvar,
    /// Wakes parked readers when their request completes or fails.
    readable: Condvar,
    /// Wakes parked writers when their request completes or fails.
    writable: Condvar,
}

struct PipeInner {
    buffer: RingBuffer,
    /// Bytes the peer is currently willing to buffer for us.
    remote_max: usize,
    /// Bytes sent that the peer has not yet drained.
    remote_size: usize,
    readers: usize,
    writers: usize,
    /// Local handles only. The merged counters above mirror the peer too,
    /// but once the link dies no CLOSE will ever arrive for the remote
    /// share, so teardown decisions go by these.
    local_readers: usize,
    local_writers: usize,
    /// The mode local handles hold, if any. Remote participants only move
    /// the counters.
    open_mode: Option<PipeMode>,
    /// Sticky teardown flag; every waiter re-checks it on wakeup.
    force_exit: bool,
    /// Set under the registry and pipe locks when the entry is unlinked, so
    /// an opener that raced the last closer can tell it holds an orphan.
    detached: bool,
    rd_req: RequestQueue,
    wr_req: RequestQueue,
    poll_handles: Vec<Box<dyn PollObserver>>,
    next_req_id: u64,
}

impl PipeInner {
    fn remote_avail(&self) -> usize {
        // Saturating: a misbehaving peer must not wrap this into a huge
        // credit.
        self.remote_max.saturating_sub(self.remote_size)
    }

    fn alloc_req_id(&mut self) -> u64 {
        self.next_req_id += 1;
        self.next_req_id
    }

    fn current_events(&self) -> IoEvents {
        match self.open_mode {
            Some(PipeMode::Read) => {
                if !self.buffer.is_empty() || self.writers > 0 {
                    IoEvents::IN
                } else {
                    IoEvents::HUP
                }
            }
            Some(PipeMode::Write) => {
                if self.readers == 0 {
                    IoEvents::ERR
                } else if self.remote_avail() + self.buffer.free_len() > 0 {
                    IoEvents::OUT
                } else {
                    IoEvents::empty()
                }
            }
            None => IoEvents::empty(),
        }
    }

    /// Fires and releases every registered poll handle. Each handle gets at
    /// most one notification; re-polling re-registers.
    fn notify_poll_handles(&mut self) {
        if self.poll_handles.is_empty() {
            return;
        }
        let events = self.current_events();
        for observer in self.poll_handles.drain(..) {
            observer.on_events(events);
        }
    }
}

impl NetPipe {
    fn new(
        path: &str,
        transport: Arc<Transport>,
        local_capacity: usize,
        remote_capacity: usize,
    ) -> Self {
        Self {
            path: path.to_string(),
            transport,
            inner: Mutex::new(PipeInner {
                buffer: RingBuffer::new(local_capacity),
                // The handshake told us how much the peer will buffer;
                // READ-REQUEST frames extend this, READ frames shrink it.
                remote_max: remote_capacity,
                remote_size: 0,
                readers: 0,
                writers: 0,
                local_readers: 0,
                local_writers: 0,
                open_mode: None,
                force_exit: false,
                detached: false,
                rd_req: RequestQueue::default(),
                wr_req: RequestQueue::default(),
                poll_handles: Vec::new(),
                next_req_id: 0,
            }),
            can_open: Condvar::new(),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> PipeState {
        let inner = self.lock();
        PipeState {
            buffered: inner.buffer.len(),
            remote_max: inner.remote_max,
            remote_size: inner.remote_size,
            readers: inner.readers,
            writers: inner.writers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, PipeInner>,
    ) -> MutexGuard<'a, PipeInner> {
        cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes bytes toward the peer.
    ///
    /// Bytes go onto the wire up to the current credit, then into the local
    /// buffer up to its free space. With `nonblock` the accepted count (or
    /// `EAGAIN`) comes back immediately; otherwise the call parks until the
    /// remainder is accepted, the peer disappears (`EPIPE`), or the link
    /// dies.
    pub fn send(&self, buf: &[u8], nonblock: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inner = self.lock();
        if inner.force_exit || inner.readers == 0 {
            return_errno_with_message!(Errno::EPIPE, "the read side is gone");
        }

        let mut sent = 0;
        // An already-parked writer owns the FIFO head; bytes offered while
        // the queue is non-empty must line up behind it.
        if !inner.wr_req.has_pending() {
            self.flush_buffered(&mut inner)?;
            if inner.buffer.is_empty() {
                let direct = buf.len().min(inner.remote_avail());
                if direct > 0 {
                    self.transport
                        .send_payload(&self.path, false, &[&buf[..direct]])?;
                    inner.remote_size += direct;
                    sent = direct;
                }
            }
            if sent < buf.len() {
                sent += inner.buffer.push_slice(&buf[sent..]);
            }
        }

        if sent == buf.len() || nonblock {
            if sent == 0 {
                return_errno_with_message!(Errno::EAGAIN, "no credit and no buffer space");
            }
            return Ok(sent);
        }

        let id = inner.alloc_req_id();
        inner.wr_req.enqueue(IoRequest::write(id, buf[sent..].to_vec()));
        loop {
            inner = self.wait(&self.writable, inner);
            if let Some(req) = inner.wr_req.take_done(id) {
                return write_outcome(sent, req.progress, req.error);
            }
            if inner.force_exit {
                let progress = inner
                    .wr_req
                    .take_anywhere(id)
                    .map(|req| req.progress)
                    .unwrap_or(0);
                return write_outcome(sent, progress, Some(Errno::EPIPE));
            }
        }
    }

    /// Reads bytes sent by the peer.
    ///
    /// Buffered bytes are taken first, returning credit to the peer for
    /// every byte drained. A blocking call that is not fully satisfied parks
    /// a request for the remainder and advertises that much new credit; it
    /// wakes when the request fills, the writer vanishes (clean EOF), or the
    /// link dies.
    pub fn read(&self, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inner = self.lock();
        if inner.force_exit {
            return_errno_with_message!(Errno::EPIPE, "pipe torn down");
        }

        let mut got = 0;
        // Same FIFO rule as writes: bytes already promised to a parked
        // reader cannot be stolen by a newcomer.
        if !inner.rd_req.has_pending() {
            got = inner.buffer.pop_slice(buf);
            if got > 0 {
                // Credit returns for drained bytes may unblock peer writers.
                if let Err(e) = self.transport.send_frame(&Frame::Read {
                    path: self.path.clone(),
                    len: got,
                }) {
                    warn!("credit return for {} failed: {}", self.path, e);
                }
            }
        }

        if got == buf.len() || nonblock {
            if got == 0 {
                if inner.writers == 0 {
                    return Ok(0);
                }
                return_errno_with_message!(Errno::EAGAIN, "nothing buffered");
            }
            return Ok(got);
        }
        if inner.writers == 0 {
            return Ok(got);
        }

        let want = buf.len() - got;
        let id = inner.alloc_req_id();
        inner.rd_req.enqueue(IoRequest::read(id, want));
        if let Err(e) = self.transport.send_frame(&Frame::ReadRequest {
            path: self.path.clone(),
            len: want,
        }) {
            inner.rd_req.take_anywhere(id);
            if got == 0 {
                return Err(e);
            }
            return Ok(got);
        }

        loop {
            inner = self.wait(&self.readable, inner);
            if let Some(req) = inner.rd_req.take_done(id) {
                let filled = req.progress;
                buf[got..got + filled].copy_from_slice(&req.buf[..filled]);
                return read_outcome(got, filled, req.error);
            }
            if inner.force_exit {
                if let Some(req) = inner.rd_req.take_anywhere(id) {
                    let filled = req.progress;
                    buf[got..got + filled].copy_from_slice(&req.buf[..filled]);
                    return Ok(got + filled);
                }
                return Ok(got);
            }
        }
    }

    /// Delivers `size` payload bytes that arrived on the transport.
    ///
    /// Called by the dispatcher with the frame header already consumed. The
    /// payload is drained without ever waiting on a user thread: first the
    /// buffer feeds parked readers (FIFO with earlier arrivals), then the
    /// transport feeds them directly, and the remainder is buffered ahead
    /// of the next read.
    pub fn recv<R: io::Read + ?Sized>(&self, reader: &mut R, size: usize) -> Result<()> {
        let mut inner = self.lock();
        let mut remaining = size;
        let mut wakeup = false;

        loop {
            if inner.buffer.is_empty() || !inner.rd_req.has_pending() {
                break;
            }
            let (drained, completed) = {
                let PipeInner {
                    buffer, rd_req, ..
                } = &mut *inner;
                let Some(req) = rd_req.head_mut() else { break };
                let drained = buffer.pop_slice(req.unfilled());
                req.progress += drained;
                (drained, req.is_complete())
            };
            if drained == 0 {
                break;
            }
            // These bytes leave the buffer just like a user read; the peer
            // reclaims their credit the same way.
            self.transport.send_frame(&Frame::Read {
                path: self.path.clone(),
                len: drained,
            })?;
            if completed {
                inner.rd_req.retire_head();
                wakeup = true;
            }
        }

        while remaining > 0 && inner.buffer.is_empty() && inner.rd_req.has_pending() {
            let (delivered, completed) = {
                let Some(req) = inner.rd_req.head_mut() else { break };
                let chunk = req.unfilled().len().min(remaining);
                if chunk == 0 {
                    break;
                }
                reader.read_exact(&mut req.unfilled()[..chunk])?;
                req.progress += chunk;
                (chunk, req.is_complete())
            };
            remaining -= delivered;
            self.transport.send_frame(&Frame::Read {
                path: self.path.clone(),
                len: delivered,
            })?;
            if completed {
                inner.rd_req.retire_head();
                wakeup = true;
            }
        }

        if remaining > 0 {
            let stored = inner.buffer.read_from(reader, remaining)?;
            if stored != remaining {
                // The peer overran the capacity we advertised, or the
                // stream died inside the payload. Either way the link is no
                // longer trustworthy.
                warn!(
                    "payload for {} overran the receive buffer by {} bytes",
                    self.path,
                    remaining - stored
                );
                self.force_exit_locked(&mut inner);
                return_errno_with_message!(Errno::EPROTO, "payload overran the receive buffer");
            }
        }

        if wakeup {
            self.readable.notify_all();
        }
        inner.notify_poll_handles();
        Ok(())
    }

    /// Peer READ-REQUEST: the peer grants `size` bytes of new credit.
    pub fn read_request(&self, size: usize) -> Result<()> {
        let mut inner = self.lock();
        inner.remote_max += size;
        let moved = self.send_data_locked(&mut inner)?;
        if moved {
            self.writable.notify_all();
        }
        Ok(())
    }

    /// Peer READ: the peer drained `size` bytes from its receive buffer.
    pub fn read_update(&self, size: usize) -> Result<()> {
        let mut inner = self.lock();
        if size > inner.remote_size {
            warn!("credit return for {} exceeds outstanding bytes", self.path);
        }
        inner.remote_max = inner.remote_max.saturating_sub(size);
        inner.remote_size = inner.remote_size.saturating_sub(size);
        self.send_data_locked(&mut inner)?;
        self.writable.notify_all();
        Ok(())
    }

    /// Pushes everything currently buffered toward the peer.
    ///
    /// The fast path emits one FLUSH frame up to the current credit. If
    /// bytes remain and the call may block, the remainder is staged into a
    /// write request at the head of the queue (those bytes are older than
    /// anything already parked) and the call waits like a writer.
    pub fn flush(&self, nonblock: bool) -> Result<usize> {
        let mut inner = self.lock();
        if inner.force_exit || inner.readers == 0 {
            return_errno_with_message!(Errno::EPIPE, "the read side is gone");
        }

        let flushed = self.flush_buffered(&mut inner)?;
        if inner.buffer.is_empty() {
            return Ok(flushed);
        }
        if nonblock {
            if flushed == 0 {
                return_errno_with_message!(Errno::EAGAIN, "no credit to flush against");
            }
            return Ok(flushed);
        }

        let rest = inner.buffer.len();
        let mut staging = vec![0u8; rest];
        inner.buffer.pop_slice(&mut staging);
        let id = inner.alloc_req_id();
        inner.wr_req.enqueue_front(IoRequest::write(id, staging));

        loop {
            inner = self.wait(&self.writable, inner);
            if let Some(req) = inner.wr_req.take_done(id) {
                return write_outcome(flushed, req.progress, req.error);
            }
            if inner.force_exit {
                let progress = inner
                    .wr_req
                    .take_anywhere(id)
                    .map(|req| req.progress)
                    .unwrap_or(0);
                return write_outcome(flushed, progress, Some(Errno::EPIPE));
            }
        }
    }

    /// Registers a poll observer and reports the current events.
    ///
    /// The observer fires once, on the first state change after
    /// registration, and is then forgotten.
    pub fn poll(&self, observer: Option<Box<dyn PollObserver>>) -> IoEvents {
        let mut inner = self.lock();
        let events = inner.current_events();
        if let Some(observer) = observer {
            inner.poll_handles.push(observer);
        }
        events
    }

    /// Marks the pipe dead and drains every waiter. Idempotent.
    pub fn force_exit(&self) {
        let mut inner = self.lock();
        self.force_exit_locked(&mut inner);
    }

    fn force_exit_locked(&self, inner: &mut PipeInner) {
        if inner.force_exit {
            return;
        }
        debug!("force exit on {}", self.path);
        inner.force_exit = true;
        self.can_open.notify_all();
        self.readable.notify_all();
        self.writable.notify_all();
        inner.notify_poll_handles();
    }

    /// Peer OPEN: mirror the new participant and wake blocking opens.
    pub(crate) fn open_remote(&self, mode: PipeMode) {
        let mut inner = self.lock();
        match mode {
            PipeMode::Read => inner.readers += 1,
            PipeMode::Write => inner.writers += 1,
        }
        self.can_open.notify_all();
    }

    /// Local close. Flushes first when the last writer leaves, then tells
    /// the peer. Registry removal is the caller's job (lock order).
    pub(crate) fn close_local(&self, mode: PipeMode) -> Result<usize> {
        let mut inner = self.lock();
        let mut flushed = 0;
        match mode {
            PipeMode::Write => {
                inner.writers = inner.writers.saturating_sub(1);
                inner.local_writers = inner.local_writers.saturating_sub(1);
                if inner.open_mode == Some(PipeMode::Write) && inner.writers == 0 {
                    inner.open_mode = None;
                }
                let must_flush = inner.writers == 0
                    && !inner.buffer.is_empty()
                    && inner.readers > 0
                    && !inner.force_exit;
                if must_flush {
                    drop(inner);
                    match self.flush(false) {
                        Ok(n) => flushed = n,
                        Err(e) => debug!("final flush of {} failed: {}", self.path, e),
                    }
                    inner = self.lock();
                }
            }
            PipeMode::Read => {
                inner.readers = inner.readers.saturating_sub(1);
                inner.local_readers = inner.local_readers.saturating_sub(1);
                if inner.open_mode == Some(PipeMode::Read) && inner.readers == 0 {
                    inner.open_mode = None;
                }
            }
        }
        let sent = if inner.force_exit {
            // The link is gone; there is nobody to tell.
            Ok(())
        } else {
            self.transport.send_frame(&Frame::Close {
                path: self.path.clone(),
                mode,
            })
        };
        drop(inner);
        if let Err(e) = sent {
            warn!("close frame for {} failed: {}", self.path, e);
        }
        Ok(flushed)
    }

    /// Peer CLOSE: mirror the departure and fail whoever was waiting on the
    /// side that just vanished. Registry removal is the caller's job.
    pub(crate) fn close_remote(&self, mode: PipeMode) {
        let mut inner = self.lock();
        match mode {
            PipeMode::Write => {
                inner.writers = inner.writers.saturating_sub(1);
                if inner.writers == 0 {
                    // Parked reads end at EOF with whatever they got.
                    inner.rd_req.fail_all(Errno::EPIPE);
                    self.readable.notify_all();
                }
            }
            PipeMode::Read => {
                inner.readers = inner.readers.saturating_sub(1);
                if inner.readers == 0 {
                    inner.wr_req.fail_all(Errno::EPIPE);
                    self.writable.notify_all();
                }
            }
        }
        inner.notify_poll_handles();
    }

    /// Marks the pipe detached if it has no participants left, reporting
    /// whether it did. After a forced exit the peer's mirrored counts are
    /// stuck, so only local handles matter then. The registry calls this
    /// while holding the map lock, right before unlinking the entry.
    fn try_detach(&self) -> bool {
        let mut inner = self.lock();
        let idle = if inner.force_exit {
            inner.local_readers == 0 && inner.local_writers == 0
        } else {
            inner.readers == 0 && inner.writers == 0
        };
        if idle {
            inner.detached = true;
        }
        idle
    }

    fn undo_open(&self, inner: &mut PipeInner, mode: PipeMode) {
        let count = match mode {
            PipeMode::Read => {
                inner.readers = inner.readers.saturating_sub(1);
                inner.local_readers = inner.local_readers.saturating_sub(1);
                inner.readers
            }
            PipeMode::Write => {
                inner.writers = inner.writers.saturating_sub(1);
                inner.local_writers = inner.local_writers.saturating_sub(1);
                inner.writers
            }
        };
        if count == 0 && inner.open_mode == Some(mode) {
            inner.open_mode = None;
        }
    }

    /// Emits one FLUSH frame carrying up to `min(buffered, credit)` bytes
    /// drawn from the buffer head. Returns the number of bytes moved.
    fn flush_buffered(&self, inner: &mut PipeInner) -> Result<usize> {
        let count = inner.buffer.len().min(inner.remote_avail());
        if count == 0 {
            return Ok(0);
        }

        {
            let (first, second) = inner.buffer.as_slices();
            let head = count.min(first.len());
            if head < count {
                self.transport.send_payload(
                    &self.path,
                    true,
                    &[&first[..head], &second[..count - head]],
                )?;
            } else {
                self.transport
                    .send_payload(&self.path, true, &[&first[..head]])?;
            }
        }

        inner.buffer.skip(count);
        inner.remote_size += count;
        self.writable.notify_all();
        Ok(count)
    }

    /// Opportunistically pushes whatever can go out now: buffered bytes up
    /// to the credit, then parked write requests onto the wire, then parked
    /// write requests into buffer space. Returns whether anything moved.
    fn send_data_locked(&self, inner: &mut PipeInner) -> Result<bool> {
        let mut moved = self.flush_buffered(inner)? > 0;

        loop {
            let avail = inner.remote_avail();
            if avail == 0 || !inner.wr_req.has_pending() {
                break;
            }
            let (count, sent) = {
                let Some(req) = inner.wr_req.head_mut() else { break };
                let count = req.remaining().len().min(avail);
                let part = &req.remaining()[..count];
                (
                    count,
                    self.transport.send_payload(&self.path, false, &[part]),
                )
            };
            match sent {
                Ok(()) => {
                    inner.remote_size += count;
                    moved = true;
                    let completed = {
                        let Some(req) = inner.wr_req.head_mut() else { break };
                        req.progress += count;
                        req.is_complete()
                    };
                    if completed {
                        inner.wr_req.retire_head();
                        self.writable.notify_all();
                    }
                }
                Err(e) => {
                    if let Some(req) = inner.wr_req.head_mut() {
                        req.error = Some(Errno::ECONNRESET);
                    }
                    inner.wr_req.retire_head();
                    self.writable.notify_all();
                    return Err(e);
                }
            }
        }

        loop {
            if inner.buffer.is_full() {
                break;
            }
            let PipeInner {
                buffer, wr_req, ..
            } = &mut *inner;
            let Some(req) = wr_req.head_mut() else { break };
            let accepted = buffer.push_slice(req.remaining());
            if accepted == 0 {
                break;
            }
            req.progress += accepted;
            moved = true;
            if req.is_complete() {
                wr_req.retire_head();
                self.writable.notify_all();
            }
        }

        if moved {
            inner.notify_poll_handles();
        }
        Ok(moved)
    }
}

impl fmt::Debug for NetPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetPipe")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// The write-side wake discipline: a zero-progress failure surfaces the
/// error (`EPIPE` by default), any progress surfaces the count.
fn write_outcome(sent: usize, progress: usize, error: Option<Errno>) -> Result<usize> {
    if progress == 0 {
        if let Some(errno) = error {
            return Err(errno.into());
        }
    }
    Ok(sent + progress)
}

/// The read-side discipline differs in one way: a request failed with
/// `EPIPE` is a clean EOF, not an error.
fn read_outcome(got: usize, filled: usize, error: Option<Errno>) -> Result<usize> {
    if filled == 0 {
        match error {
            Some(Errno::EPIPE) => return Ok(got),
            Some(errno) if got == 0 => return Err(errno.into()),
            _ => {}
        }
    }
    Ok(got + filled)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn test_registry(local_capacity: usize, remote_capacity: usize) -> Arc<PipeRegistry> {
        let transport = Arc::new(Transport::new(io::sink()));
        Arc::new(PipeRegistry::new(transport, local_capacity, remote_capacity))
    }

    #[test]
    fn opposite_local_mode_is_rejected() {
        let registry = test_registry(8, 8);
        registry.open_update("/z", PipeMode::Write);
        let pipe = registry.open("/z", PipeMode::Read, true).unwrap();
        assert_eq!(pipe.state().readers, 1);

        let err = registry.open("/z", PipeMode::Write, true).unwrap_err();
        assert_eq!(err.error(), Errno::EPERM);
    }

    #[test]
    fn nonblocking_open_races_the_peer() {
        let registry = test_registry(8, 8);
        let err = registry.open("/y", PipeMode::Write, true).unwrap_err();
        assert_eq!(err.error(), Errno::EAGAIN);
        // The undone open leaves nothing behind.
        assert!(registry.get("/y").is_none());

        registry.open_update("/y", PipeMode::Read);
        let pipe = registry.open("/y", PipeMode::Write, true).unwrap();
        assert_eq!(pipe.state().writers, 1);
        assert_eq!(pipe.state().readers, 1);
    }

    #[test]
    fn write_fills_credit_then_buffer_then_eagain() {
        let registry = test_registry(8, 8);
        registry.open_update("/w", PipeMode::Read);
        let pipe = registry.open("/w", PipeMode::Write, true).unwrap();

        // 8 bytes ride the wire on peer credit, 8 more are written ahead.
        assert_eq!(pipe.send(&[7u8; 20], true).unwrap(), 16);
        let state = pipe.state();
        assert_eq!(state.remote_size, 8);
        assert_eq!(state.buffered, 8);

        let err = pipe.send(&[7u8; 1], true).unwrap_err();
        assert_eq!(err.error(), Errno::EAGAIN);
    }

    #[test]
    fn credit_algebra_over_read_and_read_request() {
        let registry = test_registry(8, 8);
        registry.open_update("/c", PipeMode::Read);
        let pipe = registry.open("/c", PipeMode::Write, true).unwrap();
        assert_eq!(pipe.send(&[1u8; 16], true).unwrap(), 16);

        // Peer drained 4 of its buffer: willingness and outstanding both
        // shrink, so no new room appears yet.
        pipe.read_update(4).unwrap();
        let state = pipe.state();
        assert_eq!(state.remote_max, 4);
        assert_eq!(state.remote_size, 4);
        assert_eq!(state.buffered, 8);

        // A credit grant opens room; buffered bytes flush into it.
        pipe.read_request(4).unwrap();
        let state = pipe.state();
        assert_eq!(state.remote_max, 8);
        assert_eq!(state.remote_size, 8);
        assert_eq!(state.buffered, 4);
        assert_eq!(pipe.send(&[1u8; 8], true).unwrap(), 4);
    }

    #[test]
    fn nonblocking_read_distinguishes_eagain_from_eof() {
        let registry = test_registry(8, 8);
        registry.open_update("/r", PipeMode::Write);
        let pipe = registry.open("/r", PipeMode::Read, true).unwrap();

        let mut buf = [0u8; 4];
        let err = pipe.read(&mut buf, true).unwrap_err();
        assert_eq!(err.error(), Errno::EAGAIN);

        registry.close_update("/r", PipeMode::Write);
        assert_eq!(pipe.read(&mut buf, true).unwrap(), 0);
    }

    #[test]
    fn recv_buffers_ahead_of_readers() {
        let registry = test_registry(16, 16);
        registry.open_update("/in", PipeMode::Write);
        let pipe = registry.open("/in", PipeMode::Read, true).unwrap();

        pipe.recv(&mut Cursor::new(b"hello".to_vec()), 5).unwrap();
        assert_eq!(pipe.state().buffered, 5);

        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(&mut buf, true).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn recv_overrun_tears_the_pipe_down() {
        let registry = test_registry(4, 4);
        registry.open_update("/o", PipeMode::Write);
        let pipe = registry.open("/o", PipeMode::Read, true).unwrap();

        let err = pipe
            .recv(&mut Cursor::new(vec![0u8; 9]), 9)
            .unwrap_err();
        assert_eq!(err.error(), Errno::EPROTO);

        let mut buf = [0u8; 1];
        let err = pipe.read(&mut buf, true).unwrap_err();
        assert_eq!(err.error(), Errno::EPIPE);
    }

    #[test]
    fn force_exit_is_idempotent() {
        let registry = test_registry(8, 8);
        registry.open_update("/f", PipeMode::Read);
        let pipe = registry.open("/f", PipeMode::Write, true).unwrap();

        pipe.force_exit();
        let state = pipe.state();
        pipe.force_exit();
        assert_eq!(pipe.state(), state);

        let err = pipe.send(&[1], true).unwrap_err();
        assert_eq!(err.error(), Errno::EPIPE);
        let err = registry.open("/f", PipeMode::Write, true).unwrap_err();
        assert_eq!(err.error(), Errno::ENOENT);
    }

    #[test]
    fn last_closer_empties_the_registry() {
        let registry = test_registry(8, 8);
        registry.open_update("/bye", PipeMode::Read);
        let pipe = registry.open("/bye", PipeMode::Write, true).unwrap();

        registry.close(&pipe, PipeMode::Write).unwrap();
        assert!(registry.get("/bye").is_some(), "peer still holds the pipe");

        registry.close_update("/bye", PipeMode::Read);
        assert!(registry.get("/bye").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn close_update_on_unknown_path_is_a_no_op() {
        let registry = test_registry(8, 8);
        registry.close_update("/nothing", PipeMode::Read);
        assert!(registry.is_empty());
    }

    #[test]
    fn poll_tracks_the_reader_side() {
        let registry = test_registry(8, 8);
        registry.open_update("/p", PipeMode::Read);
        let pipe = registry.open("/p", PipeMode::Write, true).unwrap();
        assert_eq!(pipe.poll(None), IoEvents::OUT);

        // Writer with no readers left polls as error.
        registry.close_update("/p", PipeMode::Read);
        assert_eq!(pipe.poll(None), IoEvents::ERR);
    }
}
