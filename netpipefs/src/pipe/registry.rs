// SPDX-License-Identifier: MPL-2.0

use std::sync::PoisonError;

use hashbrown::HashMap;

use super::{NetPipe, PipeMode};
use crate::{net::frame::Frame, net::transport::Transport, prelude::*};

/// The path → pipe index, and the entry point for opening and closing.
///
/// The registry holds one strong reference per open pipe; the last closer
/// removes the entry and the final `Arc` drop frees the pipe, so no pipe
/// can disappear under a thread that still holds it. Lock order is the
/// registry map, then a pipe's mutex; callers must never remove while
/// holding a pipe mutex.
pub struct PipeRegistry {
    pipes: Mutex<HashMap<String, Arc<NetPipe>>>,
    transport: Arc<Transport>,
    local_capacity: usize,
    remote_capacity: usize,
}

impl PipeRegistry {
    pub fn new(transport: Arc<Transport>, local_capacity: usize, remote_capacity: usize) -> Self {
        Self {
            pipes: Mutex::new(HashMap::new()),
            transport,
            local_capacity,
            remote_capacity,
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<NetPipe>>> {
        self.pipes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, path: &str) -> Option<Arc<NetPipe>> {
        self.map().get(path).cloned()
    }

    /// Returns the pipe for `path`, creating and inserting it if absent.
    /// The boolean reports whether this call created it.
    pub fn get_or_create(&self, path: &str) -> (Arc<NetPipe>, bool) {
        let mut map = self.map();
        if let Some(pipe) = map.get(path) {
            return (pipe.clone(), false);
        }
        let pipe = Arc::new(NetPipe::new(
            path,
            self.transport.clone(),
            self.local_capacity,
            self.remote_capacity,
        ));
        map.insert(path.to_string(), pipe.clone());
        debug!("pipe {} created", path);
        (pipe, true)
    }

    /// Drops the registry's reference if the pipe has no participants left.
    /// Idempotent; a lookup miss is a no-op.
    fn remove_if_idle(&self, path: &str) {
        let mut map = self.map();
        let idle = map.get(path).is_some_and(|pipe| pipe.try_detach());
        if idle {
            map.remove(path);
            debug!("pipe {} removed", path);
        }
    }

    /// Opens `path` locally.
    ///
    /// Tells the peer, then either fails fast (`nonblock` with no
    /// participant on the other side yet) or parks until both sides have a
    /// participant. A pipe created by a failed open is removed again.
    pub fn open(&self, path: &str, mode: PipeMode, nonblock: bool) -> Result<Arc<NetPipe>> {
        loop {
            let (pipe, created) = self.get_or_create(path);
            // The last closer may unlink an instance between the lookup and
            // the lock; when that happens, start over on a fresh one.
            if let Some(result) = self.open_on(pipe, created, path, mode, nonblock) {
                return result;
            }
        }
    }

    fn open_on(
        &self,
        pipe: Arc<NetPipe>,
        created: bool,
        path: &str,
        mode: PipeMode,
        nonblock: bool,
    ) -> Option<Result<Arc<NetPipe>>> {
        let mut inner = pipe.lock();
        if inner.detached {
            return None;
        }

        if inner.force_exit {
            drop(inner);
            if created {
                self.remove_if_idle(path);
            }
            return Some(Err(Error::with_message(Errno::ENOENT, "pipe torn down")));
        }
        if inner.open_mode.is_some_and(|m| m != mode) {
            drop(inner);
            if created {
                self.remove_if_idle(path);
            }
            return Some(Err(Error::with_message(
                Errno::EPERM,
                "the other side of this pipe is open here",
            )));
        }

        match mode {
            PipeMode::Read => {
                inner.readers += 1;
                inner.local_readers += 1;
            }
            PipeMode::Write => {
                inner.writers += 1;
                inner.local_writers += 1;
            }
        }
        inner.open_mode = Some(mode);

        if let Err(e) = pipe.transport.send_frame(&Frame::Open {
            path: path.to_string(),
            mode,
        }) {
            pipe.undo_open(&mut inner, mode);
            drop(inner);
            if created {
                self.remove_if_idle(path);
            }
            return Some(Err(e));
        }
        pipe.can_open.notify_all();

        if nonblock && (inner.readers == 0 || inner.writers == 0) {
            pipe.undo_open(&mut inner, mode);
            // The peer already saw our OPEN; balance its view again.
            let close = pipe.transport.send_frame(&Frame::Close {
                path: path.to_string(),
                mode,
            });
            if let Err(e) = close {
                warn!("close frame for {} failed: {}", path, e);
            }
            drop(inner);
            if created {
                self.remove_if_idle(path);
            }
            return Some(Err(Error::with_message(
                Errno::EAGAIN,
                "no participant on the other side yet",
            )));
        }

        while !(inner.readers > 0 && inner.writers > 0) {
            if inner.force_exit {
                pipe.undo_open(&mut inner, mode);
                drop(inner);
                if created {
                    self.remove_if_idle(path);
                }
                return Some(Err(Error::with_message(
                    Errno::ENOENT,
                    "pipe torn down while opening",
                )));
            }
            inner = pipe.wait(&pipe.can_open, inner);
        }
        drop(inner);

        debug!("pipe {} opened locally ({:?})", path, mode);
        Some(Ok(pipe))
    }

    /// Dispatcher: the peer opened `path`.
    pub fn open_update(&self, path: &str, mode: PipeMode) {
        let (pipe, _) = self.get_or_create(path);
        pipe.open_remote(mode);
        debug!("pipe {} opened by the peer ({:?})", path, mode);
    }

    /// Closes one local handle, flushing if it was the last writer, and
    /// removes the pipe once both sides are gone.
    pub fn close(&self, pipe: &NetPipe, mode: PipeMode) -> Result<usize> {
        let flushed = pipe.close_local(mode);
        self.remove_if_idle(pipe.path());
        flushed
    }

    /// Dispatcher: the peer closed one handle on `path`. A lookup miss is a
    /// no-op.
    pub fn close_update(&self, path: &str, mode: PipeMode) {
        if let Some(pipe) = self.get(path) {
            pipe.close_remote(mode);
            self.remove_if_idle(path);
            debug!("pipe {} closed by the peer ({:?})", path, mode);
        }
    }

    /// Global teardown: force-exits every pipe. Entries whose local handles
    /// are already gone are pruned here; the rest leave when their handles
    /// close.
    pub fn force_exit_all(&self) {
        let pipes: Vec<Arc<NetPipe>> = self.map().values().cloned().collect();
        for pipe in pipes {
            pipe.force_exit();
            self.remove_if_idle(pipe.path());
        }
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
