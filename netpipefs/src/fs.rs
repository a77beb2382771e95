// SPDX-License-Identifier: MPL-2.0

//! The FUSE shim.
//!
//! Every path shows up as a `0444` regular file; writability is decided by
//! the engine's open-mode policy, not by stat. The fuser session loop is
//! single-threaded and engine calls suspend, so each data operation moves
//! onto a worker thread that owns the reply; the loop itself never blocks.

use std::{
    ffi::OsStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, SystemTime},
};

use fuser::{
    consts::FOPEN_DIRECT_IO, FileAttr, FileType, Filesystem, Notifier, PollHandle, ReplyAttr,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyPoll, ReplyWrite, Request,
    TimeOrNow,
};
use hashbrown::HashMap;

use crate::{
    events::IoEvents,
    pipe::{NetPipe, PipeMode, PipeRegistry},
    prelude::*,
};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

const O_ACCMODE: i32 = 0o3;
const O_RDONLY: i32 = 0o0;
const O_WRONLY: i32 = 0o1;
const O_NONBLOCK: i32 = 0o4000;

/// `poll` flag asking for a notification on the next state change.
const POLL_SCHEDULE_NOTIFY: u32 = 1 << 0;

#[derive(Clone)]
struct OpenHandle {
    pipe: Arc<NetPipe>,
    mode: PipeMode,
    nonblock: bool,
}

/// Inode numbers handed to the kernel, one per path ever looked up.
#[derive(Default)]
struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn get_or_alloc(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        self.next += 1;
        let ino = ROOT_INO + self.next;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }
}

pub struct NetPipeFs {
    registry: Arc<PipeRegistry>,
    notifier: Arc<OnceLock<Notifier>>,
    inodes: InodeTable,
    handles: Arc<Mutex<HashMap<u64, OpenHandle>>>,
    next_fh: AtomicU64,
}

impl NetPipeFs {
    pub fn new(registry: Arc<PipeRegistry>, notifier: Arc<OnceLock<Notifier>>) -> Self {
        Self {
            registry,
            notifier,
            inodes: InodeTable::default(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_fh: AtomicU64::new(0),
        }
    }

    fn handle(&self, fh: u64) -> Option<OpenHandle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fh)
            .cloned()
    }

    fn file_attr(req: &Request<'_>, ino: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o444,
            nlink: 1,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn root_attr(req: &Request<'_>) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for NetPipeFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(Errno::ENOENT as i32);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(Errno::EINVAL as i32);
            return;
        };
        // Pipe files spring into existence on first use.
        let ino = self.inodes.get_or_alloc(&format!("/{name}"));
        reply.entry(&TTL, &Self::file_attr(req, ino), 0);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &Self::root_attr(req));
        } else if self.inodes.path_of(ino).is_some() {
            reply.attr(&TTL, &Self::file_attr(req, ino));
        } else {
            reply.error(Errno::ENOENT as i32);
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Truncate (and everything else) is a no-op success on a pipe file.
        if ino == ROOT_INO {
            reply.attr(&TTL, &Self::root_attr(req));
        } else if self.inodes.path_of(ino).is_some() {
            reply.attr(&TTL, &Self::file_attr(req, ino));
        } else {
            reply.error(Errno::ENOENT as i32);
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(Errno::ENOENT as i32);
            return;
        }
        let entries = [".", ".."];
        for (i, name) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(ROOT_INO, (i + 1) as i64, FileType::Directory, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(Errno::ENOENT as i32);
            return;
        };
        let mode = match flags & O_ACCMODE {
            O_RDONLY => PipeMode::Read,
            O_WRONLY => PipeMode::Write,
            _ => {
                // O_RDWR has no meaning on a one-way pipe file.
                reply.error(Errno::EINVAL as i32);
                return;
            }
        };
        let nonblock = flags & O_NONBLOCK != 0;

        let path = path.to_string();
        let registry = self.registry.clone();
        let handles = self.handles.clone();
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed) + 1;
        // Opening may park until the peer shows up; never on this thread.
        thread::spawn(move || match registry.open(&path, mode, nonblock) {
            Ok(pipe) => {
                handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        fh,
                        OpenHandle {
                            pipe,
                            mode,
                            nonblock,
                        },
                    );
                reply.opened(fh, FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(e.as_raw()),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(Errno::EBADF as i32);
            return;
        };
        if handle.mode != PipeMode::Read {
            reply.error(Errno::EBADF as i32);
            return;
        }
        thread::spawn(move || {
            let mut buf = vec![0u8; size as usize];
            match handle.pipe.read(&mut buf, handle.nonblock) {
                Ok(n) => reply.data(&buf[..n]),
                Err(e) => reply.error(e.as_raw()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(Errno::EBADF as i32);
            return;
        };
        if handle.mode != PipeMode::Write {
            reply.error(Errno::EBADF as i32);
            return;
        }
        let data = data.to_vec();
        thread::spawn(move || match handle.pipe.send(&data, handle.nonblock) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.as_raw()),
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(Errno::EBADF as i32);
            return;
        };
        if handle.mode != PipeMode::Write {
            reply.ok();
            return;
        }
        thread::spawn(move || match handle.pipe.flush(false) {
            Ok(_) => reply.ok(),
            // A vanished reader leaves nothing to deliver to; not an error
            // worth failing close(2) over.
            Err(e) if e.error() == Errno::EPIPE => reply.ok(),
            Err(e) => reply.error(e.as_raw()),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fh);
        let Some(handle) = handle else {
            reply.ok();
            return;
        };
        let registry = self.registry.clone();
        // Closing the last writer flushes, which may park.
        thread::spawn(move || {
            if let Err(e) = registry.close(&handle.pipe, handle.mode) {
                warn!("close of {} failed: {}", handle.pipe.path(), e);
            }
            reply.ok();
        });
    }

    fn poll(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        ph: PollHandle,
        _events: u32,
        flags: u32,
        reply: ReplyPoll,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(Errno::EBADF as i32);
            return;
        };

        let observer = if flags & POLL_SCHEDULE_NOTIFY != 0 {
            let notifier = self.notifier.clone();
            let kh: u64 = ph.into();
            let observer = move |_events: IoEvents| {
                if let Some(notifier) = notifier.get() {
                    if let Err(e) = notifier.poll(kh) {
                        warn!("poll notification failed: {}", e);
                    }
                }
            };
            Some(Box::new(observer) as Box<dyn crate::events::PollObserver>)
        } else {
            None
        };

        let revents = handle.pipe.poll(observer);
        reply.poll(revents.bits());
    }
}
