// SPDX-License-Identifier: MPL-2.0

use std::{fmt, io};

/// Error number.
///
/// The values are the Linux error numbers, so the FUSE shim can hand them to
/// the kernel unchanged. Only the numbers this daemon can actually surface
/// are listed.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,         /* Operation not permitted */
    ENOENT = 2,        /* No such file or directory */
    EINTR = 4,         /* Interrupted system call */
    EIO = 5,           /* I/O error */
    EBADF = 9,         /* Bad file number */
    EAGAIN = 11,       /* Try again */
    EACCES = 13,       /* Permission denied */
    EINVAL = 22,       /* Invalid argument */
    EPIPE = 32,        /* Broken pipe */
    EPROTO = 71,       /* Protocol error */
    EADDRINUSE = 98,   /* Address already in use */
    ECONNRESET = 104,  /* Connection reset by peer */
    ENOTCONN = 107,    /* Transport endpoint is not connected */
    ETIMEDOUT = 110,   /* Connection timed out */
    ECONNREFUSED = 111, /* Connection refused */
}

/// Error used in this crate.
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    /// The raw error number, as expected by FUSE error replies.
    pub const fn as_raw(&self) -> i32 {
        self.errno as i32
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        let errno = match io_error.kind() {
            io::ErrorKind::NotFound => Errno::ENOENT,
            io::ErrorKind::PermissionDenied => Errno::EACCES,
            io::ErrorKind::ConnectionRefused => Errno::ECONNREFUSED,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Errno::ECONNRESET,
            io::ErrorKind::NotConnected => Errno::ENOTCONN,
            io::ErrorKind::AddrInUse => Errno::EADDRINUSE,
            io::ErrorKind::BrokenPipe => Errno::EPIPE,
            io::ErrorKind::WouldBlock => Errno::EAGAIN,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Errno::EINVAL,
            io::ErrorKind::TimedOut => Errno::ETIMEDOUT,
            io::ErrorKind::Interrupted => Errno::EINTR,
            _ => Errno::EIO,
        };
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let e: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(e.error(), Errno::ECONNRESET);

        let e: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(e.error(), Errno::EAGAIN);
    }

    #[test]
    fn raw_values_match_linux() {
        assert_eq!(Error::new(Errno::EPIPE).as_raw(), 32);
        assert_eq!(Error::new(Errno::EAGAIN).as_raw(), 11);
    }
}
