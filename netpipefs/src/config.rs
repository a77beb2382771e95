// SPDX-License-Identifier: MPL-2.0

use std::{path::PathBuf, time::Duration};

use clap::Parser;

pub const DEFAULT_PIPE_CAPACITY: usize = 65536;

/// Command-line options of the daemon.
///
/// The two peers run the same binary with mirrored host/port options; each
/// advertises its own `pipecapacity` during pairing.
#[derive(Parser, Debug, Clone)]
#[command(name = "netpipefs", version, about = "Mount a filesystem of network pipes")]
pub struct Opts {
    /// Directory to mount the filesystem on.
    pub mountpoint: PathBuf,

    /// Local TCP port used for pairing.
    #[arg(long)]
    pub port: u16,

    /// Peer host name or address.
    #[arg(long)]
    pub hostname: String,

    /// Peer TCP port.
    #[arg(long)]
    pub hostport: u16,

    /// Pairing timeout in milliseconds.
    #[arg(long, default_value_t = 8000)]
    pub timeout: u64,

    /// Local per-pipe buffer capacity in bytes.
    #[arg(long = "pipecapacity", default_value_t = DEFAULT_PIPE_CAPACITY)]
    pub pipe_capacity: usize,

    /// Ask FUSE to unmount automatically when the daemon exits.
    #[arg(long)]
    pub auto_unmount: bool,
}

impl Opts {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}
