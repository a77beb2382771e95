// SPDX-License-Identifier: MPL-2.0

use std::{process, sync::OnceLock};

use clap::Parser;
use fuser::MountOption;
use log::{error, info};

use netpipefs::{
    config::Opts,
    fs::NetPipeFs,
    net::{connect, dispatcher, transport::Transport},
    pipe::PipeRegistry,
    Result,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    if let Err(e) = run(opts) {
        error!("netpipefs failed: {}", e);
        process::exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    let (stream, remote_capacity) = connect::establish(&opts)?;
    let reader = stream.try_clone()?;

    let transport = std::sync::Arc::new(Transport::new(stream));
    let registry = std::sync::Arc::new(PipeRegistry::new(
        transport,
        opts.pipe_capacity,
        remote_capacity,
    ));

    let notifier = std::sync::Arc::new(OnceLock::new());
    let filesystem = NetPipeFs::new(registry.clone(), notifier.clone());

    let mut options = vec![MountOption::FSName("netpipefs".to_string())];
    if opts.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let mut session = fuser::Session::new(filesystem, &opts.mountpoint, &options)?;
    let _ = notifier.set(session.notifier());

    let _dispatcher = dispatcher::spawn(Box::new(reader), registry.clone())?;

    info!("mounted on {}", opts.mountpoint.display());
    session.run()?;

    // Unmounted: tear down whatever is still parked.
    registry.force_exit_all();
    Ok(())
}
