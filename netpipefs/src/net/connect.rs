// SPDX-License-Identifier: MPL-2.0

//! Peer pairing: establish the single TCP link and swap buffer capacities.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, Instant},
};

use crate::{config::Opts, prelude::*};

const RETRY_PAUSE: Duration = Duration::from_millis(25);
const CONNECT_ATTEMPT: Duration = Duration::from_millis(250);

/// Establishes the peer link and exchanges `pipecapacity` values.
///
/// The peer with the numerically smaller local port takes the accept side;
/// the other connects with retries until the timeout. With equal ports both
/// sides alternate between accepting and connecting and the first
/// established connection wins.
///
/// Returns the stream and the peer's advertised buffer capacity.
pub fn establish(opts: &Opts) -> Result<(TcpStream, usize)> {
    let peer_addr = (opts.hostname.as_str(), opts.hostport)
        .to_socket_addrs()?
        .next()
        .ok_or(Error::with_message(
            Errno::EINVAL,
            "peer host does not resolve",
        ))?;
    let deadline = Instant::now() + opts.timeout();

    let stream = if opts.port < opts.hostport {
        accept_side(opts.port, deadline)?
    } else if opts.port > opts.hostport {
        connect_side(peer_addr, deadline)?
    } else {
        either_side(opts.port, peer_addr, deadline)?
    };

    stream.set_nodelay(true)?;
    let remote_capacity = exchange_capacities(&stream, opts.pipe_capacity, deadline)?;
    info!(
        "paired with {} (local capacity {}, remote capacity {})",
        peer_addr, opts.pipe_capacity, remote_capacity
    );
    Ok((stream, remote_capacity))
}

fn accept_side(port: u16, deadline: Instant) -> Result<TcpStream> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted peer connection from {}", peer);
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return_errno_with_message!(Errno::ETIMEDOUT, "no peer connected in time");
        }
        thread::sleep(RETRY_PAUSE);
    }
}

fn connect_side(peer_addr: SocketAddr, deadline: Instant) -> Result<TcpStream> {
    loop {
        match TcpStream::connect_timeout(&peer_addr, CONNECT_ATTEMPT) {
            Ok(stream) => {
                debug!("connected to peer at {}", peer_addr);
                return Ok(stream);
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(e.into());
                }
            }
        }
        thread::sleep(RETRY_PAUSE);
    }
}

fn either_side(port: u16, peer_addr: SocketAddr, deadline: Instant) -> Result<TcpStream> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted peer connection from {}", peer);
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        if let Ok(stream) = TcpStream::connect_timeout(&peer_addr, CONNECT_ATTEMPT) {
            debug!("connected to peer at {}", peer_addr);
            return Ok(stream);
        }
        if Instant::now() >= deadline {
            return_errno_with_message!(Errno::ETIMEDOUT, "no peer connected in time");
        }
        thread::sleep(RETRY_PAUSE);
    }
}

/// Each side writes its local capacity as a `u32` and reads the peer's.
/// Four bytes fit in the socket buffer, so writing first cannot deadlock.
fn exchange_capacities(
    stream: &TcpStream,
    local_capacity: usize,
    deadline: Instant,
) -> Result<usize> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return_errno_with_message!(Errno::ETIMEDOUT, "no time left for the handshake");
    }
    stream.set_read_timeout(Some(remaining))?;

    let mut stream_ref = stream;
    stream_ref.write_all(&(local_capacity as u32).to_ne_bytes())?;
    let mut bytes = [0u8; 4];
    stream_ref.read_exact(&mut bytes)?;

    stream.set_read_timeout(None)?;
    let remote_capacity = u32::from_ne_bytes(bytes) as usize;
    if remote_capacity == 0 {
        return_errno_with_message!(Errno::EPROTO, "peer advertised a zero capacity");
    }
    Ok(remote_capacity)
}
