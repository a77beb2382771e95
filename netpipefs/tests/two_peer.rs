// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios over a loopback socket pair: two full engine
//! instances, each with its own dispatcher thread, wired back to back the
//! way two mounted peers would be.

use std::{
    net::Shutdown,
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use netpipefs::{
    events::IoEvents,
    net::{dispatcher, transport::Transport},
    pipe::{NetPipe, PipeMode, PipeRegistry},
    Errno,
};

struct Peer {
    registry: Arc<PipeRegistry>,
    link: UnixStream,
}

impl Drop for Peer {
    fn drop(&mut self) {
        let _ = self.link.shutdown(Shutdown::Both);
    }
}

fn peer(stream: UnixStream, local_capacity: usize, remote_capacity: usize) -> Peer {
    let link = stream.try_clone().unwrap();
    let reader = stream.try_clone().unwrap();
    let transport = Arc::new(Transport::new(stream));
    let registry = Arc::new(PipeRegistry::new(
        transport,
        local_capacity,
        remote_capacity,
    ));
    dispatcher::spawn(Box::new(reader), registry.clone()).unwrap();
    Peer { registry, link }
}

fn peer_pair(capacity_a: usize, capacity_b: usize) -> (Peer, Peer) {
    let (a, b) = UnixStream::pair().unwrap();
    (
        peer(a, capacity_a, capacity_b),
        peer(b, capacity_b, capacity_a),
    )
}

/// Opens `path` for writing on `a` and reading on `b`, riding out the
/// blocking-open rendezvous.
fn open_pair(a: &Peer, b: &Peer, path: &str) -> (Arc<NetPipe>, Arc<NetPipe>) {
    let registry = b.registry.clone();
    let path_owned = path.to_string();
    let reader = thread::spawn(move || registry.open(&path_owned, PipeMode::Read, false).unwrap());
    let writer = a.registry.open(path, PipeMode::Write, false).unwrap();
    (writer, reader.join().unwrap())
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn simple_echo() {
    let (a, b) = peer_pair(64, 64);
    let (wr, rd) = open_pair(&a, &b, "/x");

    assert_eq!(wr.send(b"hello", false).unwrap(), 5);

    let mut buf = [0u8; 5];
    assert_eq!(rd.read(&mut buf, false).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    a.registry.close(&wr, PipeMode::Write).unwrap();
    b.registry.close(&rd, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}

#[test]
fn credit_backpressure() {
    let (a, b) = peer_pair(8, 8);
    let (wr, rd) = open_pair(&a, &b, "/bp");

    let payload: Vec<u8> = (0..20).map(|i| i as u8).collect();
    let wr2 = wr.clone();
    let expected = payload.clone();
    let writer = thread::spawn(move || wr2.send(&payload, false).unwrap());

    // 8 bytes on the wire, 8 written ahead, then the writer parks.
    wait_until("the writer to fill credit and buffer", || {
        let state = wr.state();
        state.remote_size == 8 && state.buffered == 8
    });
    assert!(!writer.is_finished());

    let mut collected = Vec::new();
    while collected.len() < 20 {
        let mut chunk = [0u8; 4];
        let n = rd.read(&mut chunk, false).unwrap();
        assert!(n > 0, "the stream ended early");
        collected.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(writer.join().unwrap(), 20);
    assert_eq!(collected, expected);

    a.registry.close(&wr, PipeMode::Write).unwrap();
    b.registry.close(&rd, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}

#[test]
fn reader_sees_eof_after_writer_close() {
    let (a, b) = peer_pair(8, 8);
    let (wr, rd) = open_pair(&a, &b, "/eof");

    assert_eq!(wr.send(&[1, 2, 3], false).unwrap(), 3);
    a.registry.close(&wr, PipeMode::Write).unwrap();

    // Read only once the close has been observed.
    wait_until("the writer departure to arrive", || rd.state().writers == 0);

    let mut buf = [0u8; 3];
    assert_eq!(rd.read(&mut buf, false).unwrap(), 3);
    assert_eq!(&buf, &[1, 2, 3]);
    assert_eq!(rd.read(&mut buf, false).unwrap(), 0);

    b.registry.close(&rd, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}

#[test]
fn nonblocking_open_race() {
    let (a, b) = peer_pair(8, 8);

    let err = a.registry.open("/y", PipeMode::Write, true).unwrap_err();
    assert_eq!(err.error(), Errno::EAGAIN);

    let registry = b.registry.clone();
    let opener = thread::spawn(move || registry.open("/y", PipeMode::Read, false).unwrap());

    wait_until("the reader to show up", || {
        a.registry
            .get("/y")
            .is_some_and(|pipe| pipe.state().readers > 0)
    });
    let wr = a.registry.open("/y", PipeMode::Write, true).unwrap();
    let rd = opener.join().unwrap();

    a.registry.close(&wr, PipeMode::Write).unwrap();
    b.registry.close(&rd, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}

#[test]
fn forced_teardown_unblocks_everyone() {
    let (a, b) = peer_pair(8, 8);

    // A writer parked on exhausted credit.
    let (wr, rd1) = open_pair(&a, &b, "/t1");
    let wr2 = wr.clone();
    let writer = thread::spawn(move || wr2.send(&[9u8; 20], false));
    wait_until("the writer to park", || {
        let state = wr.state();
        state.remote_size == 8 && state.buffered == 8
    });

    // A reader parked on an empty pipe.
    let registry = a.registry.clone();
    let opener = thread::spawn(move || registry.open("/t2", PipeMode::Write, false).unwrap());
    let rd2 = b.registry.open("/t2", PipeMode::Read, false).unwrap();
    let wr_t2 = opener.join().unwrap();
    let rd2c = rd2.clone();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 10];
        rd2c.read(&mut buf, false)
    });
    wait_until("the read request to reach the writer side", || {
        wr_t2.state().remote_max > 8
    });

    // An open parked waiting for a peer that will never come.
    let registry = a.registry.clone();
    let opener = thread::spawn(move || registry.open("/t3", PipeMode::Write, false));
    wait_until("the open to park", || {
        a.registry
            .get("/t3")
            .is_some_and(|pipe| pipe.state().writers > 0)
    });

    // Sever the link: both dispatchers see EOF and force-exit everything.
    a.link.shutdown(Shutdown::Both).unwrap();

    let send_result = writer.join().unwrap();
    assert_eq!(send_result.unwrap_err().error(), Errno::EPIPE);
    assert_eq!(reader.join().unwrap().unwrap(), 0);
    assert_eq!(opener.join().unwrap().unwrap_err().error(), Errno::ENOENT);

    // Pipes are freed as their local handles close.
    a.registry.close(&wr, PipeMode::Write).unwrap();
    a.registry.close(&wr_t2, PipeMode::Write).unwrap();
    b.registry.close(&rd1, PipeMode::Read).unwrap();
    b.registry.close(&rd2, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}

#[test]
fn bytes_arrive_in_order_with_partial_tail() {
    let (a, b) = peer_pair(16, 16);
    let (wr, rd) = open_pair(&a, &b, "/seq");

    let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let registry = a.registry.clone();
    let writer = thread::spawn(move || {
        assert_eq!(wr.send(&payload, false).unwrap(), 1000);
        registry.close(&wr, PipeMode::Write).unwrap();
    });

    // 1000 is not a multiple of 33: the writer's close completes the last
    // parked read with a short count.
    let mut collected = Vec::new();
    loop {
        let mut chunk = [0u8; 33];
        let n = rd.read(&mut chunk, false).unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..n]);
    }

    writer.join().unwrap();
    assert_eq!(collected, expected);

    b.registry.close(&rd, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}

#[test]
fn poll_observer_fires_once_on_arrival() {
    let (a, b) = peer_pair(8, 8);
    let (wr, rd) = open_pair(&a, &b, "/poll");

    // With a live writer the read side always polls as readable-or-waiting.
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let events = rd.poll(Some(Box::new(move |_events: IoEvents| {
        flag.store(true, Ordering::SeqCst);
    })));
    assert_eq!(events, IoEvents::IN);
    assert!(!fired.load(Ordering::SeqCst));

    assert_eq!(wr.send(b"!", false).unwrap(), 1);
    wait_until("the poll observer to fire", || fired.load(Ordering::SeqCst));

    a.registry.close(&wr, PipeMode::Write).unwrap();
    b.registry.close(&rd, PipeMode::Read).unwrap();
    wait_until("both registries to drain", || {
        a.registry.is_empty() && b.registry.is_empty()
    });
}
