//! Buffers and flow adapters driven end to end over a socket pair.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use plexus_core::buffer::Observer;
use plexus_core::{make_buffer_resource, Buffer, DemandSignal, NetError, Settings};
use plexus_net::flow::{Bridge, ConsumerAdapter, SendAdapter};
use plexus_net::framing::{self, LengthPrefixFraming};
use plexus_net::socket::{self, IoOutcome};
use plexus_net::transport::StreamTransport;
use plexus_net::{Reactor, ReactorConfig, SocketManager};

fn drive_until<F: FnMut() -> bool>(reactor: &Reactor, mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        reactor.poll_once(false);
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    cond()
}

fn decode_str(bytes: &[u8]) -> Option<String> {
    String::from_utf8(bytes.to_vec()).ok()
}

fn send_frames(peer: &OwnedFd, items: impl IntoIterator<Item = String>) {
    let mut out = Vec::new();
    for item in items {
        framing::encode(item.as_bytes(), &mut out).unwrap();
    }
    let mut off = 0;
    while off < out.len() {
        match socket::write(peer.as_raw_fd(), &out[off..]) {
            IoOutcome::Done(n) => off += n,
            other => panic!("write failed: {other:?}"),
        }
    }
}

/// Collects pulled items and the terminal signal.
#[derive(Default)]
struct Sink {
    items: Vec<String>,
    completed: bool,
    error: Option<NetError>,
}

impl Observer<String> for Sink {
    fn on_next(&mut self, item: String) {
        self.items.push(item);
    }

    fn on_complete(&mut self) {
        self.completed = true;
    }

    fn on_error(&mut self, err: &NetError) {
        self.error = Some(err.clone());
    }
}

struct Inbound {
    reactor: Reactor,
    mgr: Arc<SocketManager>,
    peer: OwnedFd,
    buf: Arc<Buffer<String>>,
}

fn inbound(capacity: usize, min_pull: usize) -> Inbound {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let (pull_side, push_side) = make_buffer_resource(capacity, min_pull);
    let (a, b) = socket::socket_pair().unwrap();
    let adapter = ConsumerAdapter::new(push_side, decode_str);
    let mgr = SocketManager::new(&reactor, a, StreamTransport::make(LengthPrefixFraming::make(adapter)));
    mgr.init(&Settings::new()).unwrap();
    Inbound {
        reactor,
        mgr,
        peer: b,
        buf: pull_side.try_open().unwrap(),
    }
}

#[test]
fn test_backpressure_suspends_and_resumes_reading() {
    let fx = inbound(8, 2);
    send_frames(&fx.peer, (0..13).map(|i| i.to_string()));

    assert!(drive_until(&fx.reactor, || fx.buf.available() == 8));
    assert!(drive_until(&fx.reactor, || !fx.mgr.is_reading()));
    // stays suspended while nobody pulls
    for _ in 0..10 {
        fx.reactor.poll_once(false);
    }
    assert_eq!(fx.buf.available(), 8);

    let mut sink = Sink::default();
    let (again, n) = fx.buf.pull(8, &mut sink);
    assert!(again);
    assert_eq!(n, 8);

    assert!(drive_until(&fx.reactor, || {
        fx.buf.pull(8, &mut sink);
        sink.items.len() == 13
    }));
    let expected: Vec<String> = (0..13).map(|i| i.to_string()).collect();
    assert_eq!(sink.items, expected);
    assert!(fx.mgr.is_reading());
    assert!(!sink.completed);
}

#[test]
fn test_peer_close_completes_buffer() {
    let fx = inbound(8, 1);
    send_frames(&fx.peer, ["a".to_string(), "b".to_string()]);
    assert!(drive_until(&fx.reactor, || fx.buf.available() == 2));
    drop(fx.peer);

    let mut sink = Sink::default();
    assert!(drive_until(&fx.reactor, || {
        fx.buf.pull(8, &mut sink);
        sink.completed
    }));
    assert_eq!(sink.items, vec!["a", "b"]);
    assert!(sink.error.is_none());
    assert!(drive_until(&fx.reactor, || fx.mgr.disposed()));
}

#[test]
fn test_decode_failure_aborts_buffer() {
    let fx = inbound(8, 1);
    let mut out = Vec::new();
    framing::encode(&[0xff, 0xfe], &mut out).unwrap();
    socket::write(fx.peer.as_raw_fd(), &out);

    let mut sink = Sink::default();
    assert!(drive_until(&fx.reactor, || {
        fx.buf.pull(8, &mut sink);
        sink.error.is_some()
    }));
    assert!(matches!(sink.error, Some(NetError::Protocol(_))));
    assert!(drive_until(&fx.reactor, || fx.mgr.disposed()));
}

#[test]
fn test_bad_frame_after_resume_aborts_buffer() {
    let fx = inbound(1, 1);
    let mut out = Vec::new();
    framing::encode(b"ok", &mut out).unwrap();
    framing::encode(&[0xff, 0xfe], &mut out).unwrap();
    socket::write(fx.peer.as_raw_fd(), &out);

    assert!(drive_until(&fx.reactor, || fx.buf.available() == 1));
    assert!(drive_until(&fx.reactor, || !fx.mgr.is_reading()));

    // demand resumes reading, which runs straight into the bad frame
    let mut sink = Sink::default();
    assert_eq!(fx.buf.pull(1, &mut sink), (true, 1));
    assert!(drive_until(&fx.reactor, || {
        fx.buf.pull(1, &mut sink);
        sink.error.is_some()
    }));
    assert_eq!(sink.items, vec!["ok"]);
    assert!(matches!(sink.error, Some(NetError::Protocol(_))));
    assert!(drive_until(&fx.reactor, || fx.mgr.disposed()));
}

#[test]
fn test_consumer_cancel_shuts_connection_down() {
    let fx = inbound(8, 1);
    fx.buf.cancel();
    send_frames(&fx.peer, ["x".to_string()]);
    assert!(drive_until(&fx.reactor, || fx.mgr.disposed()));
}

/// Read frames from `peer` until it reports EOF.
fn read_all_frames(reactor: &Reactor, peer: &OwnedFd) -> Vec<String> {
    socket::set_nonblocking(peer.as_fd(), true).unwrap();
    let mut raw = Vec::new();
    let mut eof = false;
    drive_until(reactor, || {
        let mut chunk = [0u8; 4096];
        loop {
            match socket::read(peer.as_raw_fd(), &mut chunk) {
                IoOutcome::Done(n) => raw.extend_from_slice(&chunk[..n]),
                IoOutcome::Closed => {
                    eof = true;
                    break;
                }
                _ => break,
            }
        }
        eof
    });
    assert!(eof, "peer never saw EOF");

    let mut frames = Vec::new();
    let mut rest = raw.as_slice();
    while let Some((len, body)) = framing::split(rest) {
        frames.push(String::from_utf8(body[..len].to_vec()).unwrap());
        rest = &body[len..];
    }
    assert!(rest.is_empty());
    frames
}

#[test]
fn test_send_adapter_drains_buffer_then_closes() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let (pull_side, push_side) = make_buffer_resource::<String>(16, 4);
    let (a, b) = socket::socket_pair().unwrap();
    let sender = SendAdapter::new(pull_side, |item: &String, out: &mut Vec<u8>| {
        out.extend_from_slice(item.as_bytes())
    });
    let mgr = SocketManager::new(&reactor, a, StreamTransport::make(LengthPrefixFraming::make(sender)));
    mgr.init(&Settings::new()).unwrap();

    let producer = std::thread::spawn(move || {
        let buf = push_side.try_open().unwrap();
        let demand = Arc::new(DemandSignal::default());
        buf.set_producer(demand.clone());
        for i in 0..79 {
            while buf.available() >= buf.capacity() {
                demand.wait(Duration::from_secs(1));
            }
            buf.push(format!("item-{i}"));
        }
        buf.close();
    });

    let frames = read_all_frames(&reactor, &b);
    producer.join().unwrap();
    let expected: Vec<String> = (0..79).map(|i| format!("item-{i}")).collect();
    assert_eq!(frames, expected);
    assert!(drive_until(&reactor, || mgr.disposed()));
}

#[test]
fn test_bridge_echoes_through_worker() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let (bridge, ends) = Bridge::<String, String>::new(
        decode_str,
        |item: &String, out: &mut Vec<u8>| out.extend_from_slice(item.to_uppercase().as_bytes()),
        8,
        2,
    );
    let (a, b) = socket::socket_pair().unwrap();
    let mgr = SocketManager::new(&reactor, a, StreamTransport::make(LengthPrefixFraming::make(bridge)));
    mgr.init(&Settings::new()).unwrap();

    let worker = std::thread::spawn(move || {
        let input = ends.inbound.try_open().unwrap();
        let output = ends.outbound.try_open().unwrap();
        let mut seen = Vec::new();
        while seen.len() < 3 {
            input.pull_timeout(8, Duration::from_millis(50), &mut |s: String| seen.push(s));
        }
        for s in seen {
            output.push(s);
        }
        output.close();
    });

    send_frames(&b, ["ab".to_string(), "cd".to_string(), "ef".to_string()]);
    let frames = read_all_frames(&reactor, &b);
    worker.join().unwrap();
    assert_eq!(frames, vec!["AB", "CD", "EF"]);
}
