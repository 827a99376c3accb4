//! Length-prefix echo server
//!
//! Every connection gets a [`Bridge`]: decoded frames are pulled by a worker
//! thread and pushed back into the connection's outbound buffer. A slow
//! worker makes the reactor stop reading that connection until the worker
//! catches up.
//!
//! Usage:
//!     ./target/release/lp-echo [port] [max_conns]
//!
//! `max_conns` of 0 (the default) accepts forever. Logging is controlled by
//! `RUST_LOG`; transport and framing limits by `PLEXUS_*` variables, e.g.
//! `PLEXUS_FRAMING_MAX_MESSAGE_LENGTH=65536`.

use std::net::Ipv4Addr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use plexus_core::buffer::Observer;
use plexus_core::{DemandSignal, NetError, Settings};
use plexus_net::flow::{Bridge, BridgeEnds};
use plexus_net::framing::LengthPrefixFraming;
use plexus_net::transport::StreamTransport;
use plexus_net::{socket, ConnectionAcceptor, ReactorConfig, ReactorThread, SocketManager, StackFactory};

type Frame = Vec<u8>;

const BUFFER_CAPACITY: usize = 64;
const MIN_PULL_SIZE: usize = 16;

#[derive(Default)]
struct Batch {
    frames: Vec<Frame>,
    error: Option<NetError>,
}

impl Observer<Frame> for Batch {
    fn on_next(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    fn on_error(&mut self, err: &NetError) {
        self.error = Some(err.clone());
    }
}

fn echo_worker(id: usize, ends: BridgeEnds<Frame, Frame>) {
    let (Some(input), Some(output)) = (ends.inbound.try_open(), ends.outbound.try_open()) else {
        warn!(id, "connection buffers already taken");
        return;
    };
    let demand = Arc::new(DemandSignal::default());
    output.set_producer(demand.clone());
    let mut echoed = 0usize;
    loop {
        let mut batch = Batch::default();
        let (again, _) = input.pull_timeout(BUFFER_CAPACITY, Duration::from_millis(100), &mut batch);
        for frame in batch.frames {
            while output.available() >= output.capacity() && !output.is_closed() {
                demand.wait(Duration::from_millis(100));
            }
            output.push(frame);
            echoed += 1;
        }
        if !again {
            match batch.error {
                Some(err) => {
                    debug!(id, %err, "connection failed");
                    output.abort(err);
                }
                None => output.close(),
            }
            break;
        }
    }
    debug!(id, echoed, "worker done");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    let (tx, rx) = mpsc::channel::<BridgeEnds<Frame, Frame>>();
    let spawner = thread::Builder::new().name("lp-echo-spawner".into()).spawn(move || {
        for (id, ends) in rx.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("lp-echo-{id}"))
                .spawn(move || echo_worker(id, ends));
            if let Err(err) = spawned {
                warn!(id, %err, "failed to spawn worker");
            }
        }
    })?;

    let rt = ReactorThread::start(ReactorConfig::from_env())?;
    let factory = StackFactory::new(move || {
        let (bridge, ends) = Bridge::<Frame, Frame>::new(
            |bytes: &[u8]| Some(bytes.to_vec()),
            |frame: &Frame, out: &mut Vec<u8>| out.extend_from_slice(frame),
            BUFFER_CAPACITY,
            MIN_PULL_SIZE,
        );
        let _ = tx.send(ends);
        StreamTransport::make(LengthPrefixFraming::make(bridge))
    });

    let listener = socket::tcp_listen(Ipv4Addr::UNSPECIFIED, port, 1024)?;
    let acceptor = SocketManager::new(rt.reactor(), listener, ConnectionAcceptor::make(factory, max_conns));
    acceptor.init(&Settings::from_env("PLEXUS_"))?;
    info!(port, max_conns, "lp-echo listening");

    rt.join();
    let _ = spawner.join();
    Ok(())
}
