//! HTTP time server
//!
//! Requests are queued per connection by a [`RequestAdapter`] and answered
//! by a worker thread with the current Unix time.
//!
//! Usage:
//!     ./target/release/http-time [port]
//!
//! Test with:
//!     curl http://localhost:8080/

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use plexus_core::{make_buffer_resource, ConsumerResource, Settings};
use plexus_net::http::{HttpError, HttpRequest, HttpServer, RequestAdapter, Status};
use plexus_net::transport::StreamTransport;
use plexus_net::{socket, ConnectionAcceptor, ReactorConfig, ReactorThread, SocketManager, StackFactory};

const QUEUE_CAPACITY: usize = 32;

fn now() -> String {
    let since = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:03}\n", since.as_secs(), since.subsec_millis())
}

fn answer(req: HttpRequest) {
    let (request, responder) = req.into_parts();
    if request.method() != "GET" {
        responder.fail(HttpError::new(Status::METHOD_NOT_ALLOWED, "only GET is supported"));
        return;
    }
    match request.path() {
        "/" | "/time" => responder.respond(Status::OK, "text/plain", now()),
        other => responder.fail(HttpError::new(Status::NOT_FOUND, format!("{other} not found"))),
    }
}

fn time_worker(id: usize, requests: ConsumerResource<HttpRequest>) {
    let Some(queue) = requests.try_open() else {
        warn!(id, "request queue already taken");
        return;
    };
    let mut served = 0usize;
    loop {
        let mut batch = Vec::new();
        let (again, _) = queue.pull_timeout(QUEUE_CAPACITY, Duration::from_millis(100), &mut |r: HttpRequest| {
            batch.push(r)
        });
        served += batch.len();
        batch.into_iter().for_each(answer);
        if !again {
            break;
        }
    }
    debug!(id, served, "connection closed");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let port: u16 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(8080);

    let (tx, rx) = mpsc::channel::<ConsumerResource<HttpRequest>>();
    let spawner = thread::Builder::new().name("http-time-spawner".into()).spawn(move || {
        for (id, requests) in rx.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("http-time-{id}"))
                .spawn(move || time_worker(id, requests));
            if let Err(err) = spawned {
                warn!(id, %err, "failed to spawn worker");
            }
        }
    })?;

    let rt = ReactorThread::start(ReactorConfig::from_env())?;
    let factory = StackFactory::new(move || {
        let (pull_side, push_side) = make_buffer_resource(QUEUE_CAPACITY, QUEUE_CAPACITY / 4);
        let _ = tx.send(pull_side);
        StreamTransport::make(HttpServer::make(RequestAdapter::new(push_side)))
    });

    let listener = socket::tcp_listen(Ipv4Addr::UNSPECIFIED, port, 1024)?;
    let acceptor = SocketManager::new(rt.reactor(), listener, ConnectionAcceptor::make(factory, 0));
    acceptor.init(&Settings::from_env("PLEXUS_"))?;
    info!(port, "http-time listening");

    rt.join();
    let _ = spawner.join();
    Ok(())
}
