//! # plexus-net - Layered Non-blocking Networking
//!
//! A single-threaded readiness reactor driving per-socket protocol stacks.
//!
//! ## Features
//!
//! - **Reactor**: `poll(2)` loop with an eventfd wakeup, cross-thread
//!   registration and a FIFO action queue
//! - **Socket managers**: one per socket, owning its handle and the head of
//!   a layer stack
//! - **Layers**: stream transport, length-prefix framing, HTTP/1.1 server
//! - **Acceptor**: turns a listening socket into child managers
//! - **Flow adapters**: move items between stacks and worker threads through
//!   bounded buffers with backpressure
//!
//! ## Quick Start
//!
//! ```ignore
//! use plexus_net::{ConnectionAcceptor, ReactorThread, ReactorConfig, SocketManager, StackFactory};
//! use plexus_net::{framing::LengthPrefixFraming, transport::StreamTransport};
//!
//! let rt = ReactorThread::start(ReactorConfig::from_env())?;
//! let listener = plexus_net::socket::tcp_listen(Ipv4Addr::LOCALHOST, 4000, 128)?;
//! let factory = StackFactory::new(|| StreamTransport::make(LengthPrefixFraming::make(Echo)));
//! let mgr = SocketManager::new(rt.reactor(), listener, ConnectionAcceptor::make(factory, 0));
//! mgr.init(&Settings::from_env("PLEXUS_"))?;
//! rt.join();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │           Application / worker threads                   │
//! │        Buffer<T> pull / push, Responder                  │
//! └──────────────────────────────────────────────────────────┘
//!                  ▲                       │
//!                  │  flow adapters        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   message / http UpperLayer   (ConsumerAdapter, ...)     │
//! ├──────────────────────────────────────────────────────────┤
//! │   LengthPrefixFraming  |  HttpServer                     │
//! ├──────────────────────────────────────────────────────────┤
//! │   StreamTransport      |  ConnectionAcceptor             │
//! └──────────────────────────────────────────────────────────┘
//!                              │ SocketEventLayer
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   SocketManager  (fd, handler, read/write closed flags)  │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Reactor  (interest table, update queue, action queue)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All layer callbacks run on the reactor thread. Other threads interact with
//! a stack only through `SocketManager` methods that enqueue work and through
//! the buffers behind the flow adapters.

pub mod acceptor;
pub mod flow;
pub mod framing;
pub mod http;
pub mod layer;
pub mod manager;
pub mod notifier;
pub mod reactor;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod testing;

pub use acceptor::{ConnectionAcceptor, ConnectionFactory, StackFactory};
pub use layer::SocketEventLayer;
pub use manager::SocketManager;
pub use reactor::{Reactor, ReactorConfig, ReactorThread};

pub use plexus_core::{
    make_buffer_resource, Action, Buffer, ConsumerResource, Disposable, NetError, ProducerResource,
    Result, Settings,
};
