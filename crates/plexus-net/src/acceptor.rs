//! # Connection acceptor
//!
//! A [`SocketEventLayer`] for listening sockets. Every read event drains the
//! accept queue until the kernel reports would-block; each accepted socket is
//! turned into a child [`SocketManager`] by a [`ConnectionFactory`] and
//! initialized with the acceptor's settings.
//!
//! Failure handling:
//!
//! - factory failure or a hard accept error (`EMFILE`, ...) stops the acceptor
//! - a child that fails to initialize is disposed; the acceptor keeps going
//!
//! With a connection limit, the acceptor stops reading for good once the
//! limit is reached.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};

use plexus_core::{NetError, Result, Settings};

use crate::layer::SocketEventLayer;
use crate::manager::SocketManager;
use crate::reactor::Reactor;
use crate::socket::{self, AcceptOutcome};

/// Builds the managers for accepted sockets.
pub trait ConnectionFactory: Send {
    /// Called once when the acceptor is initialized.
    fn start(&mut self, _owner: &Arc<SocketManager>, _cfg: &Settings) -> Result<()> {
        Ok(())
    }

    /// Wrap an accepted socket. The acceptor calls `init` on the result.
    fn make(&mut self, reactor: &Reactor, fd: OwnedFd) -> Result<Arc<SocketManager>>;

    /// No more connections follow: the acceptor went away or reached its
    /// limit (`NetError::ConnectionLimit`). Called at most once.
    fn abort(&mut self, _reason: &NetError) {}
}

/// Factory that installs a freshly built stack on every accepted socket.
pub struct StackFactory<F> {
    build: F,
}

impl<F> StackFactory<F>
where
    F: FnMut() -> Box<dyn SocketEventLayer> + Send,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F> ConnectionFactory for StackFactory<F>
where
    F: FnMut() -> Box<dyn SocketEventLayer> + Send,
{
    fn make(&mut self, reactor: &Reactor, fd: OwnedFd) -> Result<Arc<SocketManager>> {
        Ok(SocketManager::new(reactor, fd, (self.build)()))
    }
}

pub struct ConnectionAcceptor<F> {
    factory: F,
    /// Maximum number of children; 0 for no limit.
    limit: usize,
    accepted: usize,
    owner: Weak<SocketManager>,
    cfg: Settings,
    aborted: bool,
}

impl<F: ConnectionFactory + 'static> ConnectionAcceptor<F> {
    pub fn new(factory: F, limit: usize) -> Self {
        Self {
            factory,
            limit,
            accepted: 0,
            owner: Weak::new(),
            cfg: Settings::new(),
            aborted: false,
        }
    }

    /// Boxed acceptor, ready for `SocketManager::new`.
    pub fn make(factory: F, limit: usize) -> Box<dyn SocketEventLayer> {
        Box::new(Self::new(factory, limit))
    }

    /// Returns false once the acceptor stopped.
    fn spawn(&mut self, owner: &Arc<SocketManager>, reactor: &Reactor, fd: OwnedFd) -> bool {
        let child = match self.factory.make(reactor, fd) {
            Ok(child) => child,
            Err(err) => {
                error!(fd = owner.raw_fd(), %err, "connection factory failed, stopping acceptor");
                owner.deregister();
                return false;
            }
        };
        if let Err(err) = child.init(&self.cfg) {
            warn!(fd = child.raw_fd(), %err, "failed to initialize connection");
            child.dispose();
            return true;
        }
        self.accepted += 1;
        debug!(fd = child.raw_fd(), accepted = self.accepted, "connection accepted");
        if self.limit > 0 && self.accepted >= self.limit {
            let reason = NetError::ConnectionLimit;
            info!(limit = self.limit, %reason, "acceptor stops reading");
            owner.shutdown_read();
            self.stop(&reason);
            return false;
        }
        true
    }

    /// Tell the factory that no more connections follow. Runs once.
    fn stop(&mut self, reason: &NetError) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.factory.abort(reason);
    }
}

impl<F: ConnectionFactory + 'static> SocketEventLayer for ConnectionAcceptor<F> {
    fn init(&mut self, owner: &Arc<SocketManager>, cfg: &Settings) -> Result<()> {
        self.owner = Arc::downgrade(owner);
        self.cfg = cfg.clone();
        self.factory.start(owner, cfg)?;
        owner.register_reading();
        Ok(())
    }

    fn handle_read_event(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let Some(reactor) = owner.system() else {
            return;
        };
        loop {
            match socket::accept(owner.raw_fd()) {
                AcceptOutcome::Accepted(fd) => {
                    if !self.spawn(&owner, &reactor, fd) {
                        return;
                    }
                }
                AcceptOutcome::WouldBlock => return,
                AcceptOutcome::Failed(code) => {
                    let err = NetError::SocketOperationFailed { op: "accept", code };
                    error!(fd = owner.raw_fd(), %err, "accept failed, stopping acceptor");
                    owner.deregister();
                    return;
                }
            }
        }
    }

    fn handle_write_event(&mut self) {
        error!("acceptor received a write event");
        if let Some(owner) = self.owner.upgrade() {
            owner.deregister_writing();
        }
    }

    fn abort(&mut self, reason: &NetError) {
        self.stop(reason);
    }
}
