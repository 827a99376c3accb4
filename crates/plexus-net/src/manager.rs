//! # SocketManager - one socket, one layer stack
//!
//! A manager owns a socket descriptor and the head of a protocol stack (a
//! [`SocketEventLayer`]). It relays readiness from the reactor into the stack
//! and offers the stack a handful of control operations: (de)registering
//! interest, shutting down either direction, scheduling deferred work and
//! swapping the stack for a different protocol.
//!
//! Managers are reference counted. The reactor's interest table, scheduled
//! actions and flow adapters hold strong references; layers hold weak ones.
//! The descriptor is closed when the last strong reference goes away.
//!
//! Methods that take `self: &Arc<Self>` are safe to call from any thread.
//! The `handle_*` methods belong to the reactor thread.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace, warn};

use plexus_core::{NetError, Result, Settings};

use crate::layer::SocketEventLayer;
use crate::reactor::{Reactor, Shared};
use crate::socket;

type Handler = Box<dyn SocketEventLayer>;

pub struct SocketManager {
    fd: OwnedFd,
    reactor: Weak<Shared>,
    /// Only locked by the reactor thread, or by `init` before registration.
    handler: Mutex<Option<Handler>>,
    /// Settings from `init`, reused when a handover installs a new handler.
    settings: Mutex<Settings>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    disposed: AtomicBool,
}

impl SocketManager {
    /// Wrap `fd` with `handler`. Nothing is registered until [`init`](Self::init).
    pub fn new(reactor: &Reactor, fd: OwnedFd, handler: Handler) -> Arc<Self> {
        let mgr = Arc::new(Self {
            fd,
            reactor: reactor.downgrade(),
            handler: Mutex::new(Some(handler)),
            settings: Mutex::new(Settings::new()),
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        reactor.track(&mgr);
        mgr
    }

    fn handler(&self) -> MutexGuard<'_, Option<Handler>> {
        self.handler.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Accessors ──

    pub fn handle(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The owning reactor, if it is still alive.
    pub fn system(&self) -> Option<Reactor> {
        self.reactor.upgrade().map(Reactor::from_shared)
    }

    pub fn read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    pub fn write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    pub fn disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the reactor currently polls this socket for reading.
    pub fn is_reading(&self) -> bool {
        self.system().is_some_and(|r| r.is_reading(self))
    }

    /// Whether the reactor currently polls this socket for writing.
    pub fn is_writing(&self) -> bool {
        self.system().is_some_and(|r| r.is_writing(self))
    }

    /// Whether a handler is still installed.
    pub fn has_handler(&self) -> bool {
        self.handler().is_some()
    }

    // ── Lifecycle ──

    /// Switch the socket to non-blocking mode and initialize the handler.
    pub fn init(self: &Arc<Self>, cfg: &Settings) -> Result<()> {
        socket::set_nonblocking(self.handle(), true)?;
        *self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = cfg.clone();
        let mut guard = self.handler();
        match guard.as_mut() {
            Some(handler) => handler.init(self, cfg),
            None => Err(NetError::Logic("socket manager has no handler".into())),
        }
    }

    pub fn register_reading(self: &Arc<Self>) {
        if self.read_closed() || self.disposed() {
            return;
        }
        if let Some(reactor) = self.system() {
            reactor.register_reading(self);
        }
    }

    pub fn register_writing(self: &Arc<Self>) {
        if self.write_closed() || self.disposed() {
            return;
        }
        if let Some(reactor) = self.system() {
            reactor.register_writing(self);
        }
    }

    pub fn deregister_reading(self: &Arc<Self>) {
        if let Some(reactor) = self.system() {
            reactor.deregister_reading(self);
        }
    }

    pub fn deregister_writing(self: &Arc<Self>) {
        if let Some(reactor) = self.system() {
            reactor.deregister_writing(self);
        }
    }

    pub fn deregister(self: &Arc<Self>) {
        if let Some(reactor) = self.system() {
            reactor.deregister(self);
        }
    }

    /// Stop reading for good. Disposes the manager if writing is closed too.
    pub fn shutdown_read(self: &Arc<Self>) {
        self.deregister_reading();
        self.read_closed.store(true, Ordering::Release);
        if self.write_closed() {
            self.dispose();
        }
    }

    /// Stop writing for good. Disposes the manager if reading is closed too.
    pub fn shutdown_write(self: &Arc<Self>) {
        self.deregister_writing();
        self.write_closed.store(true, Ordering::Release);
        if self.read_closed() {
            self.dispose();
        }
    }

    /// Close both directions and dispose.
    pub fn shutdown(self: &Arc<Self>) {
        self.read_closed.store(true, Ordering::Release);
        self.write_closed.store(true, Ordering::Release);
        self.dispose();
    }

    /// Remove the manager from the reactor and abort its handler with
    /// `Disposed`. Only the first call has an effect.
    pub fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(fd = self.raw_fd(), "dispose");
        match self.system() {
            Some(reactor) => reactor.discard(self),
            None => self.release_handler(&NetError::Disposed),
        }
    }

    /// Fatal error: abort and drop the handler, then dispose.
    pub fn handle_error(self: &Arc<Self>, err: NetError) {
        self.deregister();
        self.release_handler(&err);
    }

    pub(crate) fn release_handler(&self, err: &NetError) {
        self.read_closed.store(true, Ordering::Release);
        self.write_closed.store(true, Ordering::Release);
        self.disposed.store(true, Ordering::Release);
        let handler = self.handler().take();
        if let Some(mut handler) = handler {
            debug!(fd = self.raw_fd(), %err, "releasing handler");
            handler.abort(err);
        }
    }

    // ── Deferred work ──

    /// Run `f` on the reactor thread, keeping this manager alive until then.
    pub fn schedule<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&Arc<SocketManager>) + Send + 'static,
    {
        let Some(reactor) = self.system() else {
            warn!(fd = self.raw_fd(), "dropping action: reactor is gone");
            return;
        };
        let strong = self.clone();
        reactor.schedule_fn(move || f(&strong));
    }

    /// Schedule `handle_continue_reading` on the handler.
    pub fn continue_reading(self: &Arc<Self>) {
        self.schedule(|mgr| mgr.handle_continue_reading());
    }

    /// Schedule `handle_continue_writing` on the handler.
    pub fn continue_writing(self: &Arc<Self>) {
        self.schedule(|mgr| mgr.handle_continue_writing());
    }

    /// Deregister, then ask the handler for a replacement and install it.
    ///
    /// The socket keeps its identity; the new handler is initialized with the
    /// settings this manager was initialized with.
    pub fn schedule_handover(self: &Arc<Self>) {
        self.deregister();
        self.schedule(|mgr| mgr.do_handover());
    }

    fn do_handover(self: &Arc<Self>) {
        let cfg = self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        let mut guard = self.handler();
        let Some(current) = guard.as_mut() else {
            return;
        };
        let Some(mut next) = current.do_handover() else {
            debug!(fd = self.raw_fd(), "handler declined handover");
            return;
        };
        let res = next.init(self, &cfg);
        let previous = guard.replace(next);
        drop(guard);
        drop(previous);
        if let Err(err) = res {
            warn!(fd = self.raw_fd(), %err, "handover target failed to initialize");
            self.handle_error(err);
        }
    }

    // ── Reactor callbacks ──

    pub fn handle_read_event(&self) {
        if let Some(handler) = self.handler().as_mut() {
            handler.handle_read_event();
        }
    }

    pub fn handle_write_event(&self) {
        if let Some(handler) = self.handler().as_mut() {
            handler.handle_write_event();
        }
    }

    pub fn handle_continue_reading(&self) {
        if let Some(handler) = self.handler().as_mut() {
            handler.handle_continue_reading();
        }
    }

    pub fn handle_continue_writing(&self) {
        if let Some(handler) = self.handler().as_mut() {
            handler.handle_continue_writing();
        }
    }
}

impl fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketManager")
            .field("fd", &self.raw_fd())
            .field("read_closed", &self.read_closed())
            .field("write_closed", &self.write_closed())
            .field("disposed", &self.disposed())
            .finish()
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        trace!(fd = self.fd.as_raw_fd(), "closing socket");
    }
}
