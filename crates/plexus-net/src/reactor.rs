//! # Reactor - the readiness poller
//!
//! The reactor owns the interest table (socket → {reading, writing}) and a
//! queue of deferred actions. One thread drives it; each iteration:
//! 1. Applies registration updates submitted from any thread
//! 2. Polls readiness for every registered socket plus a wakeup eventfd
//! 3. Dispatches read/write readiness to the owning `SocketManager`
//! 4. Runs the actions that were queued before this step started (FIFO)
//!
//! Foreign threads never touch the table. They push updates and actions into
//! lock-free queues and poke the eventfd; the reactor thread applies them at
//! its next opportunity.
//!
//! ```ignore
//! let rt = ReactorThread::start(ReactorConfig::from_env())?;
//! let mgr = SocketManager::new(rt.reactor(), fd, Box::new(transport));
//! mgr.init(&Settings::new())?;
//! ```

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use crossbeam_queue::SegQueue;
use tracing::{debug, error, trace, warn};

use plexus_core::{NetError, Result, Settings};

use crate::manager::SocketManager;
use crate::notifier::EventFdNotifier;
use crate::socket;

/// Settings key for the reactor thread name.
pub const KEY_THREAD_NAME: &str = "plexus.reactor.thread-name";
/// Settings key for the per-iteration action budget (0 = unlimited).
pub const KEY_MAX_ACTIONS_PER_POLL: &str = "plexus.reactor.max-actions-per-poll";

/// Reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Name of the OS thread started by [`ReactorThread`].
    pub thread_name: String,
    /// Upper bound on actions run per iteration; 0 runs everything queued.
    pub max_actions_per_poll: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            thread_name: "plexus-reactor".into(),
            max_actions_per_poll: 0,
        }
    }
}

impl ReactorConfig {
    /// Defaults overridden by `PLEXUS_REACTOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_settings(&Settings::from_env("PLEXUS_"))
    }

    pub fn from_settings(cfg: &Settings) -> Self {
        let defaults = Self::default();
        Self {
            thread_name: cfg.get_or(KEY_THREAD_NAME, defaults.thread_name),
            max_actions_per_poll: cfg.get_or(KEY_MAX_ACTIONS_PER_POLL, defaults.max_actions_per_poll),
        }
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn max_actions_per_poll(mut self, n: usize) -> Self {
        self.max_actions_per_poll = n;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    const READ: Interest = Interest { read: true, write: false };
    const WRITE: Interest = Interest { read: false, write: true };
    const BOTH: Interest = Interest { read: true, write: true };
}

enum Update {
    Register(Arc<SocketManager>, Interest),
    Deregister(Arc<SocketManager>, Interest),
    Discard(Arc<SocketManager>),
}

struct Entry {
    mgr: Arc<SocketManager>,
    reading: bool,
    writing: bool,
}

type Job = Box<dyn FnOnce() + Send>;

/// State shared between the reactor thread and everyone submitting work.
pub(crate) struct Shared {
    /// Interest table. Only mutated while applying updates.
    table: Mutex<HashMap<RawFd, Entry>>,
    updates: SegQueue<Update>,
    actions: SegQueue<Job>,
    notifier: EventFdNotifier,
    shutdown: AtomicBool,
    /// Every manager created against this reactor, for teardown.
    known: Mutex<Vec<Weak<SocketManager>>>,
    config: ReactorConfig,
}

/// Cloneable handle to a reactor.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                table: Mutex::new(HashMap::new()),
                updates: SegQueue::new(),
                actions: SegQueue::new(),
                notifier: EventFdNotifier::create()?,
                shutdown: AtomicBool::new(false),
                known: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.shared.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RawFd, Entry>> {
        self.shared.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Cross-thread submission ──

    fn submit(&self, update: Update) {
        self.shared.updates.push(update);
        self.wake();
    }

    fn wake(&self) {
        if let Err(err) = self.shared.notifier.notify() {
            warn!(%err, "failed to wake reactor");
        }
    }

    pub fn register_reading(&self, mgr: &Arc<SocketManager>) {
        self.submit(Update::Register(mgr.clone(), Interest::READ));
    }

    pub fn register_writing(&self, mgr: &Arc<SocketManager>) {
        self.submit(Update::Register(mgr.clone(), Interest::WRITE));
    }

    pub fn deregister_reading(&self, mgr: &Arc<SocketManager>) {
        self.submit(Update::Deregister(mgr.clone(), Interest::READ));
    }

    pub fn deregister_writing(&self, mgr: &Arc<SocketManager>) {
        self.submit(Update::Deregister(mgr.clone(), Interest::WRITE));
    }

    /// Remove both interests.
    pub fn deregister(&self, mgr: &Arc<SocketManager>) {
        self.submit(Update::Deregister(mgr.clone(), Interest::BOTH));
    }

    /// Remove the manager and release its handler with `Disposed`.
    pub(crate) fn discard(&self, mgr: &Arc<SocketManager>) {
        self.submit(Update::Discard(mgr.clone()));
    }

    /// Queue `f` to run on the reactor thread after the next dispatch round.
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.actions.push(Box::new(f));
        self.wake();
    }

    /// Ask a running [`run`](Self::run) loop to stop.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn track(&self, mgr: &Arc<SocketManager>) {
        let mut known = self.shared.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if known.len() >= 256 && known.len() % 256 == 0 {
            known.retain(|w| w.strong_count() > 0);
        }
        known.push(Arc::downgrade(mgr));
    }

    // ── Observation (reflects applied updates only) ──

    /// Number of managers with at least one registered interest.
    pub fn num_socket_managers(&self) -> usize {
        self.table().len()
    }

    pub fn is_reading(&self, mgr: &SocketManager) -> bool {
        self.lookup(mgr.raw_fd())
            .is_some_and(|(m, reading, _)| std::ptr::eq(&*m, mgr) && reading)
    }

    pub fn is_writing(&self, mgr: &SocketManager) -> bool {
        self.lookup(mgr.raw_fd())
            .is_some_and(|(m, _, writing)| std::ptr::eq(&*m, mgr) && writing)
    }

    fn lookup(&self, fd: RawFd) -> Option<(Arc<SocketManager>, bool, bool)> {
        self.table()
            .get(&fd)
            .map(|e| (e.mgr.clone(), e.reading, e.writing))
    }

    // ── Reactor thread ──

    /// Run one iteration. Returns false without polling when no manager is
    /// registered and no update or action is pending.
    pub fn poll_once(&self, blocking: bool) -> bool {
        self.apply_updates();
        if self.is_idle() {
            return false;
        }
        self.poll_and_dispatch(blocking);
        self.apply_updates();
        self.run_actions();
        true
    }

    /// Loop until [`shutdown`](Self::shutdown), then dispose every manager.
    pub fn run(&self) {
        debug!(thread = ?thread::current().name(), "reactor started");
        while !self.is_shutting_down() {
            if !self.poll_once(true) {
                self.wait_for_wakeup();
            }
        }
        self.dispose_all();
        debug!("reactor stopped");
    }

    fn is_idle(&self) -> bool {
        self.shared.actions.is_empty() && self.shared.updates.is_empty() && self.table().is_empty()
    }

    fn apply_updates(&self) {
        if self.shared.updates.is_empty() {
            return;
        }
        // Dropped after the table lock is released.
        let mut released = Vec::new();
        let mut discarded = Vec::new();
        {
            let mut table = self.table();
            while let Some(update) = self.shared.updates.pop() {
                match update {
                    Update::Register(mgr, interest) => {
                        if !mgr.disposed() {
                            let fd = mgr.raw_fd();
                            let entry = table.entry(fd).or_insert_with(|| Entry {
                                mgr: mgr.clone(),
                                reading: false,
                                writing: false,
                            });
                            entry.reading |= interest.read;
                            entry.writing |= interest.write;
                            trace!(fd, reading = entry.reading, writing = entry.writing, "register");
                        }
                        released.push(mgr);
                    }
                    Update::Deregister(mgr, interest) => {
                        let fd = mgr.raw_fd();
                        let empty = match table.get_mut(&fd) {
                            Some(entry) => {
                                if interest.read {
                                    entry.reading = false;
                                }
                                if interest.write {
                                    entry.writing = false;
                                }
                                trace!(fd, reading = entry.reading, writing = entry.writing, "deregister");
                                !entry.reading && !entry.writing
                            }
                            None => false,
                        };
                        if empty {
                            if let Some(entry) = table.remove(&fd) {
                                released.push(entry.mgr);
                            }
                        }
                        released.push(mgr);
                    }
                    Update::Discard(mgr) => {
                        if let Some(entry) = table.remove(&mgr.raw_fd()) {
                            released.push(entry.mgr);
                        }
                        discarded.push(mgr);
                    }
                }
            }
        }
        for mgr in discarded {
            mgr.release_handler(&NetError::Disposed);
        }
        drop(released);
    }

    fn poll_and_dispatch(&self, blocking: bool) {
        let mut fds = {
            let table = self.table();
            let mut fds = Vec::with_capacity(table.len() + 1);
            fds.push(libc::pollfd {
                fd: self.shared.notifier.fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for (fd, entry) in table.iter() {
                let mut events = 0;
                if entry.reading {
                    events |= libc::POLLIN;
                }
                if entry.writing {
                    events |= libc::POLLOUT;
                }
                fds.push(libc::pollfd { fd: *fd, events, revents: 0 });
            }
            fds
        };

        let timeout = if blocking && self.shared.actions.is_empty() && self.shared.updates.is_empty() {
            -1
        } else {
            0
        };
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(%err, "poll failed");
            }
            return;
        }
        if ret == 0 {
            return;
        }
        if fds[0].revents != 0 {
            self.shared.notifier.drain();
        }
        for pfd in &fds[1..] {
            if pfd.revents != 0 {
                self.dispatch(pfd.fd, pfd.revents);
            }
        }
    }

    fn dispatch(&self, fd: RawFd, revents: libc::c_short) {
        // Earlier callbacks in this round may have deregistered or disposed.
        self.apply_updates();
        let Some((mgr, reading, writing)) = self.lookup(fd) else {
            return;
        };
        if mgr.disposed() {
            return;
        }

        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            let code = match socket::pending_error(mgr.handle()) {
                0 => libc::EIO,
                code => code,
            };
            warn!(fd, code, "socket error reported by poll");
            let removed = self.table().remove(&fd);
            mgr.release_handler(&NetError::SocketOperationFailed { op: "poll", code });
            drop(removed);
            return;
        }

        let hangup = revents & libc::POLLHUP != 0;
        if reading && (revents & libc::POLLIN != 0 || hangup) {
            mgr.handle_read_event();
        }

        let writable = revents & libc::POLLOUT != 0 || (hangup && !reading);
        if writable {
            self.apply_updates();
            if let Some((current, _, true)) = self.lookup(fd) {
                if Arc::ptr_eq(&current, &mgr) && !current.disposed() {
                    current.handle_write_event();
                }
            }
        }
    }

    fn run_actions(&self) {
        let pending = self.shared.actions.len();
        let limit = match self.shared.config.max_actions_per_poll {
            0 => pending,
            max => pending.min(max),
        };
        for _ in 0..limit {
            match self.shared.actions.pop() {
                Some(job) => job(),
                None => break,
            }
        }
    }

    fn wait_for_wakeup(&self) {
        let mut pfd = libc::pollfd {
            fd: self.shared.notifier.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret > 0 {
            self.shared.notifier.drain();
        }
    }

    /// Dispose every live manager and drop pending work.
    ///
    /// Called by `run` on shutdown; single-threaded drivers call it directly
    /// once they are done polling.
    pub fn dispose_all(&self) {
        self.apply_updates();
        let live: Vec<Arc<SocketManager>> = {
            let mut known = self.shared.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            known.drain(..).filter_map(|w| w.upgrade()).collect()
        };
        debug!(count = live.len(), "disposing socket managers");
        for mgr in &live {
            mgr.dispose();
        }
        self.apply_updates();
        let rest: Vec<Entry> = self.table().drain().map(|(_, e)| e).collect();
        drop(rest);
        while let Some(job) = self.shared.actions.pop() {
            drop(job);
        }
        drop(live);
    }
}

/// A reactor running on its own OS thread.
pub struct ReactorThread {
    reactor: Reactor,
    thread: Option<thread::JoinHandle<()>>,
}

impl ReactorThread {
    /// Create a reactor and start its loop on a dedicated thread.
    pub fn start(config: ReactorConfig) -> Result<Self> {
        let name = config.thread_name.clone();
        let reactor = Reactor::new(config)?;
        let looping = reactor.clone();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || looping.run())
            .map_err(|e| NetError::Runtime(format!("failed to spawn reactor thread: {e}")))?;
        Ok(Self {
            reactor,
            thread: Some(thread),
        })
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Block until the loop exits (after someone calls `Reactor::shutdown`).
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Stop the loop and wait for the thread.
    pub fn shutdown(&mut self) {
        self.reactor.shutdown();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
