//! Bounded producer/consumer buffers with demand signaling
//!
//! A buffer connects one producer and one consumer, each of which may live on
//! any thread. It is created in pairs of *resources* that can be opened
//! exactly once:
//!
//! ```ignore
//! let (pull_side, push_side) = make_buffer_resource::<String>(8, 2);
//! let buf = push_side.try_open().unwrap();
//! buf.set_producer(my_producer);
//! ```
//!
//! # Flow control
//!
//! `push` never rejects an item while the buffer is open. It returns the
//! remaining capacity instead; a producer that sees 0 is expected to stop
//! and wait for `on_consumer_demand`. Demand is accumulated from pulled items
//! and signaled once it reaches `min_pull_size`, so a fast consumer does not
//! wake the producer on every single item.
//!
//! # Callbacks
//!
//! All [`Producer`] and [`Consumer`] callbacks are invoked after the internal
//! lock has been released, so they may call back into the buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::NetError;

/// Callbacks for the writing side of a buffer.
pub trait Producer: Send + Sync {
    /// Both ends are attached.
    fn on_consumer_ready(&self);
    /// The consumer went away; further pushes are discarded.
    fn on_consumer_cancel(&self);
    /// The consumer freed `demand` slots since the last signal.
    fn on_consumer_demand(&self, demand: usize);
}

/// Callbacks for the reading side of a buffer.
pub trait Consumer: Send + Sync {
    /// Both ends are attached.
    fn on_producer_ready(&self);
    /// New items, completion or an error are available to `pull`.
    fn on_producer_wakeup(&self);
}

/// Receives items during a `pull`.
pub trait Observer<T> {
    fn on_next(&mut self, item: T);

    fn on_complete(&mut self) {}

    fn on_error(&mut self, _err: &NetError) {}
}

impl<T, F: FnMut(T)> Observer<T> for F {
    fn on_next(&mut self, item: T) {
        self(item)
    }
}

struct State<T> {
    items: VecDeque<T>,
    /// Pulled items not yet reported to the producer.
    demand: usize,
    closed: bool,
    error: Option<NetError>,
    producer: Option<Arc<dyn Producer>>,
    consumer: Option<Arc<dyn Consumer>>,
}

/// Shared state between one producer and one consumer.
pub struct Buffer<T> {
    capacity: usize,
    min_pull_size: usize,
    state: Mutex<State<T>>,
    readable: Condvar,
}

/// Outcome of a terminal pull.
enum Terminal {
    Complete,
    Failed(NetError),
}

impl<T> Buffer<T> {
    /// Create a buffer. `min_pull_size` is clamped to `1..=capacity`.
    pub fn new(capacity: usize, min_pull_size: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            min_pull_size: min_pull_size.clamp(1, capacity),
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                demand: 0,
                closed: false,
                error: None,
                producer: None,
                consumer: None,
            }),
            readable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_pull_size(&self) -> usize {
        self.min_pull_size
    }

    /// Number of items waiting to be pulled.
    pub fn available(&self) -> usize {
        self.lock().items.len()
    }

    pub fn has_data(&self) -> bool {
        !self.lock().items.is_empty()
    }

    /// True once the producer closed or aborted, or the consumer cancelled.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once the buffer is closed and fully drained.
    pub fn has_consumer_event(&self) -> bool {
        let st = self.lock();
        st.closed && st.items.is_empty()
    }

    /// Attach the producer. Fires the ready callbacks if the consumer is
    /// already attached.
    pub fn set_producer(&self, producer: Arc<dyn Producer>) {
        let mut st = self.lock();
        if st.closed && st.consumer.is_none() {
            drop(st);
            producer.on_consumer_cancel();
            return;
        }
        st.producer = Some(producer);
        self.ready(st);
    }

    /// Attach the consumer. Fires the ready callbacks if the producer is
    /// already attached.
    pub fn set_consumer(&self, consumer: Arc<dyn Consumer>) {
        let mut st = self.lock();
        let pending = st.closed || !st.items.is_empty();
        st.consumer = Some(consumer.clone());
        if st.producer.is_some() {
            self.ready(st);
        } else {
            drop(st);
            if pending {
                consumer.on_producer_wakeup();
            }
        }
    }

    fn ready(&self, st: MutexGuard<'_, State<T>>) {
        let (Some(producer), Some(consumer)) = (st.producer.clone(), st.consumer.clone()) else {
            return;
        };
        let wakeup = !st.items.is_empty();
        drop(st);
        producer.on_consumer_ready();
        consumer.on_producer_ready();
        if wakeup {
            consumer.on_producer_wakeup();
        }
    }

    /// Append one item and return the remaining capacity.
    ///
    /// Returns 0 without storing the item if the buffer is closed.
    pub fn push(&self, item: T) -> usize {
        let mut st = self.lock();
        if st.closed {
            return 0;
        }
        st.items.push_back(item);
        let remaining = self.capacity.saturating_sub(st.items.len());
        let wakeup = if st.items.len() == 1 { st.consumer.clone() } else { None };
        drop(st);
        self.readable.notify_all();
        if let Some(consumer) = wakeup {
            consumer.on_producer_wakeup();
        }
        remaining
    }

    /// Append all items, returning the remaining capacity afterwards.
    pub fn push_all<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        let mut st = self.lock();
        if st.closed {
            return 0;
        }
        let was_empty = st.items.is_empty();
        st.items.extend(items);
        let remaining = self.capacity.saturating_sub(st.items.len());
        let wakeup = if was_empty && !st.items.is_empty() {
            st.consumer.clone()
        } else {
            None
        };
        drop(st);
        self.readable.notify_all();
        if let Some(consumer) = wakeup {
            consumer.on_producer_wakeup();
        }
        remaining
    }

    /// Producer side: no more items will follow.
    pub fn close(&self) {
        self.terminate(None);
    }

    /// Producer side: no more items will follow, and the consumer sees `err`
    /// after draining what is buffered.
    pub fn abort(&self, err: NetError) {
        self.terminate(Some(err));
    }

    fn terminate(&self, err: Option<NetError>) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.error = err;
        st.producer = None;
        let consumer = st.consumer.clone();
        drop(st);
        self.readable.notify_all();
        if let Some(consumer) = consumer {
            consumer.on_producer_wakeup();
        }
    }

    /// Consumer side: stop receiving. Buffered items are discarded and the
    /// producer is told to stop.
    pub fn cancel(&self) {
        let mut st = self.lock();
        st.consumer = None;
        let dropped = std::mem::take(&mut st.items);
        let producer = st.producer.take();
        if !st.closed {
            st.closed = true;
            st.error = Some(NetError::Cancelled);
        }
        drop(st);
        trace!(discarded = dropped.len(), "buffer cancelled by consumer");
        drop(dropped);
        self.readable.notify_all();
        if let Some(producer) = producer {
            producer.on_consumer_cancel();
        }
    }

    /// Deliver up to `max` items to `observer`.
    ///
    /// Returns `(again, consumed)`: `again` is false once the buffer reached
    /// its terminal state, in which case `on_complete` or `on_error` was
    /// called after the last item.
    pub fn pull<O: Observer<T>>(&self, max: usize, observer: &mut O) -> (bool, usize) {
        let mut st = self.lock();
        let n = max.min(st.items.len());
        let batch: Vec<T> = st.items.drain(..n).collect();
        let mut signal = None;
        if n > 0 {
            st.demand += n;
            if st.demand >= self.min_pull_size {
                if let Some(producer) = st.producer.clone() {
                    signal = Some((producer, st.demand));
                    st.demand = 0;
                }
            }
        }
        let terminal = if st.closed && st.items.is_empty() {
            st.consumer = None;
            Some(match &st.error {
                Some(err) => Terminal::Failed(err.clone()),
                None => Terminal::Complete,
            })
        } else {
            None
        };
        drop(st);

        for item in batch {
            observer.on_next(item);
        }
        if let Some((producer, demand)) = signal {
            producer.on_consumer_demand(demand);
        }
        match terminal {
            Some(Terminal::Complete) => {
                observer.on_complete();
                (false, n)
            }
            Some(Terminal::Failed(err)) => {
                observer.on_error(&err);
                (false, n)
            }
            None => (true, n),
        }
    }

    /// Block the calling thread until items arrive, the buffer terminates,
    /// or `timeout` elapses, then `pull`.
    ///
    /// Never call this from the reactor thread.
    pub fn pull_timeout<O: Observer<T>>(
        &self,
        max: usize,
        timeout: Duration,
        observer: &mut O,
    ) -> (bool, usize) {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        while st.items.is_empty() && !st.closed {
            let now = Instant::now();
            if now >= deadline {
                return (true, 0);
            }
            st = match self.readable.wait_timeout(st, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(st);
        self.pull(max, observer)
    }
}

/// [`Producer`] for a worker thread that blocks until the consumer frees
/// capacity.
///
/// ```ignore
/// let signal = Arc::new(DemandSignal::default());
/// buf.set_producer(signal.clone());
/// while buf.available() >= buf.capacity() && !buf.is_closed() {
///     signal.wait(Duration::from_millis(100));
/// }
/// ```
#[derive(Default)]
pub struct DemandSignal {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl DemandSignal {
    /// Block until demand or cancellation was signaled since the last call,
    /// or `timeout` elapses. Returns whether a signal arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*signaled {
            signaled = match self.cond.wait_timeout(signaled, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        std::mem::replace(&mut *signaled, false)
    }

    fn notify(&self) {
        *self.signaled.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.cond.notify_all();
    }
}

impl Producer for DemandSignal {
    fn on_consumer_ready(&self) {}

    fn on_consumer_cancel(&self) {
        self.notify();
    }

    fn on_consumer_demand(&self, _demand: usize) {
        self.notify();
    }
}

struct Slot<T> {
    buf: Mutex<Option<Arc<Buffer<T>>>>,
}

impl<T> Slot<T> {
    fn take(&self) -> Option<Arc<Buffer<T>>> {
        self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }
}

/// Read end of a buffer, openable once.
pub struct ConsumerResource<T> {
    slot: Arc<Slot<T>>,
}

/// Write end of a buffer, openable once.
pub struct ProducerResource<T> {
    slot: Arc<Slot<T>>,
}

impl<T> ConsumerResource<T> {
    pub fn try_open(&self) -> Option<Arc<Buffer<T>>> {
        self.slot.take()
    }
}

impl<T> ProducerResource<T> {
    pub fn try_open(&self) -> Option<Arc<Buffer<T>>> {
        self.slot.take()
    }
}

impl<T> Clone for ConsumerResource<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> Clone for ProducerResource<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

/// Create a buffer and return its two resources.
pub fn make_buffer_resource<T>(
    capacity: usize,
    min_pull_size: usize,
) -> (ConsumerResource<T>, ProducerResource<T>) {
    let buf = Arc::new(Buffer::new(capacity, min_pull_size));
    let pull_side = Slot { buf: Mutex::new(Some(buf.clone())) };
    let push_side = Slot { buf: Mutex::new(Some(buf)) };
    (
        ConsumerResource { slot: Arc::new(pull_side) },
        ProducerResource { slot: Arc::new(push_side) },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct CountingProducer {
        ready: AtomicUsize,
        cancelled: AtomicUsize,
        demand: AtomicUsize,
        signals: AtomicUsize,
    }

    impl Producer for CountingProducer {
        fn on_consumer_ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
        fn on_consumer_cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        fn on_consumer_demand(&self, demand: usize) {
            self.demand.fetch_add(demand, Ordering::SeqCst);
            self.signals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingConsumer {
        ready: AtomicUsize,
        wakeups: AtomicUsize,
    }

    impl Consumer for CountingConsumer {
        fn on_producer_ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
        fn on_producer_wakeup(&self) {
            self.wakeups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Collect {
        items: Vec<u32>,
        completed: bool,
        error: Option<NetError>,
    }

    impl Observer<u32> for Collect {
        fn on_next(&mut self, item: u32) {
            self.items.push(item);
        }
        fn on_complete(&mut self) {
            self.completed = true;
        }
        fn on_error(&mut self, err: &NetError) {
            self.error = Some(err.clone());
        }
    }

    fn attached(cap: usize, min: usize) -> (Arc<Buffer<u32>>, Arc<CountingProducer>, Arc<CountingConsumer>) {
        let (pull_side, push_side) = make_buffer_resource::<u32>(cap, min);
        let buf = push_side.try_open().unwrap();
        assert!(push_side.try_open().is_none());
        let read_buf = pull_side.try_open().unwrap();
        assert!(Arc::ptr_eq(&buf, &read_buf));
        let producer = Arc::new(CountingProducer::default());
        let consumer = Arc::new(CountingConsumer::default());
        buf.set_producer(producer.clone());
        buf.set_consumer(consumer.clone());
        (buf, producer, consumer)
    }

    #[test]
    fn test_ready_fires_once_both_attached() {
        let (_buf, producer, consumer) = attached(4, 1);
        assert_eq!(producer.ready.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_reports_remaining_capacity() {
        let (buf, _p, consumer) = attached(3, 1);
        assert_eq!(buf.push(1), 2);
        assert_eq!(consumer.wakeups.load(Ordering::SeqCst), 1);
        assert_eq!(buf.push(2), 1);
        assert_eq!(buf.push(3), 0);
        // over capacity is kept, never dropped
        assert_eq!(buf.push(4), 0);
        assert_eq!(buf.available(), 4);
        assert_eq!(consumer.wakeups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_demand_signaled_at_min_pull_size() {
        let (buf, producer, _c) = attached(8, 2);
        for i in 0..8 {
            buf.push(i);
        }
        let mut out = Collect::default();
        assert_eq!(buf.pull(1, &mut out), (true, 1));
        assert_eq!(producer.signals.load(Ordering::SeqCst), 0);
        assert_eq!(buf.pull(1, &mut out), (true, 1));
        assert_eq!(producer.signals.load(Ordering::SeqCst), 1);
        assert_eq!(producer.demand.load(Ordering::SeqCst), 2);
        assert_eq!(buf.pull(10, &mut out), (true, 6));
        assert_eq!(producer.demand.load(Ordering::SeqCst), 8);
        assert_eq!(out.items, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_drains_then_completes() {
        let (buf, _p, consumer) = attached(4, 1);
        buf.push(7);
        buf.close();
        assert_eq!(buf.push(8), 0);
        assert_eq!(consumer.wakeups.load(Ordering::SeqCst), 2);
        let mut out = Collect::default();
        assert_eq!(buf.pull(10, &mut out), (false, 1));
        assert_eq!(out.items, vec![7]);
        assert!(out.completed);
        assert!(out.error.is_none());
    }

    #[test]
    fn test_abort_surfaces_error_after_items() {
        let (buf, _p, _c) = attached(4, 1);
        buf.push(1);
        buf.abort(NetError::Protocol("garbage".into()));
        let mut out = Collect::default();
        assert_eq!(buf.pull(10, &mut out), (false, 1));
        assert!(!out.completed);
        assert_eq!(out.error, Some(NetError::Protocol("garbage".into())));
    }

    #[test]
    fn test_cancel_notifies_producer() {
        let (buf, producer, _c) = attached(4, 1);
        buf.push(1);
        buf.cancel();
        assert_eq!(producer.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(buf.available(), 0);
        assert_eq!(buf.push(2), 0);
        assert!(buf.is_closed());
    }

    #[test]
    fn test_pull_timeout_wakes_on_push() {
        let (buf, _p, _c) = attached(4, 1);
        let writer = buf.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.push(42);
            writer.close();
        });
        let mut got = Vec::new();
        loop {
            let (again, _) = buf.pull_timeout(4, Duration::from_secs(5), &mut |x: u32| got.push(x));
            if !again {
                break;
            }
        }
        handle.join().unwrap();
        assert_eq!(got, vec![42]);
    }

    #[test]
    fn test_pull_timeout_expires() {
        let buf = Buffer::<u32>::new(2, 1);
        let mut out = Collect::default();
        assert_eq!(buf.pull_timeout(1, Duration::from_millis(10), &mut out), (true, 0));
    }

    #[test]
    fn test_demand_signal_wakes_blocked_producer() {
        let (pull_side, push_side) = make_buffer_resource::<u32>(2, 1);
        let buf = push_side.try_open().unwrap();
        let reader = pull_side.try_open().unwrap();
        let signal = Arc::new(DemandSignal::default());
        buf.set_producer(signal.clone());

        let handle = thread::spawn(move || {
            for i in 0..6 {
                while buf.available() >= buf.capacity() && !buf.is_closed() {
                    signal.wait(Duration::from_secs(5));
                }
                buf.push(i);
            }
            buf.close();
        });

        let mut out = Collect::default();
        while !out.completed {
            reader.pull_timeout(1, Duration::from_secs(5), &mut out);
        }
        handle.join().unwrap();
        assert_eq!(out.items, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_demand_signal_remembers_early_signal() {
        let signal = DemandSignal::default();
        assert!(!signal.wait(Duration::from_millis(1)));
        signal.on_consumer_demand(3);
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(!signal.wait(Duration::from_millis(1)));
        signal.on_consumer_cancel();
        assert!(signal.wait(Duration::from_millis(1)));
    }
}
