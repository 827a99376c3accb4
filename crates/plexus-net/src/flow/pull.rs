use std::sync::{Arc, Weak};

use plexus_core::buffer::{Consumer, Observer};
use plexus_core::{Action, Buffer, ConsumerResource, Disposable};

use super::schedule_on;
use crate::manager::SocketManager;

struct WakeupHooks {
    mgr: Weak<SocketManager>,
    do_wakeup: Action,
}

impl Consumer for WakeupHooks {
    fn on_producer_ready(&self) {}

    fn on_producer_wakeup(&self) {
        schedule_on(&self.mgr, &self.do_wakeup);
    }
}

/// Read end of a buffer, bound to a socket manager.
pub struct PullAdapter<T> {
    buf: Option<Arc<Buffer<T>>>,
    mgr: Option<Arc<SocketManager>>,
    do_wakeup: Option<Action>,
}

impl<T: Send + 'static> PullAdapter<T> {
    /// Open `resource` for `mgr`. `None` if the resource was already opened.
    pub fn try_open(
        mgr: &Arc<SocketManager>,
        resource: &ConsumerResource<T>,
        do_wakeup: Action,
    ) -> Option<Self> {
        let buf = resource.try_open()?;
        buf.set_consumer(Arc::new(WakeupHooks {
            mgr: Arc::downgrade(mgr),
            do_wakeup: do_wakeup.clone(),
        }));
        Some(Self {
            buf: Some(buf),
            mgr: Some(mgr.clone()),
            do_wakeup: Some(do_wakeup),
        })
    }

    /// Deliver up to `max` items. The adapter closes itself once the buffer
    /// reports its terminal state.
    pub fn pull<O: Observer<T>>(&mut self, max: usize, observer: &mut O) -> (bool, usize) {
        let Some(buf) = &self.buf else {
            return (false, 0);
        };
        let (again, consumed) = buf.pull(max, observer);
        if !again {
            self.reset();
        }
        (again, consumed)
    }

    /// Stop consuming; the producer is told to stop.
    pub fn cancel(&mut self) {
        if let Some(buf) = self.buf.take() {
            buf.cancel();
        }
        self.reset();
    }

    pub fn is_open(&self) -> bool {
        self.buf.is_some()
    }

    /// The manager this adapter keeps alive while open.
    pub fn owner(&self) -> Option<&Arc<SocketManager>> {
        self.mgr.as_ref()
    }

    pub fn has_data(&self) -> bool {
        self.buf.as_ref().is_some_and(|b| b.has_data())
    }

    /// True once the producer finished and every item was pulled.
    pub fn has_consumer_event(&self) -> bool {
        self.buf.as_ref().is_some_and(|b| b.has_consumer_event())
    }
}

impl<T> PullAdapter<T> {
    fn reset(&mut self) {
        self.buf = None;
        self.mgr = None;
        if let Some(action) = self.do_wakeup.take() {
            action.dispose();
        }
    }
}

impl<T> Drop for PullAdapter<T> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            buf.cancel();
        }
        self.reset();
    }
}
