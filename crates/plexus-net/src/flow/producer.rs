use std::sync::{Arc, Weak};

use tracing::trace;

use plexus_core::buffer::Producer;
use plexus_core::{Action, Buffer, Disposable, NetError, ProducerResource};

use super::schedule_on;
use crate::manager::SocketManager;

struct DemandHooks {
    mgr: Weak<SocketManager>,
    do_resume: Action,
    do_cancel: Action,
}

impl Producer for DemandHooks {
    fn on_consumer_ready(&self) {}

    fn on_consumer_cancel(&self) {
        trace!("consumer cancelled");
        schedule_on(&self.mgr, &self.do_cancel);
    }

    fn on_consumer_demand(&self, demand: usize) {
        trace!(demand, "consumer demand");
        schedule_on(&self.mgr, &self.do_resume);
    }
}

/// Write end of a buffer, bound to a socket manager.
pub struct ProducerAdapter<T> {
    buf: Option<Arc<Buffer<T>>>,
    mgr: Option<Arc<SocketManager>>,
    do_resume: Option<Action>,
    do_cancel: Option<Action>,
}

impl<T: Send + 'static> ProducerAdapter<T> {
    /// Open `resource` for `mgr`. `None` if the resource was already opened.
    pub fn try_open(
        mgr: &Arc<SocketManager>,
        resource: &ProducerResource<T>,
        do_resume: Action,
        do_cancel: Action,
    ) -> Option<Self> {
        let buf = resource.try_open()?;
        buf.set_producer(Arc::new(DemandHooks {
            mgr: Arc::downgrade(mgr),
            do_resume: do_resume.clone(),
            do_cancel: do_cancel.clone(),
        }));
        Some(Self {
            buf: Some(buf),
            mgr: Some(mgr.clone()),
            do_resume: Some(do_resume),
            do_cancel: Some(do_cancel),
        })
    }

    /// Push one item and return the remaining capacity; 0 once closed.
    pub fn push(&mut self, item: T) -> usize {
        match &self.buf {
            Some(buf) => buf.push(item),
            None => 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.buf.is_some()
    }

    /// The manager this adapter keeps alive while open.
    pub fn owner(&self) -> Option<&Arc<SocketManager>> {
        self.mgr.as_ref()
    }

    /// Let the consumer drain what is buffered, then complete.
    pub fn close(&mut self) {
        if let Some(buf) = self.buf.take() {
            buf.close();
        }
        self.reset();
    }

    /// Let the consumer drain what is buffered, then fail with `reason`.
    pub fn abort(&mut self, reason: NetError) {
        if let Some(buf) = self.buf.take() {
            buf.abort(reason);
        }
        self.reset();
    }
}

impl<T> ProducerAdapter<T> {
    fn reset(&mut self) {
        self.buf = None;
        self.mgr = None;
        for action in [self.do_resume.take(), self.do_cancel.take()].into_iter().flatten() {
            action.dispose();
        }
    }
}

impl<T> Drop for ProducerAdapter<T> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            buf.close();
        }
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Reactor, ReactorConfig};
    use crate::socket;
    use plexus_core::buffer::Observer;
    use plexus_core::make_buffer_resource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullLayer;

    impl crate::layer::SocketEventLayer for NullLayer {
        fn init(&mut self, _owner: &Arc<SocketManager>, _cfg: &plexus_core::Settings) -> plexus_core::Result<()> {
            Ok(())
        }
        fn handle_read_event(&mut self) {}
        fn handle_write_event(&mut self) {}
        fn abort(&mut self, _reason: &NetError) {}
    }

    #[derive(Default)]
    struct Outcome {
        items: Vec<i32>,
        error: Option<NetError>,
        completed: bool,
    }

    impl Observer<i32> for Outcome {
        fn on_next(&mut self, item: i32) {
            self.items.push(item);
        }
        fn on_complete(&mut self) {
            self.completed = true;
        }
        fn on_error(&mut self, err: &NetError) {
            self.error = Some(err.clone());
        }
    }

    fn counting(hits: &Arc<AtomicUsize>) -> Action {
        let hits = hits.clone();
        Action::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_aborted_adapter_rejects_pushes_and_surfaces_error() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let (fd, _peer) = socket::socket_pair().unwrap();
        let mgr = SocketManager::new(&reactor, fd, Box::new(NullLayer));
        let (pull_side, push_side) = make_buffer_resource::<i32>(4, 1);
        let resumes = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut adapter =
            ProducerAdapter::try_open(&mgr, &push_side, counting(&resumes), counting(&cancels)).unwrap();
        assert!(ProducerAdapter::try_open(&mgr, &push_side, counting(&resumes), counting(&cancels)).is_none());

        assert_eq!(adapter.push(1), 3);
        adapter.abort(NetError::Protocol("bad frame".into()));
        assert!(!adapter.is_open());
        assert_eq!(adapter.push(2), 0);

        let buf = pull_side.try_open().unwrap();
        let mut out = Outcome::default();
        assert_eq!(buf.pull(10, &mut out), (false, 1));
        assert_eq!(out.items, vec![1]);
        assert!(!out.completed);
        assert_eq!(out.error, Some(NetError::Protocol("bad frame".into())));
    }

    #[test]
    fn test_demand_and_cancel_schedule_actions() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let (fd, _peer) = socket::socket_pair().unwrap();
        let mgr = SocketManager::new(&reactor, fd, Box::new(NullLayer));
        let (pull_side, push_side) = make_buffer_resource::<i32>(2, 1);
        let resumes = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut adapter =
            ProducerAdapter::try_open(&mgr, &push_side, counting(&resumes), counting(&cancels)).unwrap();
        let buf = pull_side.try_open().unwrap();

        adapter.push(1);
        assert_eq!(adapter.push(2), 0);
        buf.pull(1, &mut |_x: i32| {});
        // scheduled, not run inline
        assert_eq!(resumes.load(Ordering::SeqCst), 0);
        reactor.poll_once(false);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);

        buf.cancel();
        reactor.poll_once(false);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        adapter.close();
        buf.pull(1, &mut |_x: i32| {});
        reactor.poll_once(false);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_buffer_and_releases_manager() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let (fd, _peer) = socket::socket_pair().unwrap();
        let mgr = SocketManager::new(&reactor, fd, Box::new(NullLayer));
        let (pull_side, push_side) = make_buffer_resource::<i32>(2, 1);
        let adapter =
            ProducerAdapter::try_open(&mgr, &push_side, Action::new(|| {}), Action::new(|| {})).unwrap();
        assert_eq!(Arc::strong_count(&mgr), 2);
        drop(adapter);
        assert_eq!(Arc::strong_count(&mgr), 1);
        let buf = pull_side.try_open().unwrap();
        let mut out = Outcome::default();
        assert_eq!(buf.pull(1, &mut out), (false, 0));
        assert!(out.completed);
    }
}
