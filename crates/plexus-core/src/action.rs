//! Disposable, re-runnable callbacks
//!
//! An [`Action`] wraps a closure behind a shared handle. Clones refer to the
//! same callback; disposing any clone releases the closure (and everything it
//! captured) and turns every later `run` into a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Something that can be cancelled exactly once.
pub trait Disposable {
    /// Release the underlying resource. Calling this twice is harmless.
    fn dispose(&self);

    /// True once `dispose` has been called.
    fn disposed(&self) -> bool;
}

type Callback = Box<dyn FnMut() + Send>;

struct ActionState {
    disposed: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

/// Shared handle to a deferred callback.
#[derive(Clone)]
pub struct Action {
    state: Arc<ActionState>,
}

impl Action {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            state: Arc::new(ActionState {
                disposed: AtomicBool::new(false),
                callback: Mutex::new(Some(Box::new(f))),
            }),
        }
    }

    /// Invoke the callback unless the action was disposed.
    ///
    /// The callback runs without holding the lock, so it may dispose its own
    /// action. A `run` that overlaps another one on a different thread finds
    /// no callback and does nothing.
    ///
    /// Returns whether the callback ran.
    pub fn run(&self) -> bool {
        if self.state.disposed.load(Ordering::Acquire) {
            return false;
        }
        let Some(mut f) = self.lock().take() else {
            return false;
        };
        f();
        if !self.state.disposed.load(Ordering::Acquire) {
            let mut slot = self.lock();
            // dispose may have raced between the check and the lock
            if !self.state.disposed.load(Ordering::Acquire) {
                *slot = Some(f);
            }
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Option<Callback>> {
        self.state
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True if both handles refer to the same callback.
    pub fn ptr_eq(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Disposable for Action {
    fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let taken = self.lock().take();
        // captured state may hold references back into the caller
        drop(taken);
    }

    fn disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("disposed", &self.disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_until_disposed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let action = Action::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(action.run());
        assert!(action.clone().run());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        action.dispose();
        action.dispose();
        assert!(action.disposed());
        assert!(!action.run());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispose_releases_captures() {
        let captured = Arc::new(());
        let c = captured.clone();
        let action = Action::new(move || {
            let _ = &c;
        });
        assert_eq!(Arc::strong_count(&captured), 2);
        let other = action.clone();
        other.dispose();
        assert_eq!(Arc::strong_count(&captured), 1);
        assert!(action.ptr_eq(&other));
    }

    #[test]
    fn test_callback_may_dispose_itself() {
        let hits = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(());
        let slot: Arc<Mutex<Option<Action>>> = Arc::new(Mutex::new(None));
        let (h, c, s) = (hits.clone(), captured.clone(), slot.clone());
        let action = Action::new(move || {
            let _ = &c;
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = s.lock().unwrap().take() {
                me.dispose();
            }
        });
        *slot.lock().unwrap() = Some(action.clone());

        assert!(action.run());
        assert!(action.disposed());
        assert!(!action.run());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // the closure was not put back after disposing itself
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[test]
    fn test_callback_survives_repeated_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let action = Action::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            assert!(action.run());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
