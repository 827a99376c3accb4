//! Helpers for driving a reactor from a test thread.

use std::time::{Duration, Instant};

use crate::reactor::Reactor;

/// Poll without blocking until `cond` holds or five seconds pass.
pub(crate) fn drive_until<F: FnMut() -> bool>(reactor: &Reactor, mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        reactor.poll_once(false);
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    cond()
}
