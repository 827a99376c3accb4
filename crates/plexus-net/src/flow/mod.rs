//! Flow adapters between protocol stacks and bounded buffers.
//!
//! Direction network → buffer:
//! - [`ProducerAdapter`] wraps the write end of a buffer for a manager. Demand
//!   from the consumer schedules the resume action; cancellation schedules
//!   the cancel action.
//! - [`ConsumerAdapter`] is a message layer that decodes every message into
//!   an item and pushes it through a `ProducerAdapter`, suspending reading
//!   whenever the buffer reports no remaining capacity.
//!
//! Direction buffer → network:
//! - [`PullAdapter`] wraps the read end of a buffer; new items schedule the
//!   wakeup action.
//! - [`SendAdapter`] is a message layer that pulls items while the transport
//!   can take more output and encodes each one as a message.
//!
//! [`Bridge`] combines both directions on one connection.
//!
//! Adapters hold a strong reference to their manager while open, so a
//! manager that suspended reading stays alive until its buffer asks for
//! more. Closing or aborting an adapter drops that reference and disposes
//! its actions.

mod bridge;
mod consumer;
mod producer;
mod pull;
mod sender;

pub use bridge::{Bridge, BridgeEnds};
pub use consumer::ConsumerAdapter;
pub use producer::ProducerAdapter;
pub use pull::PullAdapter;
pub use sender::SendAdapter;

use std::sync::{Arc, Weak};

use plexus_core::{Action, Disposable};

use crate::manager::SocketManager;

/// Action that resumes the read path of `owner`'s stack.
///
/// Must run on the reactor thread; adapters schedule it through the manager.
pub fn resume_reading_action(owner: &Arc<SocketManager>) -> Action {
    let weak = Arc::downgrade(owner);
    Action::new(move || {
        if let Some(mgr) = weak.upgrade() {
            mgr.handle_continue_reading();
        }
    })
}

/// Action that resumes the write path of `owner`'s stack.
pub fn resume_writing_action(owner: &Arc<SocketManager>) -> Action {
    let weak = Arc::downgrade(owner);
    Action::new(move || {
        if let Some(mgr) = weak.upgrade() {
            mgr.handle_continue_writing();
        }
    })
}

/// Action that shuts `owner` down.
pub fn shutdown_action(owner: &Arc<SocketManager>) -> Action {
    let weak = Arc::downgrade(owner);
    Action::new(move || {
        if let Some(mgr) = weak.upgrade() {
            mgr.shutdown();
        }
    })
}

/// Schedule `action` on `mgr` unless it was disposed.
fn schedule_on(mgr: &Weak<SocketManager>, action: &Action) {
    if action.disposed() {
        return;
    }
    if let Some(mgr) = mgr.upgrade() {
        let action = action.clone();
        mgr.schedule(move |_| {
            action.run();
        });
    }
}
