//! Layer contracts.
//!
//! A protocol stack is a chain of layers owned top-down by a
//! [`SocketManager`]. The head of the chain implements [`SocketEventLayer`]
//! and receives raw readiness; everything above talks through one of the
//! upper/lower trait pairs:
//!
//! - [`stream`]: byte streams (transport ↔ framing or HTTP)
//! - [`message`]: discrete messages (framing ↔ application)
//! - [`crate::http`]: requests and responses (HTTP server ↔ application)
//!
//! Upper layers never store their lower layer. Every callback receives it as
//! a `&mut dyn LowerLayer` argument, so ownership stays a single linear path
//! from the manager to the application.
//!
//! # Read path
//!
//! `consume` returns how many bytes (or whether the message) it used. A short
//! count means "call again with more data"; a negative value is a fatal
//! parse error that aborts the whole stack.

pub mod message;
pub mod stream;

use std::sync::Arc;

use plexus_core::{NetError, Result, Settings};

use crate::manager::SocketManager;

/// Head of a protocol stack; receives readiness from the manager.
pub trait SocketEventLayer: Send {
    /// Wire up the stack. Typically ends with a call to
    /// `owner.register_reading()` somewhere below.
    fn init(&mut self, owner: &Arc<SocketManager>, cfg: &Settings) -> Result<()>;

    fn handle_read_event(&mut self);

    fn handle_write_event(&mut self);

    /// An application asked to resume a suspended read path.
    fn handle_continue_reading(&mut self) {}

    /// An application produced output outside of a read callback.
    fn handle_continue_writing(&mut self) {}

    /// The stack is going away. Release every resource.
    fn abort(&mut self, reason: &NetError);

    /// Produce a replacement handler for the same socket.
    fn do_handover(&mut self) -> Option<Box<dyn SocketEventLayer>> {
        None
    }
}
