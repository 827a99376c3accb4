//! Message layer contract.

use std::sync::Arc;

use plexus_core::{NetError, Result, Settings};

use crate::manager::SocketManager;

/// What a framing layer offers the application above it.
pub trait LowerLayer {
    fn can_send_more(&self) -> bool;

    fn is_reading(&self) -> bool;

    /// Start (or resume) delivering messages.
    fn request_messages(&mut self);

    /// Stop delivering messages after the current one.
    fn suspend_reading(&mut self);

    /// Open a new outgoing message.
    fn begin_message(&mut self);

    /// Payload buffer of the open message; append only.
    fn message_buffer(&mut self) -> &mut Vec<u8>;

    /// Seal the open message. False if it could not be framed.
    fn end_message(&mut self) -> bool;

    /// Flush pending output, then close the connection.
    fn shutdown(&mut self);
}

/// An application (or adapter) receiving whole messages.
pub trait UpperLayer: Send {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn LowerLayer,
        cfg: &Settings,
    ) -> Result<()>;

    /// Process one message. Any non-negative value accepts it; a negative
    /// value aborts the connection.
    fn consume(&mut self, down: &mut dyn LowerLayer, payload: &[u8]) -> isize;

    fn prepare_send(&mut self, _down: &mut dyn LowerLayer) -> bool {
        true
    }

    fn done_sending(&mut self, _down: &mut dyn LowerLayer) -> bool {
        true
    }

    fn continue_reading(&mut self, _down: &mut dyn LowerLayer) {}

    fn abort(&mut self, reason: &NetError);
}
