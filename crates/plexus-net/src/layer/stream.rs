//! Byte-stream layer contract.

use std::sync::Arc;

use plexus_core::{NetError, Result, Settings};

use crate::manager::SocketManager;

/// What a stream transport offers the layer above it.
pub trait LowerLayer {
    /// False once the output buffer reached its limit.
    fn can_send_more(&self) -> bool;

    /// Whether the upper layer is currently receiving bytes.
    fn is_reading(&self) -> bool;

    /// Start (or resume) delivering received bytes.
    fn request_bytes(&mut self);

    /// Stop delivering bytes; anything already received stays buffered.
    fn suspend_reading(&mut self);

    /// Mark the start of a write.
    fn begin_output(&mut self);

    /// Output buffer to append to between `begin_output` and `end_output`.
    fn output_buffer(&mut self) -> &mut Vec<u8>;

    /// Hand the appended bytes to the socket. Returns false on failure.
    fn end_output(&mut self) -> bool;

    /// Flush pending output, then close the connection.
    fn shutdown(&mut self);
}

/// A layer sitting on top of a byte stream.
pub trait UpperLayer: Send {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn LowerLayer,
        cfg: &Settings,
    ) -> Result<()>;

    /// Process received bytes; returns the number of bytes used, 0 to wait
    /// for more, or a negative value on a fatal error.
    fn consume(&mut self, down: &mut dyn LowerLayer, bytes: &[u8]) -> isize;

    /// Called before writing; a chance to append more output. False aborts.
    fn prepare_send(&mut self, down: &mut dyn LowerLayer) -> bool;

    /// True when the layer has nothing left to write.
    fn done_sending(&mut self, down: &mut dyn LowerLayer) -> bool;

    /// An application asked to resume reading.
    fn continue_reading(&mut self, _down: &mut dyn LowerLayer) {}

    fn abort(&mut self, reason: &NetError);
}
