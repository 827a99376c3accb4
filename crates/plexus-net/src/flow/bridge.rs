use std::sync::Arc;

use plexus_core::{make_buffer_resource, ConsumerResource, NetError, ProducerResource, Result, Settings};

use super::{ConsumerAdapter, SendAdapter};
use crate::layer::message;
use crate::manager::SocketManager;

/// Application-side ends of a [`Bridge`].
pub struct BridgeEnds<In, Out> {
    /// Decoded messages from the peer.
    pub inbound: ConsumerResource<In>,
    /// Items to encode and send to the peer. Closing it shuts the
    /// connection down once everything was written.
    pub outbound: ProducerResource<Out>,
}

/// Message layer that reads into one buffer and writes from another.
pub struct Bridge<In, Out> {
    reader: ConsumerAdapter<In>,
    writer: SendAdapter<Out>,
}

impl<In: Send + 'static, Out: Send + 'static> Bridge<In, Out> {
    /// Both buffers get the same `capacity` and `min_pull_size`.
    pub fn new<D, E>(
        decode: D,
        encode: E,
        capacity: usize,
        min_pull_size: usize,
    ) -> (Self, BridgeEnds<In, Out>)
    where
        D: FnMut(&[u8]) -> Option<In> + Send + 'static,
        E: FnMut(&Out, &mut Vec<u8>) + Send + 'static,
    {
        let (inbound, net_in) = make_buffer_resource(capacity, min_pull_size);
        let (net_out, outbound) = make_buffer_resource(capacity, min_pull_size);
        let bridge = Self {
            reader: ConsumerAdapter::new(net_in, decode),
            writer: SendAdapter::new(net_out, encode),
        };
        (bridge, BridgeEnds { inbound, outbound })
    }
}

impl<In: Send + 'static, Out: Send + 'static> message::UpperLayer for Bridge<In, Out> {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn message::LowerLayer,
        cfg: &Settings,
    ) -> Result<()> {
        self.reader.init(owner, down, cfg)?;
        self.writer.init(owner, down, cfg)
    }

    fn consume(&mut self, down: &mut dyn message::LowerLayer, payload: &[u8]) -> isize {
        self.reader.consume(down, payload)
    }

    fn prepare_send(&mut self, down: &mut dyn message::LowerLayer) -> bool {
        self.writer.prepare_send(down)
    }

    fn done_sending(&mut self, down: &mut dyn message::LowerLayer) -> bool {
        self.writer.done_sending(down)
    }

    fn continue_reading(&mut self, down: &mut dyn message::LowerLayer) {
        self.reader.continue_reading(down);
    }

    fn abort(&mut self, reason: &NetError) {
        self.reader.abort(reason);
        self.writer.abort(reason);
    }
}
