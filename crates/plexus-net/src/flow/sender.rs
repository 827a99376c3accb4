use std::sync::Arc;

use tracing::{debug, warn};

use plexus_core::buffer::Observer;
use plexus_core::{ConsumerResource, NetError, Result, Settings};

use super::{resume_writing_action, PullAdapter};
use crate::layer::message;
use crate::manager::SocketManager;

type Encoder<T> = Box<dyn FnMut(&T, &mut Vec<u8>) + Send>;

/// Items pulled per round while the transport can take more output.
const PULL_BATCH: usize = 32;

struct Collect<T> {
    items: Vec<T>,
    error: Option<NetError>,
}

impl<T> Observer<T> for Collect<T> {
    fn on_next(&mut self, item: T) {
        self.items.push(item);
    }

    fn on_error(&mut self, err: &NetError) {
        self.error = Some(err.clone());
    }
}

/// Message layer that writes buffered items to the connection.
///
/// When the producer closes the buffer, pending output is flushed and the
/// connection shut down. When the producer aborts, the connection aborts.
/// Incoming messages are ignored.
pub struct SendAdapter<T> {
    resource: Option<ConsumerResource<T>>,
    encode: Encoder<T>,
    reader: Option<PullAdapter<T>>,
}

impl<T: Send + 'static> SendAdapter<T> {
    pub fn new<E>(resource: ConsumerResource<T>, encode: E) -> Self
    where
        E: FnMut(&T, &mut Vec<u8>) + Send + 'static,
    {
        Self {
            resource: Some(resource),
            encode: Box::new(encode),
            reader: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.reader.as_ref().is_some_and(PullAdapter::is_open)
    }
}

impl<T: Send + 'static> message::UpperLayer for SendAdapter<T> {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn message::LowerLayer,
        _cfg: &Settings,
    ) -> Result<()> {
        let resource = self
            .resource
            .take()
            .ok_or_else(|| NetError::Logic("send adapter initialized twice".into()))?;
        let reader = PullAdapter::try_open(owner, &resource, resume_writing_action(owner))
            .ok_or_else(|| NetError::Runtime("unable to open buffer for reading".into()))?;
        self.reader = Some(reader);
        // keep reading so that a peer disconnect is noticed
        down.request_messages();
        Ok(())
    }

    fn consume(&mut self, _down: &mut dyn message::LowerLayer, payload: &[u8]) -> isize {
        payload.len() as isize
    }

    fn prepare_send(&mut self, down: &mut dyn message::LowerLayer) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return true;
        };
        while down.can_send_more() {
            let mut batch = Collect { items: Vec::new(), error: None };
            let (again, consumed) = reader.pull(PULL_BATCH, &mut batch);
            for item in &batch.items {
                down.begin_message();
                (self.encode)(item, down.message_buffer());
                if !down.end_message() {
                    return false;
                }
            }
            if !again {
                self.reader = None;
                return match batch.error {
                    Some(err) => {
                        warn!(%err, "producer aborted, closing connection");
                        false
                    }
                    None => {
                        debug!("producer done, shutting down after flush");
                        down.shutdown();
                        true
                    }
                };
            }
            if consumed == 0 {
                break;
            }
        }
        true
    }

    fn done_sending(&mut self, _down: &mut dyn message::LowerLayer) -> bool {
        self.reader
            .as_ref()
            .map_or(true, |r| !r.has_data() && !r.has_consumer_event())
    }

    fn abort(&mut self, _reason: &NetError) {
        if let Some(mut reader) = self.reader.take() {
            reader.cancel();
        }
    }
}
