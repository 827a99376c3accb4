use std::sync::Arc;

use tracing::debug;

use plexus_core::{NetError, ProducerResource, Result, Settings};

use super::{resume_reading_action, shutdown_action, ProducerAdapter};
use crate::layer::message;
use crate::manager::SocketManager;

type Decoder<T> = Box<dyn FnMut(&[u8]) -> Option<T> + Send>;

/// Message layer that decodes messages into a buffer.
///
/// Reading is suspended as soon as a push reports no remaining capacity and
/// resumed when the consumer signals demand. If the consumer cancels, the
/// connection is shut down. A message that fails to decode aborts the
/// connection.
pub struct ConsumerAdapter<T> {
    resource: Option<ProducerResource<T>>,
    decode: Decoder<T>,
    writer: Option<ProducerAdapter<T>>,
}

impl<T: Send + 'static> ConsumerAdapter<T> {
    pub fn new<D>(resource: ProducerResource<T>, decode: D) -> Self
    where
        D: FnMut(&[u8]) -> Option<T> + Send + 'static,
    {
        Self {
            resource: Some(resource),
            decode: Box::new(decode),
            writer: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.as_ref().is_some_and(ProducerAdapter::is_open)
    }
}

impl<T: Send + 'static> message::UpperLayer for ConsumerAdapter<T> {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn message::LowerLayer,
        _cfg: &Settings,
    ) -> Result<()> {
        let resource = self
            .resource
            .take()
            .ok_or_else(|| NetError::Logic("consumer adapter initialized twice".into()))?;
        let writer = ProducerAdapter::try_open(
            owner,
            &resource,
            resume_reading_action(owner),
            shutdown_action(owner),
        )
        .ok_or_else(|| NetError::Runtime("unable to open buffer for writing".into()))?;
        self.writer = Some(writer);
        down.request_messages();
        Ok(())
    }

    fn consume(&mut self, down: &mut dyn message::LowerLayer, payload: &[u8]) -> isize {
        let Some(writer) = self.writer.as_mut() else {
            return -1;
        };
        let Some(item) = (self.decode)(payload) else {
            debug!(len = payload.len(), "failed to decode message");
            return -1;
        };
        if writer.push(item) == 0 {
            down.suspend_reading();
        }
        payload.len() as isize
    }

    fn continue_reading(&mut self, down: &mut dyn message::LowerLayer) {
        if self.is_open() && !down.is_reading() {
            down.request_messages();
        }
    }

    fn abort(&mut self, reason: &NetError) {
        if let Some(mut writer) = self.writer.take() {
            if reason.is_graceful() {
                writer.close();
            } else {
                writer.abort(reason.clone());
            }
        }
    }
}
