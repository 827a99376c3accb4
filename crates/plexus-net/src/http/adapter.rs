use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace};

use plexus_core::{Action, Disposable, NetError, ProducerResource, Result, Settings};

use super::{HttpError, LowerLayer, Request, Status, UpperLayer};
use crate::flow::{resume_reading_action, shutdown_action, ProducerAdapter};
use crate::manager::SocketManager;

struct Response {
    status: Status,
    content_type: String,
    body: Vec<u8>,
}

/// Where a responder leaves its answer for the reactor thread.
#[derive(Default)]
struct Slot {
    response: Mutex<Option<Response>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<Response>> {
        self.response.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_ready(&self) -> bool {
        self.lock().is_some()
    }
}

/// Completes one request, from any thread.
///
/// Dropping a responder without answering sends `500 Internal Server Error`.
/// Once the connection is gone, answering does nothing.
pub struct Responder {
    slot: Arc<Slot>,
    notify: Action,
    done: bool,
}

impl Responder {
    pub fn respond(mut self, status: Status, content_type: &str, body: impl Into<Vec<u8>>) {
        self.complete(Response {
            status,
            content_type: content_type.to_string(),
            body: body.into(),
        });
    }

    /// Answer with `err`'s status and message.
    pub fn fail(self, err: HttpError) {
        let HttpError { status, message } = err;
        self.respond(status, "text/plain", message);
    }

    fn complete(&mut self, response: Response) {
        self.done = true;
        if self.notify.disposed() {
            return;
        }
        *self.slot.lock() = Some(response);
        self.notify.run();
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.done {
            self.complete(Response {
                status: Status::INTERNAL_SERVER_ERROR,
                content_type: "text/plain".into(),
                body: b"request dropped".to_vec(),
            });
        }
    }
}

/// A request waiting for an answer.
pub struct HttpRequest {
    request: Request,
    responder: Responder,
}

impl HttpRequest {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_parts(self) -> (Request, Responder) {
        (self.request, self.responder)
    }

    pub fn respond(self, status: Status, content_type: &str, body: impl Into<Vec<u8>>) {
        self.responder.respond(status, content_type, body);
    }
}

/// HTTP application that hands requests to worker threads.
///
/// Each request is pushed into a buffer together with its [`Responder`].
/// Answers are written in request order; an answer that completes early
/// waits for the ones before it.
pub struct RequestAdapter {
    resource: Option<ProducerResource<HttpRequest>>,
    writer: Option<ProducerAdapter<HttpRequest>>,
    owner: Option<Weak<SocketManager>>,
    pending: VecDeque<(Arc<Slot>, Action)>,
}

impl RequestAdapter {
    pub fn new(resource: ProducerResource<HttpRequest>) -> Self {
        Self {
            resource: Some(resource),
            writer: None,
            owner: None,
            pending: VecDeque::new(),
        }
    }

    /// Requests still waiting for their answer to be written.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    fn notify_action(&self) -> Action {
        let owner = self.owner.clone().unwrap_or_default();
        Action::new(move || {
            if let Some(mgr) = owner.upgrade() {
                mgr.continue_writing();
            }
        })
    }
}

impl UpperLayer for RequestAdapter {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn LowerLayer,
        _cfg: &Settings,
    ) -> Result<()> {
        let resource = self
            .resource
            .take()
            .ok_or_else(|| NetError::Logic("request adapter initialized twice".into()))?;
        let writer = ProducerAdapter::try_open(
            owner,
            &resource,
            resume_reading_action(owner),
            shutdown_action(owner),
        )
        .ok_or_else(|| NetError::Runtime("unable to open request buffer".into()))?;
        self.writer = Some(writer);
        self.owner = Some(Arc::downgrade(owner));
        down.request_messages();
        Ok(())
    }

    fn consume(&mut self, down: &mut dyn LowerLayer, request: Request) -> std::result::Result<(), HttpError> {
        if self.writer.is_none() {
            return Err(HttpError::new(Status::SERVICE_UNAVAILABLE, "no request consumer"));
        }
        let slot = Arc::new(Slot::default());
        let notify = self.notify_action();
        self.pending.push_back((slot.clone(), notify.clone()));
        let item = HttpRequest {
            request,
            responder: Responder {
                slot,
                notify,
                done: false,
            },
        };
        let remaining = match self.writer.as_mut() {
            Some(writer) => writer.push(item),
            None => 0,
        };
        if remaining == 0 {
            trace!("request buffer full, suspending");
            down.suspend_reading();
        }
        Ok(())
    }

    fn prepare_send(&mut self, down: &mut dyn LowerLayer) -> bool {
        while down.can_send_more() {
            let Some((slot, _)) = self.pending.front() else {
                break;
            };
            let Some(response) = slot.lock().take() else {
                break;
            };
            if let Some((_, notify)) = self.pending.pop_front() {
                notify.dispose();
            }
            if !down.send_response(response.status, &response.content_type, &response.body) {
                return false;
            }
        }
        true
    }

    fn done_sending(&mut self, _down: &mut dyn LowerLayer) -> bool {
        self.pending.front().map_or(true, |(slot, _)| !slot.is_ready())
    }

    fn continue_reading(&mut self, down: &mut dyn LowerLayer) {
        if self.writer.as_ref().is_some_and(ProducerAdapter::is_open) && !down.is_reading() {
            down.request_messages();
        }
    }

    fn abort(&mut self, reason: &NetError) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), %reason, "dropping unanswered requests");
        }
        for (_, notify) in self.pending.drain(..) {
            notify.dispose();
        }
        if let Some(mut writer) = self.writer.take() {
            if reason.is_graceful() {
                writer.close();
            } else {
                writer.abort(reason.clone());
            }
        }
    }
}
