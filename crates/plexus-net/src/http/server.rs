use std::io::Write as _;
use std::sync::Arc;

use tracing::debug;

use plexus_core::{NetError, Result, Settings};

use super::parse::{parse_request, Parsed};
use super::{HttpError, LowerLayer, Status, UpperLayer};
use crate::layer::stream;
use crate::manager::SocketManager;

pub const KEY_MAX_REQUEST_SIZE: &str = "plexus.http.max-request-size";
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 64 * 1024;

/// The server's side of the HTTP contract, writing into the stream below.
struct ResponseWriter<'a> {
    down: &'a mut dyn stream::LowerLayer,
}

impl ResponseWriter<'_> {
    fn send_error(&mut self, err: &HttpError) -> bool {
        self.send_response(err.status, "text/plain", err.message.as_bytes())
    }
}

impl LowerLayer for ResponseWriter<'_> {
    fn can_send_more(&self) -> bool {
        self.down.can_send_more()
    }

    fn is_reading(&self) -> bool {
        self.down.is_reading()
    }

    fn request_messages(&mut self) {
        self.down.request_bytes();
    }

    fn suspend_reading(&mut self) {
        self.down.suspend_reading();
    }

    fn begin_header(&mut self, status: Status) {
        self.down.begin_output();
        let buf = self.down.output_buffer();
        let _ = write!(buf, "HTTP/1.1 {} {}\r\n", status.code(), status.reason());
    }

    fn add_header_field(&mut self, key: &str, value: &str) {
        let buf = self.down.output_buffer();
        let _ = write!(buf, "{key}: {value}\r\n");
    }

    fn end_header(&mut self) -> bool {
        self.down.output_buffer().extend_from_slice(b"\r\n");
        self.down.end_output()
    }

    fn send_payload(&mut self, bytes: &[u8]) -> bool {
        self.down.output_buffer().extend_from_slice(bytes);
        self.down.end_output()
    }

    fn shutdown(&mut self) {
        self.down.shutdown();
    }
}

/// Stream layer that turns bytes into requests.
pub struct HttpServer {
    up: Box<dyn UpperLayer>,
    max_request_size: usize,
}

impl HttpServer {
    pub fn new(up: Box<dyn UpperLayer>) -> Self {
        Self {
            up,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }

    pub fn make<U: UpperLayer + 'static>(up: U) -> Self {
        Self::new(Box::new(up))
    }
}

impl stream::UpperLayer for HttpServer {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn stream::LowerLayer,
        cfg: &Settings,
    ) -> Result<()> {
        self.max_request_size = cfg.get_or(KEY_MAX_REQUEST_SIZE, DEFAULT_MAX_REQUEST_SIZE);
        self.up.init(owner, &mut ResponseWriter { down }, cfg)
    }

    fn consume(&mut self, down: &mut dyn stream::LowerLayer, bytes: &[u8]) -> isize {
        match parse_request(bytes, self.max_request_size) {
            Parsed::Incomplete => 0,
            Parsed::Invalid(err) => {
                debug!(%err, "rejecting malformed request");
                let mut out = ResponseWriter { down };
                out.send_error(&err);
                out.shutdown();
                bytes.len() as isize
            }
            Parsed::Complete(request, used) => {
                let mut out = ResponseWriter { down };
                if let Err(err) = self.up.consume(&mut out, request) {
                    debug!(%err, "request failed");
                    out.send_error(&err);
                }
                used as isize
            }
        }
    }

    fn prepare_send(&mut self, down: &mut dyn stream::LowerLayer) -> bool {
        self.up.prepare_send(&mut ResponseWriter { down })
    }

    fn done_sending(&mut self, down: &mut dyn stream::LowerLayer) -> bool {
        self.up.done_sending(&mut ResponseWriter { down })
    }

    fn continue_reading(&mut self, down: &mut dyn stream::LowerLayer) {
        self.up.continue_reading(&mut ResponseWriter { down });
    }

    fn abort(&mut self, reason: &NetError) {
        self.up.abort(reason);
    }
}
