//! HTTP/1.1 server layer.
//!
//! [`HttpServer`] sits on a stream transport, parses requests and hands them
//! to an [`UpperLayer`]. Responses are written through the ordered primitives
//! of [`LowerLayer`]: `begin_header`, `add_header_field`, `end_header`,
//! `send_payload`. Application errors become error responses and the
//! connection stays open; malformed requests are answered and the connection
//! is closed after the answer is flushed.
//!
//! [`RequestAdapter`] forwards requests into a bounded buffer so that worker
//! threads can answer them asynchronously.

mod adapter;
mod parse;
mod server;

pub use adapter::{HttpRequest, RequestAdapter, Responder};
pub use server::{HttpServer, DEFAULT_MAX_REQUEST_SIZE, KEY_MAX_REQUEST_SIZE};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use plexus_core::{NetError, Result, Settings};

use crate::manager::SocketManager;

/// HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const NO_CONTENT: Status = Status(204);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const METHOD_NOT_ALLOWED: Status = Status(405);
    pub const PAYLOAD_TOO_LARGE: Status = Status(413);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);
    pub const SERVICE_UNAVAILABLE: Status = Status(503);

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

/// An error an application wants reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    pub status: Status,
    pub message: String,
}

impl HttpError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: String,
    path: String,
    query: Option<String>,
    version: String,
    fields: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-insensitive header lookup; first match wins.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// What the HTTP server offers the application.
pub trait LowerLayer {
    fn can_send_more(&self) -> bool;

    fn is_reading(&self) -> bool;

    /// Start (or resume) delivering requests.
    fn request_messages(&mut self);

    /// Stop delivering requests after the current one.
    fn suspend_reading(&mut self);

    /// Write the status line.
    fn begin_header(&mut self, status: Status);

    fn add_header_field(&mut self, key: &str, value: &str);

    /// Terminate the header block.
    fn end_header(&mut self) -> bool;

    fn send_payload(&mut self, bytes: &[u8]) -> bool;

    /// Flush pending output, then close the connection.
    fn shutdown(&mut self);

    /// Status line, `Content-Type`, `Content-Length` and body in one go.
    fn send_response(&mut self, status: Status, content_type: &str, body: &[u8]) -> bool {
        self.begin_header(status);
        self.add_header_field("Content-Type", content_type);
        self.add_header_field("Content-Length", &body.len().to_string());
        self.end_header() && self.send_payload(body)
    }
}

/// An application receiving requests.
pub trait UpperLayer: Send {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn LowerLayer,
        cfg: &Settings,
    ) -> Result<()>;

    /// Handle one request. An error is turned into an error response.
    fn consume(&mut self, down: &mut dyn LowerLayer, request: Request) -> std::result::Result<(), HttpError>;

    fn prepare_send(&mut self, _down: &mut dyn LowerLayer) -> bool {
        true
    }

    fn done_sending(&mut self, _down: &mut dyn LowerLayer) -> bool {
        true
    }

    fn continue_reading(&mut self, _down: &mut dyn LowerLayer) {}

    fn abort(&mut self, reason: &NetError);
}
