//! # StreamTransport - raw bytes between a socket and a stream layer
//!
//! The transport is the usual head of a stack. It reads from the socket into
//! a buffer and offers that buffer to the upper layer until the layer stops
//! consuming, suspends reading, or the buffer is empty. Output is appended by
//! the upper layer into a write buffer and flushed on write readiness.
//!
//! Recognized settings:
//!
//! | key | default |
//! |-----|---------|
//! | `plexus.transport.max-consecutive-reads` | 50 |
//! | `plexus.transport.read-chunk-size` | 8192 |
//! | `plexus.transport.max-read-buffer` | 64 MiB |
//! | `plexus.transport.max-write-buffer` | `SO_SNDBUF` of the socket |

use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use plexus_core::{NetError, Result, Settings};

use crate::layer::stream;
use crate::layer::SocketEventLayer;
use crate::manager::SocketManager;
use crate::socket::{self, IoOutcome};

pub const KEY_MAX_CONSECUTIVE_READS: &str = "plexus.transport.max-consecutive-reads";
pub const KEY_READ_CHUNK_SIZE: &str = "plexus.transport.read-chunk-size";
pub const KEY_MAX_READ_BUFFER: &str = "plexus.transport.max-read-buffer";
pub const KEY_MAX_WRITE_BUFFER: &str = "plexus.transport.max-write-buffer";

pub const DEFAULT_MAX_CONSECUTIVE_READS: usize = 50;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_MAX_READ_BUFFER: usize = 64 * 1024 * 1024;
/// Used when the kernel does not report a send buffer size.
pub const DEFAULT_MAX_WRITE_BUFFER: usize = 64 * 1024;

/// Produce/flush rounds per write event before yielding to other sockets.
const MAX_WRITE_ROUNDS: usize = 16;

/// The transport's side of the stream contract.
struct Channel {
    owner: Weak<SocketManager>,
    write_buf: Vec<u8>,
    max_write_buf: usize,
    reading: bool,
    shutdown_requested: bool,
}

impl Channel {
    fn owner(&self) -> Option<Arc<SocketManager>> {
        self.owner.upgrade()
    }
}

impl stream::LowerLayer for Channel {
    fn can_send_more(&self) -> bool {
        self.write_buf.len() < self.max_write_buf
    }

    fn is_reading(&self) -> bool {
        self.reading
    }

    fn request_bytes(&mut self) {
        if self.reading || self.shutdown_requested {
            return;
        }
        self.reading = true;
        if let Some(owner) = self.owner() {
            owner.register_reading();
        }
    }

    fn suspend_reading(&mut self) {
        if !self.reading {
            return;
        }
        self.reading = false;
        if let Some(owner) = self.owner() {
            owner.deregister_reading();
        }
    }

    fn begin_output(&mut self) {}

    fn output_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    fn end_output(&mut self) -> bool {
        match self.owner() {
            Some(owner) => {
                owner.register_writing();
                true
            }
            None => false,
        }
    }

    fn shutdown(&mut self) {
        self.suspend_reading();
        self.shutdown_requested = true;
        if let Some(owner) = self.owner() {
            owner.register_writing();
        }
    }
}

enum Flush {
    Done,
    Blocked,
    Failed(NetError),
}

pub struct StreamTransport {
    up: Box<dyn stream::UpperLayer>,
    channel: Channel,
    read_buf: Vec<u8>,
    fd: RawFd,
    max_consecutive_reads: usize,
    read_chunk_size: usize,
    max_read_buf: usize,
    aborted: bool,
}

impl StreamTransport {
    pub fn new(up: Box<dyn stream::UpperLayer>) -> Self {
        Self {
            up,
            channel: Channel {
                owner: Weak::new(),
                write_buf: Vec::new(),
                max_write_buf: DEFAULT_MAX_WRITE_BUFFER,
                reading: false,
                shutdown_requested: false,
            },
            read_buf: Vec::new(),
            fd: -1,
            max_consecutive_reads: DEFAULT_MAX_CONSECUTIVE_READS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_read_buf: DEFAULT_MAX_READ_BUFFER,
            aborted: false,
        }
    }

    /// Boxed transport on top of `up`, ready for `SocketManager::new`.
    pub fn make<U: stream::UpperLayer + 'static>(up: U) -> Box<dyn SocketEventLayer> {
        Box::new(Self::new(Box::new(up)))
    }

    /// Offer buffered bytes to the upper layer. False if the stack aborted.
    fn handle_buffered_data(&mut self) -> bool {
        let mut buf = std::mem::take(&mut self.read_buf);
        let mut offset = 0;
        let mut rejected = false;
        while self.channel.reading && offset < buf.len() {
            let n = self.up.consume(&mut self.channel, &buf[offset..]);
            if n < 0 {
                rejected = true;
                break;
            }
            if n == 0 {
                break;
            }
            offset += (n as usize).min(buf.len() - offset);
        }
        buf.drain(..offset);
        self.read_buf = buf;
        if rejected {
            self.fail(NetError::Protocol("upper layer rejected input".into()));
            return false;
        }
        true
    }

    fn flush(&mut self) -> Flush {
        let buf = &mut self.channel.write_buf;
        while !buf.is_empty() {
            match socket::write(self.fd, buf) {
                IoOutcome::Done(n) => {
                    buf.drain(..n);
                }
                IoOutcome::WouldBlock => return Flush::Blocked,
                IoOutcome::Closed => return Flush::Failed(NetError::SocketDisconnected),
                IoOutcome::Failed(code) => {
                    return Flush::Failed(NetError::SocketOperationFailed { op: "write", code })
                }
            }
        }
        Flush::Done
    }

    /// Abort the upper layers and shut the manager down.
    fn fail(&mut self, err: NetError) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        debug!(fd = self.fd, %err, "transport aborted");
        self.up.abort(&err);
        if let Some(owner) = self.channel.owner() {
            owner.shutdown();
        }
    }

    fn finish_shutdown(&mut self, owner: &Arc<SocketManager>) {
        trace!(fd = self.fd, "output flushed, closing");
        socket::shutdown_write(self.fd);
        self.aborted = true;
        self.up.abort(&NetError::Disposed);
        owner.shutdown();
    }
}

impl SocketEventLayer for StreamTransport {
    fn init(&mut self, owner: &Arc<SocketManager>, cfg: &Settings) -> Result<()> {
        self.fd = owner.raw_fd();
        self.channel.owner = Arc::downgrade(owner);
        self.max_consecutive_reads = cfg
            .get_or(KEY_MAX_CONSECUTIVE_READS, DEFAULT_MAX_CONSECUTIVE_READS)
            .max(1);
        self.read_chunk_size = cfg.get_or(KEY_READ_CHUNK_SIZE, DEFAULT_READ_CHUNK_SIZE).max(1);
        self.max_read_buf = cfg.get_or(KEY_MAX_READ_BUFFER, DEFAULT_MAX_READ_BUFFER);
        let kernel = socket::send_buffer_size(owner.handle()).unwrap_or(DEFAULT_MAX_WRITE_BUFFER);
        self.channel.max_write_buf = cfg.get_or(KEY_MAX_WRITE_BUFFER, kernel).max(1);
        self.up.init(owner, &mut self.channel, cfg)
    }

    fn handle_read_event(&mut self) {
        if self.aborted {
            return;
        }
        let Some(owner) = self.channel.owner() else {
            return;
        };
        if !self.channel.reading {
            owner.deregister_reading();
            return;
        }
        for _ in 0..self.max_consecutive_reads {
            let start = self.read_buf.len();
            self.read_buf.resize(start + self.read_chunk_size, 0);
            let outcome = socket::read(self.fd, &mut self.read_buf[start..]);
            let got = match outcome {
                IoOutcome::Done(n) => n,
                _ => 0,
            };
            self.read_buf.truncate(start + got);
            match outcome {
                IoOutcome::Done(_) => {}
                IoOutcome::WouldBlock => break,
                IoOutcome::Closed => {
                    self.fail(NetError::SocketDisconnected);
                    return;
                }
                IoOutcome::Failed(code) => {
                    self.fail(NetError::SocketOperationFailed { op: "read", code });
                    return;
                }
            }
            if self.read_buf.len() > self.max_read_buf {
                self.fail(NetError::Protocol(format!(
                    "read buffer exceeds {} bytes",
                    self.max_read_buf
                )));
                return;
            }
            if !self.handle_buffered_data() || !self.channel.reading {
                return;
            }
        }
    }

    fn handle_write_event(&mut self) {
        if self.aborted {
            return;
        }
        let Some(owner) = self.channel.owner() else {
            return;
        };
        for _ in 0..MAX_WRITE_ROUNDS {
            if !self.up.prepare_send(&mut self.channel) {
                self.fail(NetError::Runtime("upper layer failed to prepare output".into()));
                return;
            }
            if self.channel.write_buf.is_empty() {
                break;
            }
            match self.flush() {
                Flush::Done => {}
                Flush::Blocked => return,
                Flush::Failed(err) => {
                    self.fail(err);
                    return;
                }
            }
        }
        if self.channel.write_buf.is_empty() && self.up.done_sending(&mut self.channel) {
            if self.channel.shutdown_requested {
                self.finish_shutdown(&owner);
            } else {
                owner.deregister_writing();
            }
        }
    }

    fn handle_continue_reading(&mut self) {
        if self.aborted {
            return;
        }
        self.up.continue_reading(&mut self.channel);
        if self.channel.reading && !self.read_buf.is_empty() {
            self.handle_buffered_data();
        }
    }

    fn handle_continue_writing(&mut self) {
        if self.aborted {
            return;
        }
        if let Some(owner) = self.channel.owner() {
            owner.register_writing();
        }
    }

    fn abort(&mut self, reason: &NetError) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.up.abort(reason);
    }
}
