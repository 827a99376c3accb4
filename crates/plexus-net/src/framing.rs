//! Length-prefix framing.
//!
//! Wire format: `[u32 length, big endian][length bytes payload]`, repeated.
//! Sits on a stream transport and talks to a message-oriented application.
//! The payload size is bounded by `plexus.framing.max-message-length`
//! (default 16 MiB, never more than [`MAX_MESSAGE_LENGTH_LIMIT`]).

use std::sync::Arc;

use tracing::warn;

use plexus_core::{NetError, Result, Settings};

use crate::layer::{message, stream};
use crate::manager::SocketManager;

pub const HEADER_SIZE: usize = 4;

/// Largest payload the format can carry with an `i32`-safe frame size.
pub const MAX_MESSAGE_LENGTH_LIMIT: usize = i32::MAX as usize - HEADER_SIZE;

pub const KEY_MAX_MESSAGE_LENGTH: &str = "plexus.framing.max-message-length";
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Append one frame carrying `payload` to `out`.
pub fn encode(payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if payload.len() > MAX_MESSAGE_LENGTH_LIMIT {
        return Err(NetError::InvalidConfig(format!(
            "message of {} bytes exceeds the framing limit",
            payload.len()
        )));
    }
    out.reserve(HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Split a frame into its declared length and the bytes after the header.
///
/// Returns `None` if `frame` is shorter than a header.
pub fn split(frame: &[u8]) -> Option<(usize, &[u8])> {
    let header: [u8; HEADER_SIZE] = frame.get(..HEADER_SIZE)?.try_into().ok()?;
    Some((u32::from_be_bytes(header) as usize, &frame[HEADER_SIZE..]))
}

/// The framing layer's side of the message contract.
struct FramedOutput<'a> {
    down: &'a mut dyn stream::LowerLayer,
    max_len: usize,
    message_start: &'a mut Option<usize>,
}

impl message::LowerLayer for FramedOutput<'_> {
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

    fn begin_message(&mut self) {
        self.down.begin_output();
        let buf = self.down.output_buffer();
        *self.message_start = Some(buf.len());
        buf.extend_from_slice(&[0; HEADER_SIZE]);
    }

    fn message_buffer(&mut self) -> &mut Vec<u8> {
        self.down.output_buffer()
    }

    fn end_message(&mut self) -> bool {
        let Some(start) = self.message_start.take() else {
            warn!("end_message without begin_message");
            return false;
        };
        let buf = self.down.output_buffer();
        let len = buf.len() - start - HEADER_SIZE;
        if len > self.max_len {
            warn!(len, max = self.max_len, "dropping oversized outgoing message");
            buf.truncate(start);
            return false;
        }
        buf[start..start + HEADER_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
        self.down.end_output()
    }

    fn shutdown(&mut self) {
        self.down.shutdown();
    }
}

pub struct LengthPrefixFraming {
    up: Box<dyn message::UpperLayer>,
    max_len: usize,
    message_start: Option<usize>,
}

impl LengthPrefixFraming {
    pub fn new(up: Box<dyn message::UpperLayer>) -> Self {
        Self {
            up,
            max_len: DEFAULT_MAX_MESSAGE_LENGTH,
            message_start: None,
        }
    }

    pub fn make<U: message::UpperLayer + 'static>(up: U) -> Self {
        Self::new(Box::new(up))
    }

    fn view<'a>(
        down: &'a mut dyn stream::LowerLayer,
        max_len: usize,
        message_start: &'a mut Option<usize>,
    ) -> FramedOutput<'a> {
        FramedOutput { down, max_len, message_start }
    }
}

impl stream::UpperLayer for LengthPrefixFraming {
    fn init(
        &mut self,
        owner: &Arc<SocketManager>,
        down: &mut dyn stream::LowerLayer,
        cfg: &Settings,
    ) -> Result<()> {
        self.max_len = cfg
            .get_or(KEY_MAX_MESSAGE_LENGTH, DEFAULT_MAX_MESSAGE_LENGTH)
            .min(MAX_MESSAGE_LENGTH_LIMIT);
        let mut out = Self::view(down, self.max_len, &mut self.message_start);
        self.up.init(owner, &mut out, cfg)
    }

    fn consume(&mut self, down: &mut dyn stream::LowerLayer, bytes: &[u8]) -> isize {
        let mut consumed = 0;
        while down.is_reading() {
            let Some((len, rest)) = split(&bytes[consumed..]) else {
                break;
            };
            if len > self.max_len {
                warn!(len, max = self.max_len, "incoming message exceeds maximum length");
                return -1;
            }
            if rest.len() < len {
                break;
            }
            let mut out = Self::view(&mut *down, self.max_len, &mut self.message_start);
            if self.up.consume(&mut out, &rest[..len]) < 0 {
                return -1;
            }
            consumed += HEADER_SIZE + len;
        }
        consumed as isize
    }

    fn prepare_send(&mut self, down: &mut dyn stream::LowerLayer) -> bool {
        let mut out = Self::view(down, self.max_len, &mut self.message_start);
        self.up.prepare_send(&mut out)
    }

    fn done_sending(&mut self, down: &mut dyn stream::LowerLayer) -> bool {
        let mut out = Self::view(down, self.max_len, &mut self.message_start);
        self.up.done_sending(&mut out)
    }

    fn continue_reading(&mut self, down: &mut dyn stream::LowerLayer) {
        let mut out = Self::view(down, self.max_len, &mut self.message_start);
        self.up.continue_reading(&mut out);
    }

    fn abort(&mut self, reason: &NetError) {
        self.up.abort(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Reactor, ReactorConfig};
    use crate::socket::{self, IoOutcome};
    use crate::testing::drive_until;
    use crate::transport::{StreamTransport, KEY_READ_CHUNK_SIZE};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::Mutex;

    #[test]
    fn test_encode_split() {
        let mut out = Vec::new();
        encode(b"abc", &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 3, b'a', b'b', b'c']);
        let (len, rest) = split(&out).unwrap();
        assert_eq!(len, 3);
        assert_eq!(rest, b"abc");
        assert!(split(&out[..3]).is_none());
    }

    #[test]
    fn test_encode_sizes() {
        for size in [0usize, 1, 70_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut out = Vec::new();
            encode(&payload, &mut out).unwrap();
            assert_eq!(out.len(), HEADER_SIZE + size);
            let (len, rest) = split(&out).unwrap();
            assert_eq!(len, size);
            assert_eq!(rest, &payload[..]);
        }
    }

    #[derive(Default)]
    struct Log {
        messages: Vec<Vec<u8>>,
        aborts: Vec<NetError>,
    }

    /// Records messages; suspends on "pause", replies "ok" to "ping".
    struct Recorder {
        log: Arc<Mutex<Log>>,
    }

    impl message::UpperLayer for Recorder {
        fn init(
            &mut self,
            _owner: &Arc<SocketManager>,
            down: &mut dyn message::LowerLayer,
            _cfg: &Settings,
        ) -> Result<()> {
            down.request_messages();
            Ok(())
        }

        fn consume(&mut self, down: &mut dyn message::LowerLayer, payload: &[u8]) -> isize {
            self.log.lock().unwrap().messages.push(payload.to_vec());
            match payload {
                b"pause" => down.suspend_reading(),
                b"ping" => {
                    down.begin_message();
                    down.message_buffer().extend_from_slice(b"ok");
                    down.end_message();
                }
                _ => {}
            }
            payload.len() as isize
        }

        fn continue_reading(&mut self, down: &mut dyn message::LowerLayer) {
            down.request_messages();
        }

        fn abort(&mut self, reason: &NetError) {
            self.log.lock().unwrap().aborts.push(reason.clone());
        }
    }

    fn framed(cfg: Settings) -> (Reactor, Arc<SocketManager>, OwnedFd, Arc<Mutex<Log>>) {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let (a, b) = socket::socket_pair().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let stack = LengthPrefixFraming::make(Recorder { log: log.clone() });
        let mgr = SocketManager::new(&reactor, a, StreamTransport::make(stack));
        mgr.init(&cfg).unwrap();
        (reactor, mgr, b, log)
    }

    #[test]
    fn test_fragmented_frames_arrive_whole_and_in_order() {
        let (reactor, _mgr, peer, log) = framed(Settings::new().with(KEY_READ_CHUNK_SIZE, 5));
        let payloads: Vec<Vec<u8>> = vec![b"first".to_vec(), Vec::new(), vec![7u8; 300], b"last".to_vec()];
        let mut wire = Vec::new();
        for p in &payloads {
            encode(p, &mut wire).unwrap();
        }
        // one byte per read event
        for byte in &wire {
            assert_eq!(socket::write(peer.as_raw_fd(), std::slice::from_ref(byte)), IoOutcome::Done(1));
            reactor.poll_once(false);
        }
        assert!(drive_until(&reactor, || log.lock().unwrap().messages.len() == payloads.len()));
        assert_eq!(log.lock().unwrap().messages, payloads);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (reactor, mgr, peer, log) = framed(Settings::new());
        let mut wire = Vec::new();
        for p in [&b"a"[..], b"pause", b"b", b"c"] {
            encode(p, &mut wire).unwrap();
        }
        socket::write(peer.as_raw_fd(), &wire);
        assert!(drive_until(&reactor, || log.lock().unwrap().messages.len() == 2));
        for _ in 0..10 {
            reactor.poll_once(false);
        }
        assert_eq!(log.lock().unwrap().messages.len(), 2);
        assert!(!mgr.is_reading());

        mgr.continue_reading();
        assert!(drive_until(&reactor, || log.lock().unwrap().messages.len() == 4));
        let got = log.lock().unwrap().messages.clone();
        assert_eq!(got, vec![b"a".to_vec(), b"pause".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_reply_is_framed() {
        let (reactor, _mgr, peer, _log) = framed(Settings::new());
        let mut wire = Vec::new();
        encode(b"ping", &mut wire).unwrap();
        socket::write(peer.as_raw_fd(), &wire);
        socket::set_nonblocking(std::os::fd::AsFd::as_fd(&peer), true).unwrap();
        let mut got = Vec::new();
        assert!(drive_until(&reactor, || {
            let mut buf = [0u8; 16];
            if let IoOutcome::Done(n) = socket::read(peer.as_raw_fd(), &mut buf) {
                got.extend_from_slice(&buf[..n]);
            }
            got.len() >= 6
        }));
        assert_eq!(got, [0, 0, 0, 2, b'o', b'k']);
    }

    #[test]
    fn test_oversized_header_aborts() {
        let (reactor, mgr, peer, log) = framed(Settings::new().with(KEY_MAX_MESSAGE_LENGTH, 8));
        let mut wire = Vec::new();
        encode(&[1u8; 9], &mut wire).unwrap();
        socket::write(peer.as_raw_fd(), &wire);
        assert!(drive_until(&reactor, || mgr.disposed()));
        reactor.poll_once(false);
        let log = log.lock().unwrap();
        assert!(log.messages.is_empty());
        assert_eq!(log.aborts.len(), 1);
        assert!(matches!(log.aborts[0], NetError::Protocol(_)));
    }
}
