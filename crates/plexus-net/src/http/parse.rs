//! Request-line, header and `Content-Length` body parsing.

use super::{HttpError, Request, Status};

pub(super) enum Parsed {
    /// Need more bytes.
    Incomplete,
    /// A full request and the number of bytes it occupied.
    Complete(Request, usize),
    Invalid(HttpError),
}

const HEADER_END: &[u8] = b"\r\n\r\n";

fn bad_request(message: &str) -> Parsed {
    Parsed::Invalid(HttpError::new(Status::BAD_REQUEST, message))
}

fn too_large() -> Parsed {
    Parsed::Invalid(HttpError::new(Status::PAYLOAD_TOO_LARGE, "request exceeds maximum size"))
}

pub(super) fn parse_request(bytes: &[u8], max_size: usize) -> Parsed {
    let Some(head_end) = bytes.windows(HEADER_END.len()).position(|w| w == HEADER_END) else {
        return if bytes.len() > max_size { too_large() } else { Parsed::Incomplete };
    };
    let Ok(head) = std::str::from_utf8(&bytes[..head_end]) else {
        return bad_request("request header is not valid UTF-8");
    };

    let mut lines = head.split("\r\n");
    let mut parts = lines.next().unwrap_or_default().split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return bad_request("malformed request line");
    };
    if method.is_empty() || !target.starts_with('/') || !version.starts_with("HTTP/1.") {
        return bad_request("malformed request line");
    }

    let mut fields = Vec::new();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            return bad_request("malformed header field");
        };
        let key = key.trim();
        if key.is_empty() || key.contains(' ') {
            return bad_request("malformed header field");
        }
        fields.push((key.to_string(), value.trim().to_string()));
    }

    let lookup = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    if lookup("Transfer-Encoding").is_some() {
        return Parsed::Invalid(HttpError::new(
            Status::NOT_IMPLEMENTED,
            "transfer encodings are not supported",
        ));
    }
    let content_length = match lookup("Content-Length") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) => n,
            Err(_) => return bad_request("invalid Content-Length"),
        },
        None => 0,
    };

    let body_start = head_end + HEADER_END.len();
    let total = body_start.saturating_add(content_length);
    if total > max_size {
        return too_large();
    }
    if bytes.len() < total {
        return Parsed::Incomplete;
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };
    let request = Request {
        method: method.to_string(),
        path,
        query,
        version: version.to_string(),
        fields,
        body: bytes[body_start..total].to_vec(),
    };
    Parsed::Complete(request, total)
}
