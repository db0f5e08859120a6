//! Request line + header parsing.
//!
//! The parser works directly on the connection's read buffer and borrows
//! from it rather than copying, so a `Request<'a>` is only valid for as long
//! as the bytes it was parsed from are not overwritten. The per-connection
//! state machine enforces that by handling each parsed request fully
//! (parse → handle → send) before the buffer is touched again.

use crate::errors::NxError;
use crate::http::types::{HeaderMap, Method, Version};
use memchr::memchr;

/// Hard wire limits on request-line and header size.
pub(crate) const MAX_HEADERS: usize = 32;
pub(crate) const MAX_HEADER_FIELD: usize = 1023;
pub(crate) const MAX_TARGET: usize = 2047;
pub(crate) const MAX_METHOD: usize = 15;
pub(crate) const MAX_VERSION: usize = 15;

/// A parsed HTTP request borrowing from the connection's receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    method: Method,
    target: &'a [u8],
    version: Version,
    headers: HeaderMap<'a>,
}

impl<'a> Request<'a> {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The raw request-target, e.g. `/index.html`.
    pub fn target(&self) -> &'a [u8] {
        self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn header(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.headers.get(name)
    }

    /// Keep-alive, derived from version with a `Connection:` header override:
    /// persistent by default on HTTP/1.1, non-persistent by default on
    /// HTTP/1.0, `close`/`keep-alive` always wins when present.
    pub fn keep_alive(&self) -> bool {
        match self.header(b"Connection") {
            Some(v) if v.eq_ignore_ascii_case(b"close") => false,
            Some(v) if v.eq_ignore_ascii_case(b"keep-alive") => true,
            _ => self.version.default_keep_alive(),
        }
    }
}

/// Attempts to parse one complete request from the head of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a complete request (no
/// blank-line terminator found) — the caller should keep reading. Returns
/// `Ok(Some((request, consumed)))` on success, where `consumed` is the
/// number of bytes (including the trailing blank line) the request occupied.
pub fn parse(buf: &[u8]) -> Result<Option<(Request<'_>, usize)>, NxError> {
    // A request ends at the first empty CRLF-terminated line; without one
    // there is nothing to parse yet (a full receive buffer with no
    // terminator is the caller's cue to answer 400 and close).
    let Some(header_end) = find_headers_end(buf) else {
        return Ok(None);
    };

    let mut cursor = 0usize;

    let line_end = memchr(b'\r', &buf[..header_end])
        .filter(|&i| buf.get(i + 1) == Some(&b'\n'))
        .ok_or(NxError::MalformedRequest)?;
    let request_line = &buf[..line_end];
    cursor = line_end + 2;

    let (method, method_len) = Method::from_bytes(request_line)?;
    if method_len > MAX_METHOD + 1 {
        return Err(NxError::MalformedRequest);
    }
    let rest = &request_line[method_len..];

    let target_end = memchr(b' ', rest).ok_or(NxError::MalformedRequest)?;
    if target_end == 0 || target_end > MAX_TARGET {
        return Err(NxError::MalformedRequest);
    }
    let target = &rest[..target_end];

    let version_bytes = &rest[target_end + 1..];
    if version_bytes.len() > MAX_VERSION {
        return Err(NxError::MalformedRequest);
    }
    let version = Version::from_bytes(version_bytes)?;

    let mut headers = HeaderMap::new();
    while cursor < header_end {
        let line_rel_end = memchr(b'\r', &buf[cursor..header_end])
            .filter(|&i| buf.get(cursor + i + 1) == Some(&b'\n'))
            .ok_or(NxError::MalformedRequest)?;
        let line = &buf[cursor..cursor + line_rel_end];
        cursor += line_rel_end + 2;

        if line.is_empty() {
            break;
        }

        let colon = memchr(b':', line).ok_or(NxError::MalformedRequest)?;
        let name = &line[..colon];
        if name.is_empty() || name.len() > MAX_HEADER_FIELD {
            return Err(NxError::MalformedRequest);
        }

        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }
        if value.len() > MAX_HEADER_FIELD {
            return Err(NxError::MalformedRequest);
        }

        headers.push(name, value)?;
    }

    // `header_end` points at the CRLF of the blank terminator line; the
    // terminator itself (`\r\n`) is two more bytes of input consumed.
    let consumed = header_end + 2;

    Ok(Some((
        Request { method, target, version, headers },
        consumed,
    )))
}

/// Locates the `\r\n` that starts the blank line terminating the header
/// block, scanning for two consecutive CRLFs. Returns the offset of that
/// `\r\n` (not including it), i.e. the length of the request line + headers.
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    let mut search_from = 0;
    loop {
        let rel = memchr(b'\n', &buf[search_from..])?;
        let pos = search_from + rel;
        if pos >= 3 && buf[pos - 3] == b'\r' && buf[pos - 2] == b'\n' && buf[pos - 1] == b'\r' {
            return Some(pos - 1);
        }
        search_from = pos + 1;
        if search_from >= buf.len() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let buf = b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, consumed) = parse(buf).unwrap().unwrap();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.target(), b"/index.html");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header(b"host"), Some(&b"x"[..]));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn incomplete_request_returns_none() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(parse(buf).unwrap().is_none());
    }

    #[test]
    fn missing_terminator_is_not_an_error_until_complete() {
        let buf = b"GET / HTTP/1.1\r\n";
        assert!(parse(buf).unwrap().is_none());
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let buf = b"NOTANHTTPLINE\r\n\r\n";
        assert!(parse(buf).is_err());
    }

    #[test]
    fn keep_alive_defaults_and_overrides() {
        let buf = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        let (req, _) = parse(buf).unwrap().unwrap();
        assert!(req.keep_alive());

        let buf = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (req, _) = parse(buf).unwrap().unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn pipelined_requests_parse_in_order() {
        let buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let (first, consumed) = parse(buf).unwrap().unwrap();
        assert_eq!(first.target(), b"/a");
        let (second, _) = parse(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(second.target(), b"/b");
    }

    #[test]
    fn other_method_yields_method_other() {
        let buf = b"PUT / HTTP/1.1\r\n\r\n";
        let (req, _) = parse(buf).unwrap().unwrap();
        assert_eq!(req.method(), Method::Other);
    }
}
