//! Core HTTP protocol types: method, version, status code, and header map.

use crate::errors::NxError;

// METHOD

/// Request methods this server understands.
///
/// Only `GET` and `HEAD` are served; every other method (including ones the
/// wire format is perfectly capable of carrying, such as `POST`) is
/// recognized just far enough to produce a clean 501 — request bodies
/// beyond a header-terminated GET/HEAD are out of scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    /// Any other method token; always answered with 501 Not Implemented.
    Other,
}

impl Method {
    /// Parses the method token at the start of a request line, returning the
    /// method and the number of bytes consumed including the trailing space.
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<(Self, usize), NxError> {
        match src {
            [b'G', b'E', b'T', b' ', ..] => Ok((Method::Get, 4)),
            [b'H', b'E', b'A', b'D', b' ', ..] => Ok((Method::Head, 5)),
            _ => {
                // Consume up to the first space so the rest of the line can
                // still be skipped cleanly when producing the 501 response.
                let end = src.iter().position(|&b| b == b' ').ok_or(NxError::MalformedRequest)?;
                Ok((Method::Other, end + 1))
            }
        }
    }
}

// VERSION

/// HTTP protocol version. Only 1.0 and 1.1 are accepted on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, NxError> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(NxError::MalformedRequest),
        }
    }

    /// Default keep-alive posture before any `Connection:` header is consulted.
    pub(crate) const fn default_keep_alive(&self) -> bool {
        matches!(self, Version::Http11)
    }

    pub(crate) const fn as_bytes(&self) -> &'static [u8] {
        match self {
            Version::Http10 => b"HTTP/1.0",
            Version::Http11 => b"HTTP/1.1",
        }
    }
}

// STATUS CODE

/// An HTTP status code paired with its canonical reason phrase.
///
/// Represented as a plain `u16` rather than a closed enum: any status code
/// can be carried (by the file service, by error responses), and only a
/// fixed set of codes get a named reason phrase, with everything else
/// falling back to `"Unknown"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const URI_TOO_LONG: StatusCode = StatusCode(414);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const HTTP_VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

    pub const fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            304 => "Not Modified",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            414 => "URI Too Long",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

// HEADER MAP

/// A single request header. Borrowed from the connection's read buffer for
/// the lifetime of the request it belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

/// An ordered, linearly-searched header list, matching the request's wire
/// order. Capped at 32 headers; names are compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap<'a> {
    pub(crate) headers: Vec<Header<'a>>,
}

impl<'a> HeaderMap<'a> {
    pub(crate) fn new() -> Self {
        Self { headers: Vec::with_capacity(32) }
    }

    pub(crate) fn clear(&mut self) {
        self.headers.clear();
    }

    pub(crate) fn push(&mut self, name: &'a [u8], value: &'a [u8]) -> Result<(), NxError> {
        if self.headers.len() >= 32 {
            return Err(NxError::MalformedRequest);
        }
        self.headers.push(Header { name, value });
        Ok(())
    }

    /// Case-insensitive lookup by header name.
    pub fn get(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_get_and_head() {
        assert_eq!(Method::from_bytes(b"GET / HTTP/1.1").unwrap().0, Method::Get);
        assert_eq!(Method::from_bytes(b"HEAD / HTTP/1.1").unwrap().0, Method::Head);
    }

    #[test]
    fn method_other_consumes_to_next_space() {
        let (method, consumed) = Method::from_bytes(b"PUT / HTTP/1.1").unwrap();
        assert_eq!(method, Method::Other);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn version_default_keep_alive() {
        assert!(Version::Http11.default_keep_alive());
        assert!(!Version::Http10.default_keep_alive());
    }

    #[test]
    fn unknown_status_reason_is_unknown() {
        assert_eq!(StatusCode(599).reason_phrase(), "Unknown");
        assert_eq!(StatusCode::NOT_FOUND.reason_phrase(), "Not Found");
    }

    #[test]
    fn header_map_case_insensitive_lookup() {
        let mut map = HeaderMap::new();
        map.push(b"Content-Type", b"text/html").unwrap();
        assert_eq!(map.get(b"content-type"), Some(&b"text/html"[..]));
        assert_eq!(map.get(b"missing"), None);
    }
}
