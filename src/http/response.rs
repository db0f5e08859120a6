//! Response building and the zero-copy-aware sender.
//!
//! A [`Response`] carries exactly one body source at a time: an inline byte
//! buffer, an owned file handle with a send offset, or a shared reference to
//! a cached entry. [`Response::send_step`] drives that source to completion
//! one non-blocking attempt at a time, returning [`SendOutcome`] so the
//! per-connection state machine can register writable interest and resume
//! later without re-deriving where the send left off.

use crate::cache::CachedEntry;
use crate::http::types::{StatusCode, Version};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Chunk size for a single zero-copy `sendfile` call, matching the 1 MiB
/// chunking the original file-send loop used to bound per-call latency.
const SENDFILE_CHUNK: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Response {
    pub(crate) status: StatusCode,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) body: Body,
    state: SendState,
}

/// The one active body source for a response, per the data-model invariant.
#[derive(Debug)]
pub enum Body {
    /// No body (e.g. a HEAD response, or a 304/error with empty content).
    None,
    /// An inline, fully-buffered body (small error bodies, 304 responses).
    Inline(Vec<u8>),
    /// An owned file handle serving the body via zero-copy `sendfile`.
    File { file: File, len: u64 },
    /// A shared reference into the response cache; bytes are copied to the
    /// socket in a loop rather than transferred zero-copy, since they already
    /// live in user-space memory.
    Cached(Arc<CachedEntry>),
}

#[derive(Debug, Clone, Copy)]
enum SendState {
    /// Still writing the header block (and, for `Cached`, its body is bundled
    /// into the same buffer once the synthesized `Connection:` line is spliced
    /// in, so `Cached` also resolves through `Head`).
    Head { offset: usize },
    File { offset: u64 },
    Inline { offset: usize },
    Done,
}

/// Outcome of one [`Response::send_step`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The entire response has been written.
    Done,
    /// The socket would block; interest remains writable and the offset is
    /// already persisted in `self`, so the next call resumes exactly here.
    WouldBlock,
    /// The peer went away (`EPIPE`/`ECONNRESET`) or another unrecoverable I/O
    /// error occurred; the connection must be destroyed.
    Failed,
}

impl Response {
    /// Builds a response with the mandatory `Server` header already present.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: vec![(b"Server".to_vec(), b"NxLite".to_vec())],
            body: Body::None,
            state: SendState::Head { offset: 0 },
        }
    }

    pub fn header<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(&mut self, name: N, value: V) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body_inline(&mut self, data: Vec<u8>) -> &mut Self {
        self.header("Content-Length", data.len().to_string());
        self.body = Body::Inline(data);
        self
    }

    pub fn body_file(&mut self, file: File, len: u64) -> &mut Self {
        self.header("Content-Length", len.to_string());
        self.body = Body::File { file, len };
        self
    }

    pub fn body_cached(&mut self, entry: Arc<CachedEntry>) -> &mut Self {
        self.body = Body::Cached(entry);
        self
    }

    /// Drops the body for a HEAD response while keeping headers (including
    /// `Content-Length`) exactly as a GET for the same resource would have
    /// set them.
    pub fn drop_body_for_head(&mut self) {
        self.body = Body::None;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The `Content-Length` value already present on this response, for the
    /// access-log byte count. `0` if the header was never set (e.g. a body
    /// transferred with `Transfer-Encoding` in a future revision).
    pub(crate) fn content_length(&self) -> u64 {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"Content-Length"))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Serializes the status line and headers (not the `Connection` line,
    /// which depends on the connection's keep-alive decision and is appended
    /// at send time) into `out`.
    fn write_head(&self, out: &mut Vec<u8>, version: Version, keep_alive: bool) {
        out.extend_from_slice(version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.0.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason_phrase().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n"
        } else {
            b"Connection: close\r\n"
        });
        out.extend_from_slice(b"\r\n");
    }

    /// Status line + headers only, with neither the `Connection:` line nor
    /// the blank-line terminator — this is exactly the shape the response
    /// cache stores, since the per-request `Connection:` header is appended
    /// per-connection and never persisted. The status line always uses
    /// `HTTP/1.1`'s wire token; the cache is keyed by path and vary, not by
    /// request version, so a stored entry is shared across versions.
    pub(crate) fn head_for_cache(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(Version::Http11.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.0.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason_phrase().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Materializes the head buffer once, lazily, the first time `send_step`
    /// is called. For `Cached` bodies this splices the synthesized
    /// `Connection:` line between the entry's stored headers and its stored
    /// body, since the cache never stores that per-connection line.
    fn build_head_buffer(&self, version: Version, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        match &self.body {
            Body::Cached(entry) => {
                out.extend_from_slice(&entry.head);
                out.extend_from_slice(if keep_alive {
                    b"Connection: keep-alive\r\n"
                } else {
                    b"Connection: close\r\n"
                });
                out.extend_from_slice(b"\r\n");
            }
            _ => self.write_head(&mut out, version, keep_alive),
        }
        out
    }

    /// Advances the send by one non-blocking attempt. `head_buf` must be the
    /// value previously returned by [`Response::build_head_buffer`] (the
    /// caller persists it alongside the connection's pending response so it
    /// is only built once per response).
    pub fn send_step(&mut self, stream: &TcpStream, head_buf: &[u8]) -> SendOutcome {
        loop {
            match self.state {
                SendState::Head { offset } => match write_some(stream, &head_buf[offset..]) {
                    Ok(0) => return SendOutcome::WouldBlock,
                    Ok(n) if offset + n < head_buf.len() => {
                        self.state = SendState::Head { offset: offset + n };
                        return SendOutcome::WouldBlock;
                    }
                    Ok(_) => {
                        self.state = match &self.body {
                            Body::File { .. } => SendState::File { offset: 0 },
                            Body::Cached(_) | Body::Inline(_) => SendState::Inline { offset: 0 },
                            Body::None => SendState::Done,
                        };
                        if matches!(self.state, SendState::Done) {
                            return SendOutcome::Done;
                        }
                    }
                    Err(_) => return SendOutcome::Failed,
                },
                SendState::File { offset } => {
                    let Body::File { file, len } = &self.body else { unreachable!() };
                    if offset >= *len {
                        self.state = SendState::Done;
                        return SendOutcome::Done;
                    }
                    let remaining = (*len - offset) as usize;
                    let chunk = remaining.min(SENDFILE_CHUNK);
                    match sendfile(stream, file, offset, chunk) {
                        Ok(0) => return SendOutcome::WouldBlock,
                        Ok(n) => {
                            self.state = SendState::File { offset: offset + n as u64 };
                        }
                        Err(SendfileError::WouldBlock) => return SendOutcome::WouldBlock,
                        Err(SendfileError::Fatal) => return SendOutcome::Failed,
                    }
                }
                SendState::Inline { offset } => {
                    let body: &[u8] = match &self.body {
                        Body::Inline(b) => b,
                        Body::Cached(entry) => &entry.body,
                        _ => unreachable!(),
                    };
                    match write_some(stream, &body[offset..]) {
                        Ok(0) => return SendOutcome::WouldBlock,
                        Ok(n) if offset + n < body.len() => {
                            self.state = SendState::Inline { offset: offset + n };
                            return SendOutcome::WouldBlock;
                        }
                        Ok(_) => {
                            self.state = SendState::Done;
                            return SendOutcome::Done;
                        }
                        Err(_) => return SendOutcome::Failed,
                    }
                }
                SendState::Done => return SendOutcome::Done,
            }
        }
    }
}

/// One non-blocking write attempt. `Ok(0)` distinctly means "would block with
/// nothing written" so callers don't confuse it with a zero-length buffer
/// (which send_step never passes in).
fn write_some(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    match stream.try_write(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

enum SendfileError {
    WouldBlock,
    Fatal,
}

/// A single `sendfile(2)` call transferring up to `chunk` bytes from `file`
/// at `offset` into `stream`: the zero-copy fast path for file bodies.
fn sendfile(stream: &TcpStream, file: &File, offset: u64, chunk: usize) -> Result<usize, SendfileError> {
    let mut off = offset as libc::off_t;
    let ret = unsafe {
        libc::sendfile(
            stream.as_raw_fd(),
            file.as_raw_fd(),
            &mut off,
            chunk,
        )
    };
    if ret >= 0 {
        Ok(ret as usize)
    } else {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Err(SendfileError::WouldBlock),
            _ => Err(SendfileError::Fatal),
        }
    }
}

/// Builds the head buffer for an already-constructed response. Exposed so the
/// connection state machine can build it exactly once and hold it alongside
/// the pending response across would-block boundaries.
pub fn prepare(response: &Response, version: Version, keep_alive: bool) -> Vec<u8> {
    response.build_head_buffer(version, keep_alive)
}

/// The cacheable head bytes for `response` (status line + headers, no
/// `Connection:` line, no blank-line terminator) — see
/// [`Response::head_for_cache`].
pub fn cacheable_head(response: &Response) -> Vec<u8> {
    response.head_for_cache()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_has_connection_and_blank_line() {
        let mut resp = Response::new(StatusCode::OK);
        resp.header("Content-Type", "text/plain");
        resp.body_inline(b"hi".to_vec());
        let head = prepare(&resp, Version::Http11, true);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn unknown_status_uses_unknown_reason() {
        let resp = Response::new(StatusCode(599));
        let head = prepare(&resp, Version::Http11, false);
        assert!(String::from_utf8(head).unwrap().starts_with("HTTP/1.1 599 Unknown\r\n"));
    }
}
