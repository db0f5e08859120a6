//! The per-connection state machine: accept → read → parse → handle →
//! write → reuse/close, implemented as one task per connection
//! cooperatively scheduled by the worker's single-threaded runtime.
//! [`Response::send_step`] keeps the write side's resumption point an
//! explicit, inspectable value rather than an implicit suspended `.await`,
//! so a timeout can race and cancel it cleanly.

use crate::cache::Cache;
use crate::errors::NxError;
use crate::file_service;
use crate::http::request;
use crate::http::response::{self, Response, SendOutcome};
use crate::http::types::{Method, StatusCode, Version};
use crate::logging::AccessLog;
use crate::pool::{Block, Pool, PoolError};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::sleep;

/// Tracks every live connection's last-activity time so the worker can cull
/// idle ones under file-descriptor pressure instead of only backing off.
#[derive(Default)]
pub(crate) struct IdleRegistry {
    next_id: AtomicU64,
    entries: Mutex<FxHashMap<u64, IdleEntry>>,
}

struct IdleEntry {
    last_activity: Instant,
    force_close: Arc<AtomicBool>,
}

impl IdleRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let force_close = Arc::new(AtomicBool::new(false));
        self.entries.lock().unwrap().insert(
            id,
            IdleEntry { last_activity: Instant::now(), force_close: force_close.clone() },
        );
        (id, force_close)
    }

    fn touch(&self, id: u64) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    fn unregister(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    /// Flags up to `max` connections idle for at least `min_idle` for
    /// forced closure, returning how many were flagged. Each flagged
    /// connection notices on its next loop iteration and closes itself.
    pub(crate) fn cull(&self, max: usize, min_idle: Duration) -> usize {
        let entries = self.entries.lock().unwrap();
        let mut culled = 0;
        for entry in entries.values() {
            if culled >= max {
                break;
            }
            if entry.last_activity.elapsed() >= min_idle {
                entry.force_close.store(true, Ordering::Relaxed);
                culled += 1;
            }
        }
        culled
    }
}

/// Deregisters its connection from the [`IdleRegistry`] when dropped, so
/// every return path out of `Connection::serve` cleans up without repeating
/// the call at each one.
struct IdleGuard<'a> {
    registry: &'a IdleRegistry,
    id: u64,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Shared, read-mostly state every connection on a worker needs. One
/// instance per worker, handed to every connection task by `Arc` clone.
pub(crate) struct ConnectionContext {
    pub(crate) root: PathBuf,
    pub(crate) cache: Cache,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) access_log: Option<Arc<AccessLog>>,
    pub(crate) requests_served: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) idle_registry: IdleRegistry,
}

pub(crate) struct Connection {
    stream: TcpStream,
    buf: Block,
    filled: usize,
    client_addr: SocketAddr,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, client_addr: SocketAddr, pool: &Pool) -> Result<Self, PoolError> {
        let buf = pool.allocate()?;
        Ok(Self { stream, buf, filled: 0, client_addr })
    }

    /// Drives this connection until the peer disconnects, an error response
    /// closes it, it sits idle past `keep_alive_timeout`, or the worker
    /// culls it under file-descriptor pressure.
    pub(crate) async fn serve(mut self, ctx: Arc<ConnectionContext>) {
        let (id, force_close) = ctx.idle_registry.register();
        let _guard = IdleGuard { registry: &ctx.idle_registry, id };

        let mut last_activity = Instant::now();
        loop {
            if force_close.load(Ordering::Relaxed) {
                return;
            }
            let elapsed = last_activity.elapsed();
            if elapsed >= ctx.keep_alive_timeout {
                return;
            }
            let remaining = ctx.keep_alive_timeout - elapsed;

            tokio::select! {
                biased;
                readiness = self.stream.readable() => {
                    if readiness.is_err() {
                        return;
                    }
                    match self.stream.try_read(&mut self.buf[self.filled..]) {
                        Ok(0) => return, // peer hang-up
                        Ok(n) => {
                            self.filled += n;
                            last_activity = Instant::now();
                            ctx.idle_registry.touch(id);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(_) => return, // transient read error: treat as peer gone
                    }
                }
                _ = sleep(remaining) => {
                    return; // idle timeout
                }
            }

            if !self.drain_requests(&ctx).await {
                return;
            }
        }
    }

    /// Parses and answers every complete request currently sitting in the
    /// buffer, in arrival order, so pipelined responses come back in the
    /// same order they were requested. Returns `false` when the connection
    /// must close.
    async fn drain_requests(&mut self, ctx: &ConnectionContext) -> bool {
        loop {
            match request::parse(&self.buf[..self.filled]) {
                Ok(None) => {
                    if self.filled == self.buf.len() {
                        self.close_with_error(ctx, StatusCode::BAD_REQUEST).await;
                        return false;
                    }
                    return true;
                }
                Ok(Some((req, consumed))) => {
                    let version = req.version();
                    let req_keep_alive = req.keep_alive();
                    let method = req.method();
                    let target = String::from_utf8_lossy(req.target()).into_owned();

                    let outcome = match method {
                        Method::Get => file_service::serve(&req, &ctx.root, &ctx.cache, false),
                        Method::Head => file_service::serve(&req, &ctx.root, &ctx.cache, true),
                        Method::Other => Err(NxError::NotImplemented),
                    };
                    self.consume(consumed);

                    let keep_going = match outcome {
                        Ok(mut resp) => {
                            let status = resp.status();
                            let sent = self.send_response(&mut resp, version, req_keep_alive).await;
                            let bytes = resp.content_length();
                            self.finish(ctx, status, method_str(method), &target, bytes).await;
                            req_keep_alive && sent.is_some()
                        }
                        Err(err) => match err.as_status() {
                            Some(status) => {
                                let keep_alive = req_keep_alive && err.keeps_connection_alive();
                                let mut resp = error_response(status);
                                let sent = self.send_response(&mut resp, version, keep_alive).await;
                                self.finish(ctx, status, method_str(method), &target, 0).await;
                                keep_alive && sent.is_some()
                            }
                            None => false,
                        },
                    };

                    if !keep_going {
                        return false;
                    }
                }
                Err(_) => {
                    self.close_with_error(ctx, StatusCode::BAD_REQUEST).await;
                    return false;
                }
            }
        }
    }

    /// Records stats and the access-log line for a response already written
    /// to the wire.
    async fn finish(
        &mut self,
        ctx: &ConnectionContext,
        status: StatusCode,
        method: &str,
        target: &str,
        bytes: u64,
    ) {
        ctx.requests_served.fetch_add(1, Ordering::Relaxed);
        ctx.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        if let Some(log) = &ctx.access_log {
            log.log(self.client_addr.ip(), method, target, status.0, bytes);
        }
    }

    /// Sends a bare status-only response and closes — used for the two
    /// pre-parse failure cases (malformed request, buffer full without a
    /// header terminator) where no method/target was ever recovered.
    async fn close_with_error(&mut self, ctx: &ConnectionContext, status: StatusCode) {
        let mut resp = error_response(status);
        let _ = self.send_response(&mut resp, Version::Http11, false).await;
        self.finish(ctx, status, "-", "-", 0).await;
    }

    async fn send_response(&mut self, resp: &mut Response, version: Version, keep_alive: bool) -> Option<()> {
        let head_buf = response::prepare(resp, version, keep_alive);
        loop {
            match resp.send_step(&self.stream, &head_buf) {
                SendOutcome::Done => return Some(()),
                SendOutcome::WouldBlock => {
                    if self.stream.writable().await.is_err() {
                        return None;
                    }
                }
                SendOutcome::Failed => return None,
            }
        }
    }

    /// Slides any unparsed residual bytes to the head of the buffer after a
    /// request is consumed, making room for the rest of a pipelined batch
    /// or the next read.
    fn consume(&mut self, consumed: usize) {
        self.buf.copy_within(consumed..self.filled, 0);
        self.filled -= consumed;
    }
}

fn method_str(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Head => "HEAD",
        Method::Other => "OTHER",
    }
}

fn error_response(status: StatusCode) -> Response {
    let mut resp = Response::new(status);
    resp.body_inline(Vec::new());
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_str_covers_all_variants() {
        assert_eq!(method_str(Method::Get), "GET");
        assert_eq!(method_str(Method::Head), "HEAD");
        assert_eq!(method_str(Method::Other), "OTHER");
    }

    #[test]
    fn error_response_has_zero_length_body() {
        let resp = error_response(StatusCode::NOT_FOUND);
        assert_eq!(resp.content_length(), 0);
    }
}
