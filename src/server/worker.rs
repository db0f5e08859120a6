//! The worker event loop: one process, one thread, one cooperative runtime.
//!
//! Each worker owns its own memory pool, response cache, and connection
//! set. The listening socket is inherited from the master via `fork()`;
//! every worker calls `accept()` on it and the kernel load-balances
//! incoming connections across whichever worker wakes first.

use crate::cache::Cache;
use crate::config::Configuration;
use crate::logging::AccessLog;
use crate::pool::Pool;
use crate::server::connection::{Connection, ConnectionContext, IdleRegistry};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Receive-buffer size for every connection; also the point past which an
/// unterminated request is rejected as malformed.
pub const CONN_BUFFER_SIZE: usize = 8 * 1024;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff applied after an `EMFILE`/`ENFILE` accept failure, giving
/// already-open connections a chance to finish and free descriptors.
const FD_EXHAUSTION_BACKOFF: Duration = Duration::from_millis(20);

/// On `EMFILE`/`ENFILE`, connections idle for at least this long are
/// forcibly closed to free descriptors for new accepts.
const CULL_IDLE_FOR: Duration = Duration::from_secs(5);
/// Ceiling on how many connections one exhaustion event closes.
const MAX_CULL_PER_EXHAUSTION: usize = 10;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_term as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Pins the calling thread to `worker_id mod online_cpus`. Failure here is
/// non-fatal: the worker still runs, just without a pinned core.
fn set_cpu_affinity(worker_id: usize) {
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online <= 0 {
        return;
    }
    let cpu = worker_id % (online as usize);
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(worker_id, "failed to set CPU affinity");
        }
    }
}

/// TCP tuning applied to every accepted socket: no-delay, keepalive probes,
/// and generous send/recv buffers.
fn tune_accepted_socket(stream: &tokio::net::TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_nodelay(true);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_send_buffer_size(256 * 1024);
    let _ = sock.set_recv_buffer_size(256 * 1024);
}

/// Runs this worker to completion (until `SIGTERM`/`SIGINT` is observed).
/// Must be called post-`fork()`, before any other tokio runtime exists in
/// this process — a runtime's reactor and thread pool do not survive a
/// fork cleanly.
pub fn run(worker_id: usize, listener: StdTcpListener, config: Arc<Configuration>) {
    install_signal_handlers();
    set_cpu_affinity(worker_id);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");

    runtime.block_on(event_loop(worker_id, listener, config));
}

async fn event_loop(worker_id: usize, listener: StdTcpListener, config: Arc<Configuration>) {
    listener.set_nonblocking(true).expect("listener must be non-blocking");
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(worker_id, error = %e, "fatal: cannot adopt listener, worker exiting");
            return;
        }
    };

    let pool = Pool::new(CONN_BUFFER_SIZE);
    let cache = Cache::new();
    let access_log = match AccessLog::open(&config.log) {
        Ok(log) => Some(Arc::new(log)),
        Err(e) => {
            tracing::warn!(worker_id, error = %e, "could not open access log, continuing without it");
            None
        }
    };

    let ctx = Arc::new(ConnectionContext {
        root: config.root.clone(),
        cache,
        keep_alive_timeout: Duration::from_secs(config.keep_alive_timeout),
        access_log,
        requests_served: AtomicU64::new(0),
        bytes_sent: AtomicU64::new(0),
        idle_registry: IdleRegistry::new(),
    });

    tracing::info!(worker_id, "worker started");
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            biased;
            _ = stats_tick.tick() => {
                tracing::info!(
                    worker_id,
                    requests_served = ctx.requests_served.load(Ordering::Relaxed),
                    bytes_sent = ctx.bytes_sent.load(Ordering::Relaxed),
                    used_blocks = pool.used_blocks(),
                    "worker stats"
                );
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tune_accepted_socket(&stream);
                        match Connection::new(stream, addr, &pool) {
                            Ok(conn) => {
                                let ctx = ctx.clone();
                                tokio::task::spawn(conn.serve(ctx));
                            }
                            Err(_) => tracing::warn!(worker_id, "memory pool exhausted, dropping accepted connection"),
                        }
                    }
                    Err(e) if is_fd_exhaustion(&e) => {
                        let culled = ctx.idle_registry.cull(MAX_CULL_PER_EXHAUSTION, CULL_IDLE_FOR);
                        tracing::warn!(worker_id, culled, "file descriptors exhausted, culling idle connections and backing off");
                        tokio::time::sleep(FD_EXHAUSTION_BACKOFF).await;
                    }
                    Err(e) => {
                        tracing::error!(worker_id, error = %e, "fatal listener error, worker exiting");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(worker_id, "worker shutting down");
}

fn is_fd_exhaustion(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
