//! Listener setup, worker supervision, and signal-driven lifecycle control
//! for the master process.
//!
//! The master never serves a request itself: it owns the listening socket,
//! forks one child per configured worker, and spends the rest of its life
//! reaping and respawning dead children and relaying signals, until told to
//! shut down.

use crate::config::Configuration;
use crate::server::worker;
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);
static REAP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_hup(_signum: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

extern "C" fn on_chld(_signum: libc::c_int) {
    REAP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_term as libc::sighandler_t);
        libc::signal(libc::SIGHUP, on_hup as libc::sighandler_t);
        libc::signal(libc::SIGCHLD, on_chld as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Time the master waits for workers to exit on their own after `SIGTERM`
/// before escalating to `SIGKILL`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Binds the listening socket with the tuning the original C master used:
/// address reuse so a restart doesn't hit `EADDRINUSE` while the previous
/// generation's sockets linger in `TIME_WAIT`, and port reuse so every
/// worker (and, across a reload, the next master generation) can share one
/// listener.
fn bind_listener(port: u16) -> std::io::Result<StdTcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct WorkerSlot {
    id: usize,
    pid: libc::pid_t,
}

fn spawn_worker(id: usize, listener: &StdTcpListener, config: &Arc<Configuration>) -> libc::pid_t {
    let listener = listener.try_clone().expect("listener fd must be duplicable");
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            worker::run(id, listener, config.clone());
            std::process::exit(0);
        }
        pid => pid,
    }
}

/// Runs the master to completion: binds, forks the configured worker count,
/// then supervises until a termination signal is observed. Returns the
/// process exit code.
pub fn run(config: Configuration, config_path: PathBuf) -> i32 {
    install_signal_handlers();

    let listener = match bind_listener(config.port) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = config.port, "failed to bind listener");
            return 1;
        }
    };
    tracing::info!(port = config.port, workers = config.worker_processes, "master started");

    let config = Arc::new(Mutex::new(config));
    let mut slots: Vec<WorkerSlot> = Vec::new();
    {
        let guard = config.lock().unwrap();
        for id in 0..guard.worker_processes {
            let pid = spawn_worker(id, &listener, &Arc::new(guard.clone()));
            slots.push(WorkerSlot { id, pid });
        }
    }

    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }

        if RELOAD.swap(false, Ordering::SeqCst) {
            let path = config_path.clone();
            let mut guard = config.lock().unwrap();
            match guard.reload(&path) {
                Ok(()) => {
                    tracing::info!("master: configuration reloaded");
                    for slot in &slots {
                        unsafe {
                            libc::kill(slot.pid, libc::SIGHUP);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "master: reload failed, keeping previous configuration"),
            }
        }

        if REAP.swap(false, Ordering::SeqCst) {
            reap_and_respawn(&mut slots, &listener, &config);
        }

        // A short sleep rather than a blocking `waitpid` keeps the loop
        // responsive to `SHUTDOWN`/`RELOAD` set from a signal handler
        // between reaps.
        std::thread::sleep(Duration::from_millis(200));
    }

    shut_down(&slots);
    0
}

fn reap_and_respawn(slots: &mut Vec<WorkerSlot>, listener: &StdTcpListener, config: &Arc<Mutex<Configuration>>) {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        let Some(pos) = slots.iter().position(|s| s.pid == pid) else {
            continue;
        };
        let id = slots[pos].id;
        if SHUTDOWN.load(Ordering::SeqCst) {
            slots.remove(pos);
            continue;
        }
        tracing::warn!(worker_id = id, pid, "worker died, respawning");
        let snapshot = Arc::new(config.lock().unwrap().clone());
        let new_pid = spawn_worker(id, listener, &snapshot);
        slots[pos].pid = new_pid;
    }
}

fn shut_down(slots: &[WorkerSlot]) {
    tracing::info!("master: shutting down, signaling workers");
    for slot in slots {
        unsafe {
            libc::kill(slot.pid, libc::SIGTERM);
        }
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    let mut remaining: Vec<libc::pid_t> = slots.iter().map(|s| s.pid).collect();
    while !remaining.is_empty() && Instant::now() < deadline {
        remaining.retain(|&pid| {
            let mut status: libc::c_int = 0;
            unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) != pid }
        });
        if !remaining.is_empty() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    for pid in remaining {
        tracing::warn!(pid, "worker did not exit in time, sending SIGKILL");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            let mut status: libc::c_int = 0;
            libc::waitpid(pid, &mut status, 0);
        }
    }
    tracing::info!("master: all workers exited");
}
