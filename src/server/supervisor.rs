//! The pre-fork supervisor: binds the listening socket, spawns worker
//! processes that inherit it, respawns them when they die, and fans out
//! graceful shutdown.
//!
//! Workers are separate executions of the current binary. The listening
//! socket is made inheritable by `dup2`-ing it onto a well-known fd in the
//! child's pre-exec phase; `PAGI_WORKER_FD` tells the child where to look.
//! Exec gives every worker a structurally fresh scheduler: nothing of the
//! parent's runtime survives into the child.

use crate::{errors::ServerError, limits::WorkerLimits};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    collections::HashMap,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    os::unix::process::CommandExt,
    process::ExitStatus,
    time::{Duration, Instant},
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tracing::{error, info, warn};

/// Environment variable carrying the inherited listener fd to a worker.
pub(crate) const WORKER_FD_ENV: &str = "PAGI_WORKER_FD";
/// The fd number the listener is dup2-ed onto in the child.
const WORKER_FD: RawFd = 3;

/// A worker exit that qualifies as an immediate startup failure if it
/// happens this quickly after the spawn.
const QUICK_DEATH: Duration = Duration::from_secs(1);

/// Binds the shared listening socket the workers will inherit.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<Socket, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Bind)?;
    socket.set_reuse_address(true).map_err(ServerError::Bind)?;
    socket.bind(&addr.into()).map_err(ServerError::Bind)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(ServerError::Bind)?;
    Ok(socket)
}

/// Runs the supervisor until graceful shutdown (or repeated worker
/// failure). Owns its own scheduler; every child interaction goes through
/// the scheduler's process- and signal-watch facilities.
pub(crate) fn supervise(listener: Socket, limits: &WorkerLimits) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;
    runtime.block_on(supervise_inner(listener, limits))
}

async fn supervise_inner(listener: Socket, limits: &WorkerLimits) -> Result<(), ServerError> {
    let listen_fd = listener.as_raw_fd();
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

    let mut workers: HashMap<u32, Instant> = HashMap::new();
    for _ in 0..limits.workers.max(1) {
        let pid = spawn_worker(listen_fd, &exit_tx)?;
        workers.insert(pid, Instant::now());
    }
    info!(count = workers.len(), "workers spawned");

    let mut term = signal(SignalKind::terminate()).map_err(ServerError::Runtime)?;
    let mut int = signal(SignalKind::interrupt()).map_err(ServerError::Runtime)?;
    let mut consecutive_failures = 0usize;

    loop {
        tokio::select! {
            _ = term.recv() => break,
            _ = int.recv() => break,
            Some((pid, status)) = exit_rx.recv() => {
                let started = workers.remove(&pid);
                let quick = started.is_some_and(|at| at.elapsed() < QUICK_DEATH);
                let clean = status.as_ref().map(ExitStatus::success).unwrap_or(false);

                match (clean, quick) {
                    (true, _) => {
                        // Normal recycle (max_requests drain) or external TERM.
                        info!(pid, "worker exited cleanly; respawning");
                        consecutive_failures = 0;
                    }
                    (false, false) => {
                        warn!(pid, ?status, "worker crashed; respawning");
                        consecutive_failures = 0;
                    }
                    (false, true) => {
                        consecutive_failures += 1;
                        warn!(
                            pid, ?status, consecutive_failures,
                            "worker died during startup"
                        );
                        if consecutive_failures >= limits.startup_failure_threshold {
                            error!("giving up after repeated startup failures");
                            shutdown(&mut workers, &mut exit_rx, limits.shutdown_timeout).await;
                            return Err(ServerError::WorkersFailing);
                        }
                    }
                }

                let pid = spawn_worker(listen_fd, &exit_tx)?;
                workers.insert(pid, Instant::now());
            }
        }
    }

    info!("shutdown signal received");
    shutdown(&mut workers, &mut exit_rx, limits.shutdown_timeout).await;
    Ok(())
}

/// TERM to every worker, a bounded wait for clean exits, then KILL for the
/// stragglers. The parent returns once the last child is reaped.
async fn shutdown(
    workers: &mut HashMap<u32, Instant>,
    exit_rx: &mut mpsc::UnboundedReceiver<(u32, std::io::Result<ExitStatus>)>,
    deadline: Duration,
) {
    for &pid in workers.keys() {
        deliver(pid, libc::SIGTERM);
    }

    let cutoff = tokio::time::sleep(deadline);
    tokio::pin!(cutoff);
    while !workers.is_empty() {
        tokio::select! {
            Some((pid, _)) = exit_rx.recv() => {
                workers.remove(&pid);
            }
            _ = &mut cutoff => {
                warn!(survivors = workers.len(), "shutdown deadline passed; killing workers");
                for &pid in workers.keys() {
                    deliver(pid, libc::SIGKILL);
                }
                while !workers.is_empty() {
                    match exit_rx.recv().await {
                        Some((pid, _)) => { workers.remove(&pid); }
                        None => break,
                    }
                }
                break;
            }
        }
    }
    info!("all workers reaped");
}

fn deliver(pid: u32, sig: libc::c_int) {
    // The worker may already be gone; ESRCH is fine.
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

/// Spawns one worker process: same binary, same arguments, the listener
/// dup2-ed onto the well-known fd. The child's exit is watched through the
/// scheduler and reported on `exit_tx`.
fn spawn_worker(
    listen_fd: RawFd,
    exit_tx: &mpsc::UnboundedSender<(u32, std::io::Result<ExitStatus>)>,
) -> Result<u32, ServerError> {
    let exe = std::env::current_exe().map_err(ServerError::Spawn)?;
    let mut command = std::process::Command::new(exe);
    command
        .args(std::env::args_os().skip(1))
        .env(WORKER_FD_ENV, WORKER_FD.to_string());

    // After fork, before exec: plant the listener on the agreed fd.
    // dup2 clears close-on-exec on the new descriptor.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(listen_fd, WORKER_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = tokio::process::Command::from(command)
        .spawn()
        .map_err(ServerError::Spawn)?;
    let pid = child.id().expect("pid of a freshly spawned child");

    let exit_tx = exit_tx.clone();
    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = exit_tx.send((pid, status));
    });

    Ok(pid)
}

/// Reads the inherited listener in a worker process.
pub(crate) fn inherited_listener() -> Result<Option<std::net::TcpListener>, ServerError> {
    let Ok(value) = std::env::var(WORKER_FD_ENV) else {
        return Ok(None);
    };
    let fd: RawFd = value.parse().map_err(|_| ServerError::BadWorkerHandoff)?;
    // Safety: the supervisor placed a listening socket on this fd before
    // exec; nothing else in this process has claimed it.
    let listener = unsafe {
        use std::os::fd::FromRawFd;
        std::net::TcpListener::from_raw_fd(fd)
    };
    Ok(Some(listener))
}
