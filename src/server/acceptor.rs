//! Worker-process entry: a fresh current-thread scheduler, the lifespan
//! rendezvous, and the accept loop feeding connection tasks.

use crate::{
    app::Application,
    blocking::BlockingPool,
    errors::ServerError,
    limits::AllLimits,
    scope::{SchedulerHandle, State},
    server::{
        adapter::BoxedTransport,
        connection::{boxed, ConnEnv, Connection},
        lifespan,
    },
    tls,
};
use std::rc::Rc;
use tokio::{
    net::{TcpListener, TcpStream},
    signal::unix::{signal, SignalKind},
    task::LocalSet,
};
use tracing::{debug, info, warn};

/// Runs one worker to completion on its own freshly built scheduler.
///
/// The listener arrives as a std socket (inherited from the supervisor or
/// bound directly in single-process mode); the runtime is constructed
/// here, never inherited, so no scheduler state crosses the process
/// boundary.
pub(crate) fn run_worker<A, F>(
    make_app: F,
    limits: AllLimits,
    listener: std::net::TcpListener,
) -> Result<(), ServerError>
where
    A: Application,
    F: FnOnce() -> A,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;
    let local = LocalSet::new();
    local.block_on(&runtime, worker_main(make_app, limits, listener))
}

async fn worker_main<A, F>(
    make_app: F,
    limits: AllLimits,
    listener: std::net::TcpListener,
) -> Result<(), ServerError>
where
    A: Application,
    F: FnOnce() -> A,
{
    listener
        .set_nonblocking(true)
        .map_err(ServerError::Bind)?;
    let listener = TcpListener::from_std(listener).map_err(ServerError::Bind)?;

    let tls_acceptor = match &limits.tls {
        Some(settings) => Some(tls::load_acceptor(settings)?),
        None => None,
    };

    let scheduler = SchedulerHandle::new(BlockingPool::new(limits.blocking.clone()));
    let state = State::new();
    let app = Rc::new(make_app());

    // Startup rendezvous gates the accept loop.
    let session = lifespan::startup(&app, &state, &scheduler).await?;

    let env = Rc::new(ConnEnv::new(limits, state, scheduler));
    info!(pid = std::process::id(), "worker ready");

    accept_loop(&listener, &env, &app, tls_acceptor.as_ref()).await?;

    // Draining: finish in-flight work, then the shutdown rendezvous.
    drop(listener);
    while env.live.get() > 0 {
        env.idle.notified().await;
    }
    if let Some(session) = session {
        session.shutdown().await;
    }
    info!(pid = std::process::id(), served = env.served.get(), "worker exiting");
    Ok(())
}

async fn accept_loop<A: Application>(
    listener: &TcpListener,
    env: &Rc<ConnEnv>,
    app: &Rc<A>,
    tls_acceptor: Option<&tokio_rustls::TlsAcceptor>,
) -> Result<(), ServerError> {
    let mut term = signal(SignalKind::terminate()).map_err(ServerError::Runtime)?;
    let mut int = signal(SignalKind::interrupt()).map_err(ServerError::Runtime)?;

    loop {
        let at_capacity = env.live.get() >= env.limits.worker.max_connections;
        tokio::select! {
            _ = term.recv() => {
                info!("TERM received; draining worker");
                env.draining.set(true);
            }
            _ = int.recv() => {
                info!("INT received; draining worker");
                env.draining.set(true);
            }
            // Deferred accepts sit in the kernel backlog while at capacity.
            accepted = listener.accept(), if !at_capacity => match accepted {
                Ok((stream, peer)) => {
                    spawn_connection(stream, peer, env, app, tls_acceptor);
                }
                Err(e) => {
                    debug!("accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            },
            _ = env.idle.notified(), if at_capacity => {}
        }
        if env.draining.get() {
            env.idle.notify_waiters();
            return Ok(());
        }
    }
}

fn spawn_connection<A: Application>(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    env: &Rc<ConnEnv>,
    app: &Rc<A>,
    tls_acceptor: Option<&tokio_rustls::TlsAcceptor>,
) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("dropping connection without a local address: {e}");
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    env.live.set(env.live.get() + 1);
    let env = env.clone();
    let app = app.clone();
    let tls_acceptor = tls_acceptor.cloned();

    tokio::task::spawn_local(async move {
        match establish(stream, tls_acceptor).await {
            Ok((transport, tls_info)) => {
                Connection::new(transport, app, env.clone(), peer, local, tls_info)
                    .run()
                    .await;
            }
            Err(e) => warn!(client = %peer, "TLS handshake failed: {e}"),
        }
        env.live.set(env.live.get() - 1);
        env.idle.notify_waiters();
    });
}

/// Completes the TLS handshake when configured, producing the transport
/// plus the session metadata the `tls` extension advertises.
async fn establish(
    stream: TcpStream,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
) -> std::io::Result<(BoxedTransport, Option<crate::scope::TlsInfo>)> {
    match tls_acceptor {
        None => Ok((boxed(stream), None)),
        Some(acceptor) => {
            let session = acceptor.accept(stream).await?;
            let info = tls::introspect(session.get_ref().1);
            Ok((boxed(session), Some(info)))
        }
    }
}
