//! The public server entry point: builder, process-role dispatch, run.

use crate::{
    app::Application,
    errors::ServerError,
    limits::{
        AllLimits, BlockingLimits, ConnLimits, HttpLimits, SseLimits, TlsSettings, WorkerLimits,
        WsLimits,
    },
    server::{acceptor, supervisor},
};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::info;

/// The PAGI reference server.
///
/// `run` is a synchronous entry point: the server owns its schedulers (one
/// per process) rather than borrowing the caller's. In the parent process
/// it binds the listening socket and supervises the pre-forked workers; in
/// a worker process (recognized by the supervisor's fd handoff) it serves
/// connections.
///
/// # Examples
///
/// ```no_run
/// use pagi::{AppError, Application, AppEvent, Body, Receiver, Scope, Sender, Server, header};
///
/// struct Hello;
///
/// impl Application for Hello {
///     async fn call(
///         &self,
///         _scope: Scope,
///         _receiver: Receiver,
///         sender: Sender,
///     ) -> Result<(), AppError> {
///         sender.send(AppEvent::HttpResponseStart {
///             status: 200,
///             headers: vec![header("content-type", "text/plain")],
///             trailers: false,
///         }).await?;
///         sender.send(AppEvent::HttpResponseBody {
///             body: Body::from("Hello, world!"),
///             more: false,
///         }).await?;
///         Ok(())
///     }
/// }
///
/// fn main() -> Result<(), pagi::ServerError> {
///     Server::builder()
///         .bind("127.0.0.1:8000")
///         .application(|| Hello)
///         .build()
///         .run()
/// }
/// ```
pub struct Server<A, F>
where
    A: Application,
    F: FnOnce() -> A,
{
    bind: String,
    make_app: F,
    limits: AllLimits,
}

impl<A, F> Server<A, F>
where
    A: Application,
    F: FnOnce() -> A,
{
    /// Creates a new builder for configuring the server instance.
    pub fn builder() -> ServerBuilder<A, F> {
        ServerBuilder {
            bind: None,
            make_app: None,
            worker_limits: None,
            conn_limits: None,
            http_limits: None,
            ws_limits: None,
            sse_limits: None,
            blocking_limits: None,
            tls: None,
            root_path: None,
        }
    }

    /// Runs the server to completion.
    ///
    /// Returns after graceful shutdown (parent), worker drain (child), or
    /// with the error that stopped the process. A worker whose lifespan
    /// startup fails returns [`ServerError::Lifespan`]; letting that
    /// propagate out of `main` gives the nonzero exit the supervisor
    /// watches for.
    pub fn run(self) -> Result<(), ServerError> {
        // A worker process finds the inherited listener on the fd named by
        // the supervisor.
        if let Some(listener) = supervisor::inherited_listener()? {
            return acceptor::run_worker(self.make_app, self.limits, listener);
        }

        let addr = resolve(&self.bind)?;
        if self.limits.worker.workers == 0 {
            // Single-process mode: serve from this process, no fork.
            info!(%addr, "serving single-process");
            let listener =
                supervisor::bind_listener(addr, self.limits.worker.backlog)?.into();
            return acceptor::run_worker(self.make_app, self.limits, listener);
        }

        info!(%addr, workers = self.limits.worker.workers, "supervising");
        let listener = supervisor::bind_listener(addr, self.limits.worker.backlog)?;
        supervisor::supervise(listener, &self.limits.worker)
    }
}

fn resolve(bind: &str) -> Result<SocketAddr, ServerError> {
    bind.to_socket_addrs()
        .map_err(ServerError::Bind)?
        .next()
        .ok_or_else(|| {
            ServerError::Bind(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {bind}"),
            ))
        })
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<A, F>
where
    A: Application,
    F: FnOnce() -> A,
{
    bind: Option<String>,
    make_app: Option<F>,
    worker_limits: Option<WorkerLimits>,
    conn_limits: Option<ConnLimits>,
    http_limits: Option<HttpLimits>,
    ws_limits: Option<WsLimits>,
    sse_limits: Option<SseLimits>,
    blocking_limits: Option<BlockingLimits>,
    tls: Option<TlsSettings>,
    root_path: Option<String>,
}

impl<A, F> ServerBuilder<A, F>
where
    A: Application,
    F: FnOnce() -> A,
{
    /// Listen address, e.g. `"127.0.0.1:8000"`.
    ///
    /// **This is a required component.**
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = Some(addr.into());
        self
    }

    /// The application factory, called once in every process that serves
    /// traffic.
    ///
    /// **This is a required component.**
    pub fn application(mut self, make_app: F) -> Self {
        self.make_app = Some(make_app);
        self
    }

    /// Process topology: worker count, recycling, shutdown timing.
    pub fn worker_limits(mut self, limits: WorkerLimits) -> Self {
        self.worker_limits = Some(limits);
        self
    }

    /// Per-connection buffering and timeout knobs.
    pub fn conn_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = Some(limits);
        self
    }

    /// HTTP parsing limits.
    pub fn http_limits(mut self, limits: HttpLimits) -> Self {
        self.http_limits = Some(limits);
        self
    }

    /// WebSocket framing limits.
    pub fn ws_limits(mut self, limits: WsLimits) -> Self {
        self.ws_limits = Some(limits);
        self
    }

    /// Server-sent-events knobs.
    pub fn sse_limits(mut self, limits: SseLimits) -> Self {
        self.sse_limits = Some(limits);
        self
    }

    /// Blocking worker pool sizing.
    pub fn blocking_limits(mut self, limits: BlockingLimits) -> Self {
        self.blocking_limits = Some(limits);
        self
    }

    /// Enables TLS with the given certificate chain and key.
    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.tls = Some(settings);
        self
    }

    /// Mount prefix reported as `root_path` in request scopes.
    pub fn root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = Some(root_path.into());
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics when [`bind`](Self::bind) or [`application`](Self::application)
    /// was not called.
    #[track_caller]
    pub fn build(self) -> Server<A, F> {
        Server {
            bind: self.bind.expect("the `bind` method must be called to create"),
            make_app: self
                .make_app
                .expect("the `application` method must be called to create"),
            limits: AllLimits {
                worker: self.worker_limits.unwrap_or_default(),
                conn: self.conn_limits.unwrap_or_default(),
                http: self.http_limits.unwrap_or_default(),
                ws: self.ws_limits.unwrap_or_default(),
                sse: self.sse_limits.unwrap_or_default(),
                blocking: self.blocking_limits.unwrap_or_default(),
                tls: self.tls,
                root_path: self.root_path.unwrap_or_default(),
            },
        }
    }
}
