//! Server configuration: limits, timeouts and process topology.
//!
//! Defaults are intentionally conservative. Every struct is consumed by the
//! [`ServerBuilder`](crate::ServerBuilder) through a `..Default::default()`
//! update, so deployments only spell out what they change:
//!
//! ```no_run
//! use pagi::{Server, limits::{HttpLimits, WorkerLimits}};
//! use std::time::Duration;
//!
//! # struct MyApp;
//! # impl pagi::Application for MyApp {
//! #     async fn call(
//! #         &self, _: pagi::Scope, _: pagi::Receiver, _: pagi::Sender,
//! #     ) -> Result<(), pagi::AppError> { Ok(()) }
//! # }
//! # fn make_app() -> MyApp { MyApp }
//! Server::builder()
//!     .bind("127.0.0.1:8000")
//!     .application(make_app)
//!     .worker_limits(WorkerLimits {
//!         workers: 4,
//!         max_requests: Some(10_000),
//!         ..WorkerLimits::default()
//!     })
//!     .http_limits(HttpLimits {
//!         max_header_bytes: 32 * 1024,
//!         ..HttpLimits::default()
//!     })
//!     .build()
//!     .run()
//!     .unwrap();
//! ```

use std::{path::PathBuf, time::Duration};

/// Process topology: how many workers, how long they live, how they die.
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    /// Number of pre-forked worker processes (default: `1`).
    ///
    /// Workers share the listening socket; the kernel distributes accepts.
    /// They share nothing else.
    pub workers: usize,

    /// Requests a worker serves before it drains and is respawned
    /// (default: `None` = unbounded).
    ///
    /// Bounds per-worker memory growth. A draining worker stops accepting,
    /// finishes in-flight work, runs the shutdown rendezvous and exits 0.
    pub max_requests: Option<usize>,

    /// Live connections a single worker will hold before deferring accepts
    /// (default: `1024`). Deferred connections sit in the kernel backlog.
    pub max_connections: usize,

    /// Listen backlog handed to the kernel (default: `1024`).
    pub backlog: u32,

    /// How long the supervisor waits for workers to drain after TERM/INT
    /// before killing them (default: 30s).
    pub shutdown_timeout: Duration,

    /// Consecutive immediate worker deaths tolerated before the supervisor
    /// gives up and exits nonzero (default: `3`).
    pub startup_failure_threshold: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            workers: 1,
            max_requests: None,
            max_connections: 1024,
            backlog: 1024,
            shutdown_timeout: Duration::from_secs(30),
            startup_failure_threshold: 3,
        }
    }
}

/// Per-connection buffering and lifetime knobs.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Write-buffer high watermark in bytes (default: 64 KiB).
    ///
    /// A `send` that pushes the buffered response past this mark suspends
    /// until the transport drains. This is the response-side backpressure.
    pub write_watermark: usize,

    /// Capacity of the per-request event queue between the transport reader
    /// and `receive` (default: `8`). A full queue suspends the reader; this
    /// is the request-side backpressure.
    pub event_queue: usize,

    /// Idle time allowed on a persistent connection between requests
    /// (default: 75s). The first request gets the same allowance.
    pub keep_alive_timeout: Duration,

    /// Largest body slice handed to the application in one
    /// `http.request` event (default: 64 KiB).
    pub body_slice: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            write_watermark: 64 * 1024,
            event_queue: 8,
            keep_alive_timeout: Duration::from_secs(75),
            body_slice: 64 * 1024,
        }
    }
}

/// HTTP/1.1 parsing limits.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Cap on the request line plus header block, in bytes (default: 16 KiB).
    /// One byte over answers `431`.
    pub max_header_bytes: usize,

    /// Cap on the number of request headers (default: `100`).
    pub max_headers: usize,

    /// Files at or under this size are sent as a single body write; larger
    /// ones stream in slices (default: 64 KiB).
    pub file_inline_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_headers: 100,
            file_inline_bytes: 64 * 1024,
        }
    }
}

/// WebSocket framing limits.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Largest single frame payload accepted (default: 1 MiB).
    pub max_frame_bytes: usize,

    /// Largest assembled message (all fragments) accepted (default: 4 MiB).
    /// Exceeding it closes with 1009.
    pub max_message_bytes: usize,

    /// How long to wait for the peer's close frame after the server sends
    /// one (default: 10s).
    pub close_timeout: Duration,
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_message_bytes: 4 * 1024 * 1024,
            close_timeout: Duration::from_secs(10),
        }
    }
}

/// Server-sent event stream knobs.
#[derive(Debug, Clone)]
pub struct SseLimits {
    /// Interval between `: ping` keepalive comment lines (default: 15s;
    /// `None` disables keepalives).
    pub keepalive: Option<Duration>,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(15)),
        }
    }
}

/// The blocking worker pool behind
/// [`run_blocking`](crate::scope::SchedulerHandle::run_blocking).
#[derive(Debug, Clone)]
pub struct BlockingLimits {
    /// Maximum worker threads (default: `8`). Threads are spawned on demand.
    pub threads: usize,

    /// Idle time before a worker thread is reaped (default: 30s).
    pub idle_timeout: Duration,
}

impl Default for BlockingLimits {
    fn default() -> Self {
        Self {
            threads: 8,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS listener material. Presence of this struct turns TLS on.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM certificate chain path.
    pub cert_path: PathBuf,
    /// PEM private key path (PKCS#8, RSA or SEC1).
    pub key_path: PathBuf,
    /// Client-certificate policy (default: never request one).
    pub client_auth: ClientAuth,
}

/// Whether (and how) the listener asks clients for a certificate.
///
/// Anything other than `None` makes the handshake send a certificate
/// request; a certificate the client does present is verified against the
/// CA bundle and then surfaced as `client_cert_name` in the `tls`
/// extension.
#[derive(Debug, Clone, Default)]
pub enum ClientAuth {
    /// Never request a client certificate.
    #[default]
    None,
    /// Request a certificate but accept connections without one. A
    /// presented certificate must still verify against the bundle.
    Optional {
        /// PEM bundle of acceptable client CAs.
        ca_path: PathBuf,
    },
    /// Require a verified certificate; handshakes without one fail.
    Required {
        /// PEM bundle of acceptable client CAs.
        ca_path: PathBuf,
    },
}

/// Everything a worker process needs to run. Assembled by the builder,
/// carried across the exec boundary by re-reading the same builder inputs
/// in the child.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) worker: WorkerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) http: HttpLimits,
    pub(crate) ws: WsLimits,
    pub(crate) sse: SseLimits,
    pub(crate) blocking: BlockingLimits,
    pub(crate) tls: Option<TlsSettings>,
    pub(crate) root_path: String,
}
