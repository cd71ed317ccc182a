//! pagi - Reference server for the PAGI asynchronous application contract
//!
//! A PAGI application is a callable taking `(scope, receive, send)`; this
//! crate is the server that drives it: it accepts connections, parses the
//! wire protocols, presents each interaction to the application as a typed
//! scope with an event channel, and manages process lifecycle under load.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** (and 1.0): persistent connections, chunked bodies in
//!   both directions, response trailers
//! - **WebSocket**: RFC 6455 version 13, fragmentation assembly, strict
//!   control-frame validation
//! - **SSE**: `text/event-stream` responses with optional keepalives
//! - **TLS**: optional rustls listener, session metadata in the `tls`
//!   extension
//!
//! # Architecture
//!
//! - **Pre-fork worker pool** - the parent binds the listening socket and
//!   supervises N worker processes that accept concurrently; crashed
//!   workers are respawned, busy ones recycled after `max_requests`.
//! - **One scheduler per process** - every worker runs a single-threaded
//!   cooperative scheduler; applications may hold non-`Send` data and
//!   suspend only at explicit `await` points.
//! - **Backpressure on both sides** - request bodies flow through a
//!   bounded event queue, responses through a watermark-buffered writer.
//! - **Shared per-process state** - mutations made during lifespan startup
//!   are visible to every request scope in the same worker.
//! - **Blocking escape hatch** - `run_blocking` marshals synchronous work
//!   to a reaped-when-idle thread pool instead of stalling the scheduler.
//!
//! # Quick Start
//!
//! ```no_run
//! use pagi::{AppError, Application, AppEvent, Body, Receiver, Scope, Sender, Server, header};
//!
//! struct Hello;
//!
//! impl Application for Hello {
//!     async fn call(
//!         &self,
//!         _scope: Scope,
//!         _receiver: Receiver,
//!         sender: Sender,
//!     ) -> Result<(), AppError> {
//!         sender.send(AppEvent::HttpResponseStart {
//!             status: 200,
//!             headers: vec![header("content-type", "text/plain")],
//!             trailers: false,
//!         }).await?;
//!         sender.send(AppEvent::HttpResponseBody {
//!             body: Body::from("Hello, world!"),
//!             more: false,
//!         }).await?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), pagi::ServerError> {
//!     Server::builder()
//!         .bind("127.0.0.1:8000")
//!         .application(|| Hello)
//!         .build()
//!         .run()
//! }
//! ```
//!
//! `run` owns the process: in the parent it supervises workers, in a
//! worker (spawned by the supervisor from the same binary) it serves
//! connections. Set `workers: 0` for a single-process development mode.

pub(crate) mod http {
    pub(crate) mod codec;
    pub mod types;
}
pub(crate) mod ws {
    pub(crate) mod codec;
    pub(crate) mod handshake;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod adapter;
    pub(crate) mod connection;
    pub(crate) mod lifespan;
    pub(crate) mod server_impl;
    pub(crate) mod supervisor;
}
pub mod app;
pub(crate) mod blocking;
pub mod bridge;
pub mod errors;
pub mod events;
pub mod limits;
pub mod scope;
pub(crate) mod sse;
pub(crate) mod tls;

pub use crate::{
    app::{AppError, Application, Receiver, Sender},
    bridge::{Bridge, BridgeRequest, BridgeResponse, SyncGateway},
    errors::{ProtocolError, SendError, ServerError, WsFault},
    events::{header, AppEvent, Body, Headers, ServerEvent, SseEvent, WsMessage},
    http::types::{HttpVersion, Method},
    scope::{
        Extensions, HttpScope, LifespanScope, PagiInfo, RequestHead, SchedulerHandle, Scope,
        ScopeKind, SseScope, State, TlsInfo, WsScope,
    },
    server::server_impl::{Server, ServerBuilder},
};
