//! Scopes: the read-only description of one interaction, handed to the
//! application alongside its `receive`/`send` halves.
//!
//! A scope is built once by the server and never mutated afterwards. The
//! one deliberate exception is [`State`]: a reference to the per-process
//! shared container whose interior the application may mutate (the
//! scheduler is single-threaded, so no locking is involved).

use crate::{
    blocking::BlockingPool,
    errors::BlockingError,
    events::Headers,
    http::types::{HttpVersion, Method},
};
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

/// Contract version the server implements.
pub const PAGI_VERSION: &str = "1.0";
/// Revision of the event schemas.
pub const PAGI_SPEC_VERSION: &str = "1.0";

/// Discriminant of a [`Scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Http,
    WebSocket,
    Sse,
    Lifespan,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeKind::Http => "http",
            ScopeKind::WebSocket => "websocket",
            ScopeKind::Sse => "sse",
            ScopeKind::Lifespan => "lifespan",
        })
    }
}

/// The per-process shared state container.
///
/// Created before lifespan startup; every scope in the same worker holds a
/// reference to the same container (checkable with [`State::same`]). Values
/// are type-erased; access is keyed and typed:
///
/// ```
/// let state = pagi::State::new();
/// state.insert("count", 0u64);
/// state.update("count", |count: &mut u64| *count += 1);
/// assert_eq!(state.get::<u64>("count"), Some(1));
/// ```
#[derive(Clone, Default)]
pub struct State {
    inner: Rc<RefCell<HashMap<String, Box<dyn Any>>>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value of any type.
    pub fn insert<T: 'static>(&self, key: impl Into<String>, value: T) {
        self.inner.borrow_mut().insert(key.into(), Box::new(value));
    }

    /// Clones the value out, if present with the requested type.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.inner
            .borrow()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Runs `f` against the stored value in place. Returns `None` when the
    /// key is absent or of another type.
    pub fn update<T: 'static, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner
            .borrow_mut()
            .get_mut(key)
            .and_then(|v| v.downcast_mut::<T>())
            .map(f)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.borrow_mut().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.borrow().contains_key(key)
    }

    /// Identity comparison: do both handles reference the same container?
    pub fn same(a: &State, b: &State) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("keys", &self.inner.borrow().len())
            .finish()
    }
}

/// Handle to the worker's cooperative scheduler, exposed as `scope.pagi`'s
/// loop reference. Applications thread timers, tasks and blocking work
/// through this so all concurrency stays on the one scheduler per process.
#[derive(Clone)]
pub struct SchedulerHandle {
    blocking: BlockingPool,
}

impl SchedulerHandle {
    pub(crate) fn new(blocking: BlockingPool) -> Self {
        Self { blocking }
    }

    /// Spawns a task on the worker's scheduler. The task may borrow
    /// non-`Send` data; everything runs on one thread.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(future)
    }

    /// Suspends the calling task.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Runs a synchronous closure on the blocking worker pool and awaits
    /// its result. This is the sanctioned way to call synchronous libraries
    /// without stalling the scheduler.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, BlockingError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.blocking.run(f).await
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SchedulerHandle")
    }
}

/// The `pagi` block common to every scope.
#[derive(Debug, Clone)]
pub struct PagiInfo {
    handle: SchedulerHandle,
}

impl PagiInfo {
    pub(crate) fn new(handle: SchedulerHandle) -> Self {
        Self { handle }
    }

    pub fn version(&self) -> &'static str {
        PAGI_VERSION
    }

    pub fn spec_version(&self) -> &'static str {
        PAGI_SPEC_VERSION
    }

    /// The scheduler handle (`pagi.loop`).
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.handle
    }
}

/// TLS session metadata for the `tls` extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub tls_version: String,
    pub cipher_suite: String,
    /// Digest-based name of the verified peer certificate. Present only
    /// when the listener's [`ClientAuth`](crate::limits::ClientAuth)
    /// policy requested a certificate and the client presented one.
    pub client_cert_name: Option<String>,
}

/// Server-advertised features for one scope. Applications must treat an
/// unlisted extension as unavailable.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    pub(crate) tls: Option<TlsInfo>,
    pub(crate) fullflush: bool,
}

impl Extensions {
    /// Present iff the connection runs over TLS.
    pub fn tls(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// Whether `http.response.fullflush` is accepted on this scope.
    pub fn fullflush(&self) -> bool {
        self.fullflush
    }
}

/// Fields shared by every scope kind.
#[derive(Debug, Clone)]
pub(crate) struct ScopeCommon {
    pub(crate) pagi: PagiInfo,
    pub(crate) state: State,
    pub(crate) extensions: Rc<Extensions>,
}

/// The parsed request line and headers, shared by HTTP, WebSocket and SSE
/// scopes.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// `"http"` / `"https"` (or `"ws"` / `"wss"` under a WebSocket scope).
    pub scheme: &'static str,
    pub http_version: HttpVersion,
    /// Percent-decoded path.
    pub path: String,
    /// The exact on-the-wire path bytes, undecoded, without the query.
    pub raw_path: Vec<u8>,
    /// Query bytes, without the leading `?`.
    pub query_string: Vec<u8>,
    /// Mount prefix; empty unless configured.
    pub root_path: String,
    /// Ordered headers, names lowercased, `cookie` values coalesced.
    pub headers: Headers,
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl RequestHead {
    /// First value of `name` (lowercase), per ordered linear search.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Folds repeated `cookie` headers into a single `"; "`-joined value in
/// first-occurrence position. Other repeated headers keep every entry.
pub(crate) fn coalesce_cookies(headers: &mut Headers) {
    let mut first: Option<usize> = None;
    let mut index = 0;
    while index < headers.len() {
        if headers[index].0 == b"cookie" {
            match first {
                None => first = Some(index),
                Some(at) => {
                    let (_, extra) = headers.remove(index);
                    let joined = &mut headers[at].1;
                    joined.extend_from_slice(b"; ");
                    joined.extend_from_slice(&extra);
                    continue;
                }
            }
        }
        index += 1;
    }
}

macro_rules! common_accessors {
    () => {
        pub fn pagi(&self) -> &PagiInfo {
            &self.common.pagi
        }

        pub fn state(&self) -> &State {
            &self.common.state
        }

        pub fn extensions(&self) -> &Extensions {
            &self.common.extensions
        }
    };
}

/// An HTTP request scope.
#[derive(Debug, Clone)]
pub struct HttpScope {
    pub(crate) head: RequestHead,
    pub(crate) common: ScopeCommon,
}

impl HttpScope {
    common_accessors!();

    pub fn head(&self) -> &RequestHead {
        &self.head
    }
}

/// A WebSocket connection scope.
#[derive(Debug, Clone)]
pub struct WsScope {
    pub(crate) head: RequestHead,
    /// Subprotocols the client offered, in order.
    pub(crate) subprotocols: Vec<String>,
    pub(crate) common: ScopeCommon,
}

impl WsScope {
    common_accessors!();

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }
}

/// A server-sent-events stream scope.
#[derive(Debug, Clone)]
pub struct SseScope {
    pub(crate) head: RequestHead,
    pub(crate) common: ScopeCommon,
}

impl SseScope {
    common_accessors!();

    pub fn head(&self) -> &RequestHead {
        &self.head
    }
}

/// The per-process startup/shutdown scope.
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub(crate) common: ScopeCommon,
}

impl LifespanScope {
    common_accessors!();
}

/// One interaction, tagged by kind.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WsScope),
    Sse(SseScope),
    Lifespan(LifespanScope),
}

impl Scope {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Http(_) => ScopeKind::Http,
            Scope::WebSocket(_) => ScopeKind::WebSocket,
            Scope::Sse(_) => ScopeKind::Sse,
            Scope::Lifespan(_) => ScopeKind::Lifespan,
        }
    }

    pub fn pagi(&self) -> &PagiInfo {
        &self.common().pagi
    }

    pub fn state(&self) -> &State {
        &self.common().state
    }

    pub fn extensions(&self) -> &Extensions {
        &self.common().extensions
    }

    /// The request head, for every kind that has one.
    pub fn head(&self) -> Option<&RequestHead> {
        match self {
            Scope::Http(s) => Some(&s.head),
            Scope::WebSocket(s) => Some(&s.head),
            Scope::Sse(s) => Some(&s.head),
            Scope::Lifespan(_) => None,
        }
    }

    fn common(&self) -> &ScopeCommon {
        match self {
            Scope::Http(s) => &s.common,
            Scope::WebSocket(s) => &s.common,
            Scope::Sse(s) => &s.common,
            Scope::Lifespan(s) => &s.common,
        }
    }
}


#[cfg(test)]
mod cookies {
    use super::*;
    use crate::events::header;

    #[test]
    fn coalesced_in_place() {
        let mut headers = vec![
            header("host", "x"),
            header("cookie", "a=1"),
            header("accept", "*/*"),
            header("cookie", "b=2"),
            header("cookie", "c=3"),
        ];
        coalesce_cookies(&mut headers);

        assert_eq!(
            headers,
            vec![
                header("host", "x"),
                header("cookie", "a=1; b=2; c=3"),
                header("accept", "*/*"),
            ]
        );
    }

    #[test]
    fn untouched_without_repeats() {
        let mut headers = vec![header("cookie", "a=1"), header("host", "x")];
        let expected = headers.clone();
        coalesce_cookies(&mut headers);
        assert_eq!(headers, expected);
    }
}
