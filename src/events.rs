//! The typed events exchanged between the server and an application.
//!
//! One closed set per direction. The wire never carries these; they exist
//! only across the `(scope, receive, send)` boundary. Event names (used in
//! logs and errors) follow the dotted convention of the application
//! contract: `http.request`, `websocket.send`, and so on.

/// Ordered header sequence: lowercase name bytes paired with value bytes.
pub type Headers = Vec<(Vec<u8>, Vec<u8>)>;

/// Convenience constructor for one header pair.
#[inline]
pub fn header(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> (Vec<u8>, Vec<u8>) {
    (name.as_ref().to_vec(), value.as_ref().to_vec())
}

/// Events the application pulls out of [`Receiver::receive`](crate::app::Receiver::receive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// `http.request`: one slice of the request body. `more` promises a
    /// further slice; the terminal slice has `more: false`.
    HttpRequest { body: Vec<u8>, more: bool },
    /// `http.disconnect`: the client went away. Delivered at most once;
    /// nothing follows it.
    HttpDisconnect,

    /// `websocket.connect`: handed to the application before it may accept.
    WsConnect,
    /// `websocket.receive`: one complete (defragmented) message.
    WsReceive(WsMessage),
    /// `websocket.disconnect` with the close code the peer supplied (or
    /// 1005 when the transport dropped without a close frame).
    WsDisconnect { code: u16 },

    /// `sse.disconnect`: the event-stream client went away.
    SseDisconnect,

    /// `lifespan.startup`: run per-process initialization now.
    LifespanStartup,
    /// `lifespan.shutdown`: the worker is draining.
    LifespanShutdown,
}

impl ServerEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HttpRequest { .. } => "http.request",
            Self::HttpDisconnect => "http.disconnect",
            Self::WsConnect => "websocket.connect",
            Self::WsReceive(_) => "websocket.receive",
            Self::WsDisconnect { .. } => "websocket.disconnect",
            Self::SseDisconnect => "sse.disconnect",
            Self::LifespanStartup => "lifespan.startup",
            Self::LifespanShutdown => "lifespan.shutdown",
        }
    }
}

/// A complete WebSocket message. Text is guaranteed valid UTF-8 by the
/// codec; invalid sequences never reach the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Events the application pushes through [`Sender::send`](crate::app::Sender::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// `http.response.start`: status and headers. When no `content-length`
    /// header is present the body is chunk-framed automatically. Setting
    /// `trailers` promises an `http.response.trailers` event after the
    /// final body slice.
    HttpResponseStart {
        status: u16,
        headers: Headers,
        trailers: bool,
    },
    /// `http.response.body`: one piece of the body; `more: false` ends the
    /// response (unless trailers were declared).
    HttpResponseBody { body: Body, more: bool },
    /// `http.response.trailers`: terminal trailer block for a start that
    /// declared `trailers: true`.
    HttpResponseTrailers { headers: Headers },
    /// `http.response.fullflush`: force the buffered response bytes onto
    /// the wire. Only valid when the `fullflush` extension is advertised.
    HttpFullflush,

    /// `websocket.accept`: complete the handshake, optionally choosing a
    /// subprotocol and adding response headers.
    WsAccept {
        subprotocol: Option<String>,
        headers: Headers,
    },
    /// `websocket.send`: one outgoing message.
    WsSend(WsMessage),
    /// `websocket.close`: begin the closing handshake.
    WsClose { code: u16, reason: String },

    /// `sse.start`: status and headers for the event stream. The
    /// `content-type` defaults to `text/event-stream; charset=utf-8`.
    SseStart { status: u16, headers: Headers },
    /// `sse.send`: one formatted event.
    SseSend(SseEvent),

    /// `lifespan.startup.complete`
    StartupComplete,
    /// `lifespan.startup.failed`
    StartupFailed { message: String },
    /// `lifespan.shutdown.complete`
    ShutdownComplete,
}

impl AppEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HttpResponseStart { .. } => "http.response.start",
            Self::HttpResponseBody { .. } => "http.response.body",
            Self::HttpResponseTrailers { .. } => "http.response.trailers",
            Self::HttpFullflush => "http.response.fullflush",
            Self::WsAccept { .. } => "websocket.accept",
            Self::WsSend(_) => "websocket.send",
            Self::WsClose { .. } => "websocket.close",
            Self::SseStart { .. } => "sse.start",
            Self::SseSend(_) => "sse.send",
            Self::StartupComplete => "lifespan.startup.complete",
            Self::StartupFailed { .. } => "lifespan.startup.failed",
            Self::ShutdownComplete => "lifespan.shutdown.complete",
        }
    }
}

/// Body payload of an `http.response.body` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// In-memory bytes.
    Bytes(Vec<u8>),
    /// Serve from a file. `more` on the carrying event is ignored: a file
    /// body is always terminal.
    File {
        path: std::path::PathBuf,
        offset: Option<u64>,
        length: Option<u64>,
    },
}

impl Body {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Body::Bytes(data.into())
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Bytes(data)
    }
}

impl From<&[u8]> for Body {
    fn from(data: &[u8]) -> Self {
        Body::Bytes(data.to_vec())
    }
}

impl From<&str> for Body {
    fn from(data: &str) -> Self {
        Body::Bytes(data.as_bytes().to_vec())
    }
}

/// One server-sent event, before text framing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }
}
