use crate::scope::ScopeKind;
use std::io;
use thiserror::Error;

/// Wire-level faults. Fatal to the connection that produced them; mapped to
/// a minimal canned response when nothing has been written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidTarget,
    #[error("invalid HTTP version")]
    InvalidVersion,
    #[error("HTTP version not supported")]
    UnsupportedVersion,

    #[error("invalid header line")]
    InvalidHeader,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("header block too large")]
    HeaderTooLarge,
    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("invalid chunked framing")]
    InvalidChunk,
    #[error("invalid WebSocket handshake")]
    BadHandshake,
}

macro_rules! canned_responses {
    ($($name:ident: $status:literal, $len:literal => $body:literal;)*) => {
        /// Minimal close-delimited response for a request that never
        /// reached the application.
        pub(crate) const fn as_http(&self) -> &'static [u8] {
            match self { $(
                Self::$name => concat!(
                    "HTTP/1.1 ", $status, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: text/plain\r\n",
                    "\r\n",
                    $body
                ),
            )* }.as_bytes()
        }
    };
}

impl ProtocolError {
    canned_responses! {
        InvalidMethod: "400 Bad Request", "16" => "invalid method\r\n";
        InvalidTarget: "400 Bad Request", "16" => "invalid target\r\n";
        InvalidVersion: "400 Bad Request", "17" => "invalid version\r\n";
        UnsupportedVersion: "505 HTTP Version Not Supported", "21" => "unsupported version\r\n";

        InvalidHeader: "400 Bad Request", "16" => "invalid header\r\n";
        TooManyHeaders: "431 Request Header Fields Too Large", "18" => "too many headers\r\n";
        HeaderTooLarge: "431 Request Header Fields Too Large", "19" => "headers too large\r\n";
        InvalidContentLength: "400 Bad Request", "24" => "invalid content-length\r\n";

        InvalidChunk: "400 Bad Request", "20" => "invalid chunk size\r\n";
        BadHandshake: "400 Bad Request", "19" => "invalid handshake\r\n";
    }

    pub const fn status(&self) -> u16 {
        match self {
            Self::TooManyHeaders | Self::HeaderTooLarge => 431,
            Self::UnsupportedVersion => 505,
            _ => 400,
        }
    }
}

/// Synthesized when the application fails before producing a response start.
pub(crate) const RESPONSE_500: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
connection: close\r\n\
content-length: 23\r\n\
content-type: text/plain\r\n\
\r\n\
internal server error\r\n";

/// WebSocket protocol faults carry the RFC 6455 close code the peer is told
/// about before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WsFault {
    #[error("WebSocket protocol violation")]
    Protocol,
    #[error("invalid UTF-8 in text frame")]
    BadUtf8,
    #[error("message too large")]
    TooLarge,
}

impl WsFault {
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::Protocol => 1002,
            Self::BadUtf8 => 1007,
            Self::TooLarge => 1009,
        }
    }
}

/// Returned by [`Sender::send`](crate::app::Sender::send) when the event is
/// not part of the current scope's event set. Ordering violations within the
/// correct set are ignored, not errored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("event `{event}` is not valid for a `{scope}` scope")]
    Unsupported {
        event: &'static str,
        scope: ScopeKind,
    },
    #[error("header names and values must not contain CR or LF")]
    InvalidHeader,
    #[error("the `{0}` extension was not advertised for this scope")]
    ExtensionUnavailable(&'static str),
}

/// Failure of the per-worker lifespan rendezvous. Escalates to a nonzero
/// worker exit.
#[derive(Debug, Error)]
pub enum LifespanFailure {
    #[error("application startup failed: {0}")]
    Startup(String),
    #[error("application lifespan task failed: {0}")]
    Task(String),
}

/// Errors surfaced from [`Server::run`](crate::Server::run).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to load TLS material: {0}")]
    Tls(String),
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),
    #[error("scheduler construction failed: {0}")]
    Runtime(#[source] io::Error),
    #[error("worker startup kept failing; giving up")]
    WorkersFailing,
    #[error(transparent)]
    Lifespan(#[from] LifespanFailure),
    #[error("PAGI_WORKER_FD is set but unreadable")]
    BadWorkerHandoff,
}

/// Error awaiting a [`run_blocking`](crate::scope::SchedulerHandle::run_blocking)
/// job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockingError {
    #[error("blocking pool is shut down")]
    Closed,
    #[error("blocking job panicked")]
    Panicked,
}

#[cfg(test)]
mod canned {
    use super::*;

    #[test]
    fn status_mapping() {
        #[rustfmt::skip]
        let cases = [
            (ProtocolError::InvalidMethod,        400),
            (ProtocolError::InvalidTarget,        400),
            (ProtocolError::InvalidVersion,       400),
            (ProtocolError::UnsupportedVersion,   505),
            (ProtocolError::InvalidHeader,        400),
            (ProtocolError::TooManyHeaders,       431),
            (ProtocolError::HeaderTooLarge,       431),
            (ProtocolError::InvalidContentLength, 400),
            (ProtocolError::InvalidChunk,         400),
            (ProtocolError::BadHandshake,         400),
        ];

        for (error, status) in cases {
            assert_eq!(error.status(), status);
            let head = format!("HTTP/1.1 {status}");
            let text = std::str::from_utf8(error.as_http()).unwrap();
            assert!(text.starts_with(&head), "{text}");
        }
    }

    #[test]
    fn canned_content_length_matches_body() {
        for error in [
            ProtocolError::InvalidMethod,
            ProtocolError::InvalidTarget,
            ProtocolError::InvalidVersion,
            ProtocolError::UnsupportedVersion,
            ProtocolError::InvalidHeader,
            ProtocolError::TooManyHeaders,
            ProtocolError::HeaderTooLarge,
            ProtocolError::InvalidContentLength,
            ProtocolError::InvalidChunk,
            ProtocolError::BadHandshake,
        ] {
            let text = std::str::from_utf8(error.as_http()).unwrap();
            let (head, body) = text.split_once("\r\n\r\n").unwrap();
            let declared: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length: "))
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(declared, body.len(), "wrong length for {head}");
        }
    }

    #[test]
    fn ws_fault_codes() {
        assert_eq!(WsFault::Protocol.close_code(), 1002);
        assert_eq!(WsFault::BadUtf8.close_code(), 1007);
        assert_eq!(WsFault::TooLarge.close_code(), 1009);
    }
}
