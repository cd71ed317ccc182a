//! Adapter for synchronous request/response applications.
//!
//! [`Bridge`] wraps a [`SyncGateway`] — a plain blocking function from
//! request to response — as an [`Application`]. The request body is
//! buffered, the gateway runs on the blocking pool (never on the
//! scheduler), and the returned body iterator is polled to exhaustion,
//! one blocking hop per piece, so streaming responses work.

use crate::{
    app::{AppError, Application, Receiver, Sender},
    events::{AppEvent, Body, Headers, ServerEvent},
    scope::Scope,
};
use std::sync::Arc;

/// The synchronous request handed to a gateway.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    /// Uppercase method token.
    pub method: String,
    /// Percent-decoded path.
    pub path: String,
    /// Raw query bytes.
    pub query_string: Vec<u8>,
    /// Ordered request headers, names lowercased.
    pub headers: Headers,
    /// The entire request body.
    pub body: Vec<u8>,
}

/// The synchronous response a gateway returns. The body may stream: it is
/// pulled piece by piece until `None`.
pub struct BridgeResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Box<dyn Iterator<Item = Vec<u8>> + Send>,
}

impl BridgeResponse {
    /// Whole-body convenience constructor.
    pub fn new(status: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body: Box::new(std::iter::once(body)),
        }
    }
}

/// A synchronous request/response application.
pub trait SyncGateway: Send + Sync + 'static {
    fn call(
        &self,
        request: BridgeRequest,
    ) -> Result<BridgeResponse, Box<dyn std::error::Error + Send + Sync>>;
}

/// Presents a [`SyncGateway`] under the HTTP scope.
pub struct Bridge<G: SyncGateway> {
    gateway: Arc<G>,
}

impl<G: SyncGateway> Bridge<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }
}

impl<G: SyncGateway> Application for Bridge<G> {
    async fn call(
        &self,
        scope: Scope,
        mut receiver: Receiver,
        sender: Sender,
    ) -> Result<(), AppError> {
        let Scope::Http(http) = &scope else {
            // Only the HTTP scope maps onto a synchronous gateway.
            return Ok(());
        };
        let scheduler = http.pagi().scheduler().clone();

        // Buffer the body into a readable whole.
        let mut body = Vec::new();
        loop {
            match receiver.receive().await {
                Some(ServerEvent::HttpRequest { body: piece, more }) => {
                    body.extend_from_slice(&piece);
                    if !more {
                        break;
                    }
                }
                Some(ServerEvent::HttpDisconnect) | None => return Ok(()),
                Some(other) => {
                    return Err(format!("unexpected event {}", other.name()).into());
                }
            }
        }

        let head = http.head();
        let request = BridgeRequest {
            method: head.method.as_str().to_owned(),
            path: head.path.clone(),
            query_string: head.query_string.clone(),
            headers: head.headers.clone(),
            body,
        };

        let gateway = self.gateway.clone();
        let response = scheduler
            .run_blocking(move || gateway.call(request))
            .await?
            .map_err(|e| -> AppError { e })?;

        sender
            .send(AppEvent::HttpResponseStart {
                status: response.status,
                headers: response.headers,
                trailers: false,
            })
            .await?;

        // Poll the streaming body, one blocking hop per piece.
        let mut iter = response.body;
        loop {
            let (piece, rest) = scheduler
                .run_blocking(move || {
                    let piece = iter.next();
                    (piece, iter)
                })
                .await?;
            iter = rest;
            match piece {
                Some(piece) => {
                    sender
                        .send(AppEvent::HttpResponseBody {
                            body: Body::Bytes(piece),
                            more: true,
                        })
                        .await?;
                }
                None => break,
            }
        }
        sender
            .send(AppEvent::HttpResponseBody {
                body: Body::Bytes(Vec::new()),
                more: false,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod gateway {
    use super::*;

    struct UppercaseGateway;

    impl SyncGateway for UppercaseGateway {
        fn call(
            &self,
            request: BridgeRequest,
        ) -> Result<BridgeResponse, Box<dyn std::error::Error + Send + Sync>> {
            assert_eq!(request.method, "POST");
            let upper = request.body.to_ascii_uppercase();
            Ok(BridgeResponse::new(
                200,
                vec![crate::events::header(
                    "content-length",
                    upper.len().to_string(),
                )],
                upper,
            ))
        }
    }

    struct StreamingGateway;

    impl SyncGateway for StreamingGateway {
        fn call(
            &self,
            _request: BridgeRequest,
        ) -> Result<BridgeResponse, Box<dyn std::error::Error + Send + Sync>> {
            Ok(BridgeResponse {
                status: 200,
                headers: vec![],
                body: Box::new([b"one".to_vec(), b"two".to_vec()].into_iter()),
            })
        }
    }

    struct FailingGateway;

    impl SyncGateway for FailingGateway {
        fn call(
            &self,
            _request: BridgeRequest,
        ) -> Result<BridgeResponse, Box<dyn std::error::Error + Send + Sync>> {
            Err("gateway refused".into())
        }
    }

    // The bridge is exercised end-to-end (through a real connection
    // driver) in the demos; here the gateway contract itself is checked.
    #[test]
    fn whole_body_response() {
        let response = UppercaseGateway
            .call(BridgeRequest {
                method: "POST".into(),
                path: "/x".into(),
                query_string: Vec::new(),
                headers: vec![],
                body: b"hello".to_vec(),
            })
            .unwrap();
        assert_eq!(response.status, 200);
        let body: Vec<u8> = response.body.flatten().collect();
        assert_eq!(body, b"HELLO");
    }

    #[test]
    fn streaming_body_polls_to_exhaustion() {
        let response = StreamingGateway
            .call(BridgeRequest {
                method: "GET".into(),
                path: "/".into(),
                query_string: Vec::new(),
                headers: vec![],
                body: Vec::new(),
            })
            .unwrap();
        let pieces: Vec<Vec<u8>> = response.body.collect();
        assert_eq!(pieces, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn failure_becomes_an_error() {
        let result = FailingGateway.call(BridgeRequest {
            method: "GET".into(),
            path: "/".into(),
            query_string: Vec::new(),
            headers: vec![],
            body: Vec::new(),
        });
        assert!(result.is_err());
    }
}
