//! The application contract: a callable taking `(scope, receive, send)`.

use crate::{
    errors::SendError,
    events::{AppEvent, ServerEvent},
    scope::Scope,
    server::adapter::SenderCore,
};
use std::{future::Future, rc::Rc};
use tokio::sync::mpsc;

/// Error type an application may bubble out of [`Application::call`]. A
/// returned error (or a panic) is an application failure: the server logs
/// it and answers 500 when no response has started, else closes the
/// connection.
pub type AppError = Box<dyn std::error::Error>;

/// A PAGI application.
///
/// Invoked once per scope. The implementation drives [`Receiver::receive`]
/// and [`Sender::send`] until it has produced a terminal response (or
/// closed the WebSocket/SSE stream), then returns.
///
/// Applications run on the worker's single-threaded scheduler: futures may
/// hold non-`Send` data, and every `await` is a cooperative suspension
/// point.
///
/// # Examples
///
/// ```
/// use pagi::{AppError, Application, AppEvent, Body, Receiver, Scope, Sender, header};
///
/// struct Hello;
///
/// impl Application for Hello {
///     async fn call(
///         &self,
///         scope: Scope,
///         mut receiver: Receiver,
///         sender: Sender,
///     ) -> Result<(), AppError> {
///         let Scope::Http(_) = scope else { return Ok(()) };
///
///         // Drain the request body.
///         while let Some(event) = receiver.receive().await {
///             match event {
///                 pagi::ServerEvent::HttpRequest { more: false, .. } => break,
///                 pagi::ServerEvent::HttpDisconnect => return Ok(()),
///                 _ => {}
///             }
///         }
///
///         sender
///             .send(AppEvent::HttpResponseStart {
///                 status: 200,
///                 headers: vec![header("content-type", "text/plain")],
///                 trailers: false,
///             })
///             .await?;
///         sender
///             .send(AppEvent::HttpResponseBody {
///                 body: Body::from("Hi"),
///                 more: false,
///             })
///             .await?;
///         Ok(())
///     }
/// }
/// ```
pub trait Application: 'static {
    fn call(
        &self,
        scope: Scope,
        receiver: Receiver,
        sender: Sender,
    ) -> impl Future<Output = Result<(), AppError>>;
}

/// The receive half of the contract.
///
/// Yields events in transport order. Returns `None` once the connection is
/// gone and every queued event (including the disconnect) was delivered.
pub struct Receiver {
    rx: mpsc::Receiver<ServerEvent>,
}

impl Receiver {
    pub(crate) fn new(rx: mpsc::Receiver<ServerEvent>) -> Self {
        Self { rx }
    }

    /// Next event for this scope. Suspends while the queue is empty;
    /// resumes on new transport data or disconnect.
    pub async fn receive(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

/// The send half of the contract.
///
/// Enforces per-scope ordering: a valid event arriving out of order is
/// ignored, an event from another scope's set is a [`SendError`], and
/// everything after a disconnect is a no-op. Suspends when the transport
/// write buffer is over its watermark.
pub struct Sender {
    pub(crate) core: Rc<SenderCore>,
}

impl Sender {
    /// Validates `event` against the scope's event set and current response
    /// phase, then serializes it to the wire.
    pub async fn send(&self, event: AppEvent) -> Result<(), SendError> {
        self.core.send(event).await
    }
}
