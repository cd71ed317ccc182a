//! The scope/event adapter: everything between `send`/`receive` and the
//! transport.
//!
//! One adapter per application invocation. The receive half is a bounded
//! queue the connection driver feeds; the send half validates events
//! against the scope's event set and the response phase, then serializes
//! through a watermark-buffered writer. Both directions suspend for
//! backpressure: the queue when the application is slow, the writer when
//! the transport is.

use crate::{
    errors::SendError,
    events::{AppEvent, Body, Headers},
    http::{codec, types::HttpVersion},
    scope::ScopeKind,
    sse,
    ws::{codec as ws_codec, handshake::Handshake},
};
use std::{cell::Cell, cell::RefCell, path::Path, rc::Rc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::{mpsc, Mutex},
};
use tracing::{debug, error};

/// Anything a connection can run over: plain TCP or a TLS session.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Transport for T {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

/// Buffered transport writer with a high watermark.
///
/// Writes accumulate until the watermark, then the buffer drains to the
/// transport; the caller suspends for the duration. Transport failures
/// latch `closed`: every later write is a no-op, per the disconnect
/// contract.
pub(crate) struct WireWriter {
    inner: WriteHalf<BoxedTransport>,
    buffer: Vec<u8>,
    watermark: usize,
    closed: bool,
}

impl WireWriter {
    pub(crate) fn new(inner: WriteHalf<BoxedTransport>, watermark: usize) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(watermark.min(8 * 1024)),
            watermark,
            closed: false,
        }
    }

    pub(crate) async fn write(&mut self, bytes: &[u8]) {
        if self.closed {
            return;
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= self.watermark {
            self.flush().await;
        }
    }

    pub(crate) async fn flush(&mut self) {
        if self.closed {
            self.buffer.clear();
            return;
        }
        if self.buffer.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.buffer);
        if let Err(e) = self.inner.write_all(&pending).await {
            debug!("transport write failed: {e}");
            self.closed = true;
            return;
        }
        if let Err(e) = self.inner.flush().await {
            debug!("transport flush failed: {e}");
            self.closed = true;
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        self.flush().await;
        if !self.closed {
            let _ = self.inner.shutdown().await;
            self.closed = true;
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

pub(crate) type SharedWriter = Rc<Mutex<WireWriter>>;

/// Response progress shared between the sender and the connection driver.
#[derive(Default)]
pub(crate) struct ResponseFlags {
    /// Any response byte has been committed to the wire.
    pub(crate) started: Cell<bool>,
    /// The terminal event was accepted; the response is whole.
    pub(crate) complete: Cell<bool>,
    /// This response forces the connection closed afterwards.
    pub(crate) close: Cell<bool>,
    /// Code of the close frame the server sent, if any (WebSocket).
    pub(crate) ws_close_sent: Cell<Option<u16>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    HttpIdle,
    HttpStreaming { chunked: bool, trailers: bool },
    HttpAwaitTrailers { chunked: bool },
    WsHandshake,
    WsOpen,
    WsClosing,
    SseIdle,
    SseStreaming,
    Lifespan,
    Done,
}

pub(crate) enum SenderSink {
    Wire {
        writer: SharedWriter,
        flags: Rc<ResponseFlags>,
    },
    /// Lifespan replies go to the coordinator, not the wire.
    Coordinator(mpsc::UnboundedSender<AppEvent>),
}

/// The send half's engine; `app::Sender` is its public face.
pub(crate) struct SenderCore {
    kind: ScopeKind,
    sink: SenderSink,
    phase: RefCell<SendPhase>,
    version: HttpVersion,
    /// Whether the request allows the connection to persist; folded into
    /// response framing decisions.
    keep_alive: bool,
    fullflush: bool,
    handshake: Option<Handshake>,
    file_inline: usize,
}

impl SenderCore {
    pub(crate) fn http(
        writer: SharedWriter,
        flags: Rc<ResponseFlags>,
        version: HttpVersion,
        keep_alive: bool,
        fullflush: bool,
        file_inline: usize,
    ) -> Self {
        Self {
            kind: ScopeKind::Http,
            sink: SenderSink::Wire { writer, flags },
            phase: RefCell::new(SendPhase::HttpIdle),
            version,
            keep_alive,
            fullflush,
            handshake: None,
            file_inline,
        }
    }

    pub(crate) fn sse(
        writer: SharedWriter,
        flags: Rc<ResponseFlags>,
        version: HttpVersion,
        fullflush: bool,
    ) -> Self {
        Self {
            kind: ScopeKind::Sse,
            sink: SenderSink::Wire { writer, flags },
            phase: RefCell::new(SendPhase::SseIdle),
            version,
            keep_alive: false,
            fullflush,
            handshake: None,
            file_inline: 0,
        }
    }

    pub(crate) fn websocket(
        writer: SharedWriter,
        flags: Rc<ResponseFlags>,
        handshake: Handshake,
    ) -> Self {
        Self {
            kind: ScopeKind::WebSocket,
            sink: SenderSink::Wire { writer, flags },
            phase: RefCell::new(SendPhase::WsHandshake),
            version: HttpVersion::Http11,
            keep_alive: false,
            fullflush: false,
            handshake: Some(handshake),
            file_inline: 0,
        }
    }

    pub(crate) fn lifespan(tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            kind: ScopeKind::Lifespan,
            sink: SenderSink::Coordinator(tx),
            phase: RefCell::new(SendPhase::Lifespan),
            version: HttpVersion::Http11,
            keep_alive: false,
            fullflush: false,
            handshake: None,
            file_inline: 0,
        }
    }

    pub(crate) async fn send(&self, event: AppEvent) -> Result<(), SendError> {
        if !self.event_in_scope(&event) {
            return Err(SendError::Unsupported {
                event: event.name(),
                scope: self.kind,
            });
        }
        match self.kind {
            ScopeKind::Http => self.send_http(event).await,
            ScopeKind::Sse => self.send_sse(event).await,
            ScopeKind::WebSocket => self.send_ws(event).await,
            ScopeKind::Lifespan => self.send_lifespan(event),
        }
    }

    /// The fail-fast check: does the event belong to this scope's set at
    /// all? Ordering is judged later (and violations there are ignored).
    fn event_in_scope(&self, event: &AppEvent) -> bool {
        use AppEvent::*;
        match self.kind {
            ScopeKind::Http => matches!(
                event,
                HttpResponseStart { .. }
                    | HttpResponseBody { .. }
                    | HttpResponseTrailers { .. }
                    | HttpFullflush
            ),
            ScopeKind::Sse => matches!(event, SseStart { .. } | SseSend(_) | HttpFullflush),
            ScopeKind::WebSocket => {
                matches!(event, WsAccept { .. } | WsSend(_) | WsClose { .. })
            }
            ScopeKind::Lifespan => matches!(
                event,
                StartupComplete | StartupFailed { .. } | ShutdownComplete
            ),
        }
    }

    fn wire(&self) -> (&SharedWriter, &Rc<ResponseFlags>) {
        match &self.sink {
            SenderSink::Wire { writer, flags } => (writer, flags),
            SenderSink::Coordinator(_) => unreachable!("wire send on a lifespan scope"),
        }
    }

    async fn send_http(&self, event: AppEvent) -> Result<(), SendError> {
        let (writer, flags) = self.wire();
        let phase = *self.phase.borrow();
        match (phase, event) {
            (SendPhase::HttpIdle, AppEvent::HttpResponseStart { status, headers, trailers }) => {
                check_headers(&headers)?;
                let has_length = headers.iter().any(|(n, _)| n == b"content-length");
                // Without a declared length: chunk on 1.1, close-delimit on 1.0.
                let chunked = !has_length && self.version == HttpVersion::Http11;
                let close = !self.keep_alive || (!has_length && !chunked);
                if close {
                    flags.close.set(true);
                }
                let bytes = codec::serialize_start(status, &headers, chunked, close);
                flags.started.set(true);
                self.phase
                    .replace(SendPhase::HttpStreaming { chunked, trailers });
                writer.lock().await.write(&bytes).await;
                Ok(())
            }
            (
                SendPhase::HttpStreaming { chunked, trailers },
                AppEvent::HttpResponseBody { body, more },
            ) => match body {
                Body::Bytes(data) => {
                    let bytes =
                        codec::serialize_body(&data, more, chunked, trailers && !more);
                    writer.lock().await.write(&bytes).await;
                    if !more {
                        if trailers {
                            self.phase.replace(SendPhase::HttpAwaitTrailers { chunked });
                        } else {
                            self.finish_http(writer, flags).await;
                        }
                    }
                    Ok(())
                }
                Body::File {
                    path,
                    offset,
                    length,
                } => {
                    // `more` is ignored: a file body is terminal.
                    self.stream_file(writer, &path, offset, length, chunked, trailers)
                        .await;
                    if trailers {
                        self.phase.replace(SendPhase::HttpAwaitTrailers { chunked });
                    } else {
                        self.finish_http(writer, flags).await;
                    }
                    Ok(())
                }
            },
            (
                SendPhase::HttpAwaitTrailers { chunked },
                AppEvent::HttpResponseTrailers { headers },
            ) => {
                check_headers(&headers)?;
                if chunked {
                    let bytes = codec::serialize_trailers(&headers);
                    writer.lock().await.write(&bytes).await;
                }
                self.finish_http(writer, flags).await;
                Ok(())
            }
            (_, AppEvent::HttpFullflush) => self.fullflush(writer).await,
            (_, other) => {
                // Out-of-order within the HTTP set: ignored by contract.
                debug!(event = other.name(), ?phase, "ignoring out-of-order event");
                Ok(())
            }
        }
    }

    async fn finish_http(&self, writer: &SharedWriter, flags: &Rc<ResponseFlags>) {
        flags.complete.set(true);
        self.phase.replace(SendPhase::Done);
        writer.lock().await.flush().await;
    }

    /// Streams a file body. Small files are read whole; larger ones go out
    /// in slices through the scheduler's async fs layer. Read failures
    /// after the response start are unrecoverable on the wire: the
    /// connection is cut so the peer sees truncation, not silence.
    async fn stream_file(
        &self,
        writer: &SharedWriter,
        path: &Path,
        offset: Option<u64>,
        length: Option<u64>,
        chunked: bool,
        trailers: bool,
    ) {
        let result = self
            .stream_file_inner(writer, path, offset, length, chunked, trailers)
            .await;
        if let Err(e) = result {
            error!("file body {} failed: {e}", path.display());
            writer.lock().await.mark_closed();
        }
    }

    async fn stream_file_inner(
        &self,
        writer: &SharedWriter,
        path: &Path,
        offset: Option<u64>,
        length: Option<u64>,
        chunked: bool,
        trailers: bool,
    ) -> std::io::Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        if let Some(offset) = offset {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        let metadata_len = file.metadata().await?.len().saturating_sub(offset.unwrap_or(0));
        let to_send = length.unwrap_or(metadata_len).min(metadata_len);

        if to_send <= self.file_inline as u64 {
            let mut data = Vec::with_capacity(to_send as usize);
            file.take(to_send).read_to_end(&mut data).await?;
            let bytes = codec::serialize_body(&data, false, chunked, trailers);
            writer.lock().await.write(&bytes).await;
            return Ok(());
        }

        let mut remaining = to_send;
        let mut slice = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = slice.len().min(remaining as usize);
            let n = file.read(&mut slice[..want]).await?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            let bytes = codec::serialize_body(&slice[..n], true, chunked, false);
            writer.lock().await.write(&bytes).await;
        }
        let terminator = codec::serialize_body(&[], false, chunked, trailers);
        writer.lock().await.write(&terminator).await;
        Ok(())
    }

    async fn send_sse(&self, event: AppEvent) -> Result<(), SendError> {
        let (writer, flags) = self.wire();
        let phase = *self.phase.borrow();
        match (phase, event) {
            (SendPhase::SseIdle, AppEvent::SseStart { status, mut headers }) => {
                check_headers(&headers)?;
                if !headers.iter().any(|(n, _)| n == b"content-type") {
                    headers.push((
                        b"content-type".to_vec(),
                        b"text/event-stream; charset=utf-8".to_vec(),
                    ));
                }
                // Event streams are close-delimited; chunk framing would
                // leak into the event text.
                flags.close.set(true);
                flags.started.set(true);
                self.phase.replace(SendPhase::SseStreaming);
                let bytes = codec::serialize_start(status, &headers, false, true);
                let mut writer = writer.lock().await;
                writer.write(&bytes).await;
                writer.flush().await;
                Ok(())
            }
            (SendPhase::SseStreaming, AppEvent::SseSend(event)) => {
                let bytes = sse::format_event(&event);
                let mut writer = writer.lock().await;
                writer.write(&bytes).await;
                writer.flush().await;
                Ok(())
            }
            (_, AppEvent::HttpFullflush) => self.fullflush(writer).await,
            (_, other) => {
                debug!(event = other.name(), ?phase, "ignoring out-of-order event");
                Ok(())
            }
        }
    }

    async fn send_ws(&self, event: AppEvent) -> Result<(), SendError> {
        let (writer, flags) = self.wire();
        let phase = *self.phase.borrow();
        match (phase, event) {
            (SendPhase::WsHandshake, AppEvent::WsAccept { subprotocol, headers }) => {
                check_headers(&headers)?;
                let handshake = self.handshake.as_ref().expect("websocket sender");
                let bytes = crate::ws::handshake::serialize_response(
                    &handshake.accept,
                    subprotocol.as_deref(),
                    &headers,
                );
                flags.started.set(true);
                self.phase.replace(SendPhase::WsOpen);
                let mut writer = writer.lock().await;
                writer.write(&bytes).await;
                writer.flush().await;
                Ok(())
            }
            (SendPhase::WsHandshake, AppEvent::WsClose { .. }) => {
                // Closing before accepting rejects the upgrade.
                flags.started.set(true);
                flags.close.set(true);
                flags.complete.set(true);
                self.phase.replace(SendPhase::Done);
                let mut writer = writer.lock().await;
                writer
                    .write(b"HTTP/1.1 403 Forbidden\r\nconnection: close\r\ncontent-length: 0\r\n\r\n")
                    .await;
                writer.flush().await;
                Ok(())
            }
            (SendPhase::WsOpen, AppEvent::WsSend(message)) => {
                let bytes = ws_codec::encode_message(&message);
                writer.lock().await.write(&bytes).await;
                Ok(())
            }
            (SendPhase::WsOpen, AppEvent::WsClose { code, reason }) => {
                let bytes = ws_codec::encode_close(code, &reason);
                flags.ws_close_sent.set(Some(code));
                self.phase.replace(SendPhase::WsClosing);
                let mut writer = writer.lock().await;
                writer.write(&bytes).await;
                writer.flush().await;
                Ok(())
            }
            (_, other) => {
                debug!(event = other.name(), ?phase, "ignoring out-of-order event");
                Ok(())
            }
        }
    }

    fn send_lifespan(&self, event: AppEvent) -> Result<(), SendError> {
        let SenderSink::Coordinator(tx) = &self.sink else {
            unreachable!("lifespan sender without a coordinator sink");
        };
        // The coordinator may already have moved on; that is its business.
        let _ = tx.send(event);
        Ok(())
    }

    async fn fullflush(&self, writer: &SharedWriter) -> Result<(), SendError> {
        if !self.fullflush {
            return Err(SendError::ExtensionUnavailable("fullflush"));
        }
        writer.lock().await.flush().await;
        Ok(())
    }
}

/// Header values travel verbatim onto the wire; CR/LF would split the
/// response.
fn check_headers(headers: &Headers) -> Result<(), SendError> {
    for (name, value) in headers {
        if name.is_empty()
            || name.iter().any(|&b| b == b'\r' || b == b'\n' || b == b' ')
            || value.iter().any(|&b| b == b'\r' || b == b'\n')
        {
            return Err(SendError::InvalidHeader);
        }
    }
    Ok(())
}
