//! Per-connection driver: owns the transport, frames requests, pumps body
//! and disconnect events to the adapter, and polices keep-alive.

use crate::{
    app::{Application, Receiver, Sender},
    errors::{ProtocolError, RESPONSE_500},
    events::ServerEvent,
    http::codec::{self, ChunkDecoder, Chunked, RequestRecord},
    limits::AllLimits,
    scope::{
        coalesce_cookies, Extensions, HttpScope, PagiInfo, RequestHead, Scope, ScopeCommon,
        SchedulerHandle, SseScope, State, TlsInfo, WsScope,
    },
    sse,
    ws::{
        codec::{Assembled, FrameDecoder, MessageAssembler, Opcode},
        handshake,
    },
};
use bytes::BytesMut;
use std::{cell::Cell, net::SocketAddr, rc::Rc, time::Duration};
use tokio::{
    io::{AsyncReadExt, ReadHalf},
    sync::{mpsc, Notify},
    time::timeout,
};
use tracing::{debug, error};

use super::adapter::{
    BoxedTransport, ResponseFlags, SenderCore, SharedWriter, Transport, WireWriter,
};

/// Worker-wide context every connection shares: limits, the process state
/// container, the scheduler handle, and drain accounting.
pub(crate) struct ConnEnv {
    pub(crate) limits: AllLimits,
    pub(crate) state: State,
    pub(crate) scheduler: SchedulerHandle,
    /// Set when the worker stops taking new work; persistent connections
    /// close after their in-flight response.
    pub(crate) draining: Cell<bool>,
    pub(crate) served: Cell<usize>,
    pub(crate) live: Cell<usize>,
    /// Pinged whenever `live` drops or draining starts.
    pub(crate) idle: Notify,
}

impl ConnEnv {
    pub(crate) fn new(limits: AllLimits, state: State, scheduler: SchedulerHandle) -> Self {
        Self {
            limits,
            state,
            scheduler,
            draining: Cell::new(false),
            served: Cell::new(0),
            live: Cell::new(0),
            idle: Notify::new(),
        }
    }

    /// Request accounting; flips the worker into draining at the
    /// configured recycle point.
    fn note_request(&self) {
        self.served.set(self.served.get() + 1);
        if let Some(max) = self.limits.worker.max_requests {
            if self.served.get() >= max && !self.draining.get() {
                debug!(served = self.served.get(), "max_requests reached; draining worker");
                self.draining.set(true);
                self.idle.notify_waiters();
            }
        }
    }
}

enum HeadOutcome {
    Request(RequestRecord),
    /// Clean end of the connection (EOF between requests, or idle timeout).
    Quiet,
    Fault(ProtocolError),
}

enum PumpEnd {
    /// The transport is gone; the disconnect event was queued.
    Disconnected,
}

/// One accepted transport. Created by the acceptor, consumed by `run`.
pub(crate) struct Connection<A: Application> {
    app: Rc<A>,
    env: Rc<ConnEnv>,
    reader: ReadHalf<BoxedTransport>,
    writer: SharedWriter,
    buf: Vec<u8>,
    client: SocketAddr,
    server: SocketAddr,
    tls: Option<TlsInfo>,
}

impl<A: Application> Connection<A> {
    pub(crate) fn new(
        transport: BoxedTransport,
        app: Rc<A>,
        env: Rc<ConnEnv>,
        client: SocketAddr,
        server: SocketAddr,
        tls: Option<TlsInfo>,
    ) -> Self {
        let (reader, write_half) = tokio::io::split(transport);
        let writer = Rc::new(tokio::sync::Mutex::new(WireWriter::new(
            write_half,
            env.limits.conn.write_watermark,
        )));
        Self {
            app,
            env,
            reader,
            writer,
            buf: Vec::with_capacity(4 * 1024),
            client,
            server,
            tls,
        }
    }

    /// Drives the connection until it closes. Persistent connections loop
    /// back for the next head; everything else ends the task.
    pub(crate) async fn run(mut self) {
        loop {
            match self.read_head().await {
                HeadOutcome::Quiet => break,
                HeadOutcome::Fault(fault) => {
                    debug!(client = %self.client, %fault, "protocol error");
                    let mut writer = self.writer.lock().await;
                    writer.write(fault.as_http()).await;
                    writer.flush().await;
                    break;
                }
                HeadOutcome::Request(record) => {
                    self.env.note_request();
                    if handshake::is_upgrade(&record) {
                        self.run_websocket(record).await;
                        break;
                    }
                    if !self.run_http(record).await {
                        break;
                    }
                }
            }
        }
        self.writer.lock().await.shutdown().await;
    }

    /// Reads until a full head is buffered (or the peer goes away). The
    /// keep-alive timeout bounds idle waiting between requests.
    async fn read_head(&mut self) -> HeadOutcome {
        loop {
            match codec::parse_request(&self.buf, &self.env.limits.http) {
                Err(fault) => return HeadOutcome::Fault(fault),
                Ok(Some((record, consumed))) => {
                    self.buf.drain(..consumed);
                    return HeadOutcome::Request(record);
                }
                Ok(None) => {}
            }

            let idle = self.env.limits.conn.keep_alive_timeout;
            let between_requests = self.buf.is_empty();
            tokio::select! {
                read = timeout(idle, self.reader.read_buf(&mut self.buf)) => match read {
                    Ok(Ok(0)) => return HeadOutcome::Quiet,
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        debug!(client = %self.client, "read failed: {e}");
                        return HeadOutcome::Quiet;
                    }
                    Err(_) => return HeadOutcome::Quiet,
                },
                // A draining worker closes connections that sit between
                // requests rather than waiting out their keep-alive.
                _ = self.env.idle.notified(), if between_requests => {
                    if self.env.draining.get() {
                        return HeadOutcome::Quiet;
                    }
                }
            }
        }
    }

    fn build_head(&self, record: &RequestRecord, websocket: bool) -> RequestHead {
        let mut headers = record.headers.clone();
        coalesce_cookies(&mut headers);
        let scheme = match (websocket, self.tls.is_some()) {
            (false, false) => "http",
            (false, true) => "https",
            (true, false) => "ws",
            (true, true) => "wss",
        };
        RequestHead {
            method: record.method,
            scheme,
            http_version: record.version,
            path: record.path.clone(),
            raw_path: record.raw_path.clone(),
            query_string: record.query.clone(),
            root_path: self.env.limits.root_path.clone(),
            headers,
            client: self.client,
            server: self.server,
        }
    }

    fn common(&self, fullflush: bool) -> ScopeCommon {
        ScopeCommon {
            pagi: PagiInfo::new(self.env.scheduler.clone()),
            state: self.env.state.clone(),
            extensions: Rc::new(Extensions {
                tls: self.tls.clone(),
                fullflush,
            }),
        }
    }

    /// Serves one HTTP (or SSE) request. Returns whether the connection
    /// may persist.
    async fn run_http(&mut self, record: RequestRecord) -> bool {
        let is_sse = record
            .headers
            .iter()
            .any(|(n, v)| n == b"accept" && v.windows(17).any(|w| w == b"text/event-stream"));

        let head = self.build_head(&record, false);
        let path = head.path.clone();
        let flags = Rc::new(ResponseFlags::default());
        let (tx, rx) = mpsc::channel(self.env.limits.conn.event_queue);

        let core = match is_sse {
            false => SenderCore::http(
                self.writer.clone(),
                flags.clone(),
                record.version,
                record.keep_alive,
                true,
                self.env.limits.http.file_inline_bytes,
            ),
            true => SenderCore::sse(self.writer.clone(), flags.clone(), record.version, true),
        };
        let scope = match is_sse {
            false => Scope::Http(HttpScope {
                head,
                common: self.common(true),
            }),
            true => Scope::Sse(SseScope {
                head,
                common: self.common(true),
            }),
        };

        let app = self.app.clone();
        let mut app_task = tokio::task::spawn_local(async move {
            app.call(scope, Receiver::new(rx), Sender { core: Rc::new(core) })
                .await
        });

        let keepalive_task = is_sse
            .then(|| self.spawn_sse_keepalive(flags.clone()))
            .flatten();

        // Pump body and disconnect events while the application runs.
        let consumed_body = Cell::new(false);
        let disconnected = Cell::new(false);
        let app_result = {
            let pump = Self::pump_http(
                &mut self.reader,
                &mut self.buf,
                &record,
                &self.env.limits.conn,
                tx,
                is_sse,
                &consumed_body,
                &disconnected,
            );
            tokio::pin!(pump);
            let mut pump_live = true;
            loop {
                tokio::select! {
                    result = &mut app_task => break result,
                    _ = &mut pump, if pump_live => pump_live = false,
                }
            }
        };

        if let Some(task) = keepalive_task {
            task.abort();
        }

        let failed = match app_result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(%path, "application error: {e}");
                true
            }
            Err(join_error) => {
                error!(%path, "application task died: {join_error}");
                true
            }
        };

        if !flags.started.get() && (failed || !flags.complete.get()) {
            // Nothing on the wire yet; a 500 is still possible.
            let mut writer = self.writer.lock().await;
            writer.write(RESPONSE_500).await;
            writer.flush().await;
            return false;
        }
        if failed || !flags.complete.get() {
            // Mid-response failure: the wire is unrecoverable.
            return false;
        }

        record.keep_alive
            && !flags.close.get()
            && consumed_body.get()
            && !disconnected.get()
            && !self.env.draining.get()
    }

    /// Feeds `http.request` events (bounded queue = read backpressure),
    /// then watches the transport for disconnect. Ends only when the
    /// transport does.
    #[allow(clippy::too_many_arguments)]
    async fn pump_http(
        reader: &mut ReadHalf<BoxedTransport>,
        buf: &mut Vec<u8>,
        record: &RequestRecord,
        limits: &crate::limits::ConnLimits,
        tx: mpsc::Sender<ServerEvent>,
        is_sse: bool,
        consumed_body: &Cell<bool>,
        disconnected: &Cell<bool>,
    ) -> PumpEnd {
        let delivered = Self::deliver_body(reader, buf, record, limits, &tx, consumed_body).await;

        if delivered.is_ok() {
            // Body done (or the application hung up early). Keep reading:
            // pipelined bytes accumulate for the next head; EOF means
            // disconnect.
            loop {
                match reader.read_buf(buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }

        disconnected.set(true);
        let event = match is_sse {
            true => ServerEvent::SseDisconnect,
            false => ServerEvent::HttpDisconnect,
        };
        let _ = tx.send(event).await;
        PumpEnd::Disconnected
    }

    /// Streams the request body into the event queue. `Err(())` means the
    /// transport died mid-body.
    async fn deliver_body(
        reader: &mut ReadHalf<BoxedTransport>,
        buf: &mut Vec<u8>,
        record: &RequestRecord,
        limits: &crate::limits::ConnLimits,
        tx: &mpsc::Sender<ServerEvent>,
        consumed_body: &Cell<bool>,
    ) -> Result<(), ()> {
        if record.chunked {
            let mut decoder = ChunkDecoder::new();
            loop {
                match decoder.decode(buf) {
                    Err(fault) => {
                        debug!(%fault, "invalid chunked request body");
                        return Err(());
                    }
                    Ok(Chunked::NeedMore) => match reader.read_buf(buf).await {
                        Ok(0) | Err(_) => return Err(()),
                        Ok(_) => {}
                    },
                    Ok(Chunked::Data(data)) => {
                        for slice in data.chunks(limits.body_slice) {
                            let _ = tx
                                .send(ServerEvent::HttpRequest {
                                    body: slice.to_vec(),
                                    more: true,
                                })
                                .await;
                        }
                    }
                    Ok(Chunked::Complete { trailers }) => {
                        if !trailers.is_empty() {
                            debug!(count = trailers.len(), "request trailers ignored");
                        }
                        break;
                    }
                }
            }
            consumed_body.set(true);
            let _ = tx
                .send(ServerEvent::HttpRequest {
                    body: Vec::new(),
                    more: false,
                })
                .await;
            return Ok(());
        }

        let mut remaining = record.content_length.unwrap_or(0);
        if remaining == 0 {
            consumed_body.set(true);
            let _ = tx
                .send(ServerEvent::HttpRequest {
                    body: Vec::new(),
                    more: false,
                })
                .await;
            return Ok(());
        }

        loop {
            if buf.is_empty() {
                match reader.read_buf(buf).await {
                    Ok(0) | Err(_) => return Err(()),
                    Ok(_) => {}
                }
            }
            let take = remaining.min(buf.len()).min(limits.body_slice);
            let body: Vec<u8> = buf.drain(..take).collect();
            remaining -= take;
            let more = remaining > 0;
            let _ = tx.send(ServerEvent::HttpRequest { body, more }).await;
            if !more {
                consumed_body.set(true);
                return Ok(());
            }
        }
    }

    /// Periodic `: ping` comment lines once the stream has started.
    fn spawn_sse_keepalive(
        &self,
        flags: Rc<ResponseFlags>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.env.limits.sse.keepalive?;
        let writer = self.writer.clone();
        Some(tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !flags.started.get() {
                    continue;
                }
                let mut writer = writer.lock().await;
                if writer.is_closed() {
                    return;
                }
                writer.write(sse::KEEPALIVE).await;
                writer.flush().await;
            }
        }))
    }

    /// Serves a WebSocket connection; the transport never returns to HTTP.
    async fn run_websocket(&mut self, record: RequestRecord) {
        let shake = match handshake::validate(&record) {
            Ok(shake) => shake,
            Err(fault) => {
                debug!(client = %self.client, "rejected handshake");
                let mut writer = self.writer.lock().await;
                writer.write(fault.as_http()).await;
                writer.flush().await;
                return;
            }
        };

        let head = self.build_head(&record, true);
        let path = head.path.clone();
        let flags = Rc::new(ResponseFlags::default());
        let (tx, rx) = mpsc::channel(self.env.limits.conn.event_queue.max(1));
        // The connect event precedes the application's first receive.
        let _ = tx.send(ServerEvent::WsConnect).await;
        let core = SenderCore::websocket(self.writer.clone(), flags.clone(), shake.clone());
        let scope = Scope::WebSocket(WsScope {
            head,
            subprotocols: shake.subprotocols,
            common: self.common(false),
        });

        let app = self.app.clone();
        let mut app_task = tokio::task::spawn_local(async move {
            app.call(scope, Receiver::new(rx), Sender { core: Rc::new(core) })
                .await
        });

        // Everything buffered past the head belongs to the frame layer.
        let frame_buf = BytesMut::from(&self.buf[..]);
        self.buf.clear();

        let pump = Self::pump_ws(
            &mut self.reader,
            frame_buf,
            &self.env.limits.ws,
            self.writer.clone(),
            flags.clone(),
            tx,
        );
        tokio::pin!(pump);
        let mut pump_live = true;
        let app_result = loop {
            tokio::select! {
                result = &mut app_task => break result,
                _ = &mut pump, if pump_live => pump_live = false,
            }
        };

        match app_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(%path, "application error: {e}"),
            Err(join_error) => error!(%path, "application task died: {join_error}"),
        }

        // An application that returns mid-handshake produces a plain error
        // response, same as HTTP.
        if !flags.started.get() {
            let mut writer = self.writer.lock().await;
            writer.write(RESPONSE_500).await;
            writer.flush().await;
        }
    }

    /// Reads frames until the close handshake (or transport death)
    /// finishes, echoing pings and forwarding messages.
    async fn pump_ws(
        reader: &mut ReadHalf<BoxedTransport>,
        mut buf: BytesMut,
        limits: &crate::limits::WsLimits,
        writer: SharedWriter,
        flags: Rc<ResponseFlags>,
        tx: mpsc::Sender<ServerEvent>,
    ) -> PumpEnd {
        let mut decoder = FrameDecoder::new(limits);
        let mut assembler = MessageAssembler::new(limits);

        let disconnect_code = 'pump: loop {
            let frame = loop {
                match decoder.decode(&mut buf) {
                    Err(fault) => {
                        let mut writer = writer.lock().await;
                        writer
                            .write(&crate::ws::codec::encode_close(
                                fault.close_code(),
                                &fault.to_string(),
                            ))
                            .await;
                        writer.flush().await;
                        break 'pump fault.close_code();
                    }
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {
                        // Once the server has sent its close frame, the
                        // peer gets a bounded window to answer.
                        let deadline = match flags.ws_close_sent.get() {
                            Some(_) => limits.close_timeout,
                            None => Duration::from_secs(24 * 60 * 60),
                        };
                        match timeout(deadline, reader.read_buf(&mut buf)).await {
                            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break 'pump 1006,
                            Ok(Ok(_)) => {}
                        }
                    }
                }
            };

            match assembler.push(frame) {
                Err(fault) => {
                    let mut writer = writer.lock().await;
                    writer
                        .write(&crate::ws::codec::encode_close(
                            fault.close_code(),
                            &fault.to_string(),
                        ))
                        .await;
                    writer.flush().await;
                    break fault.close_code();
                }
                Ok(None) => {}
                Ok(Some(Assembled::Ping(payload))) => {
                    // Answered at the codec layer, never surfaced.
                    let mut writer = writer.lock().await;
                    writer
                        .write(&crate::ws::codec::encode_frame(Opcode::Pong, &payload))
                        .await;
                    writer.flush().await;
                }
                Ok(Some(Assembled::Message(message))) => {
                    let _ = tx.send(ServerEvent::WsReceive(message)).await;
                }
                Ok(Some(Assembled::Close { code, reason: _ })) => {
                    if flags.ws_close_sent.get().is_none() {
                        // Peer-initiated close: echo to finish the handshake.
                        let echo_code = if code == 1005 { 1000 } else { code };
                        let mut writer = writer.lock().await;
                        writer
                            .write(&crate::ws::codec::encode_close(echo_code, ""))
                            .await;
                        writer.flush().await;
                        flags.ws_close_sent.set(Some(echo_code));
                    }
                    break code;
                }
            }
        };

        let _ = tx
            .send(ServerEvent::WsDisconnect {
                code: disconnect_code,
            })
            .await;
        PumpEnd::Disconnected
    }
}

/// Type-erases an accepted stream for [`Connection::new`].
pub(crate) fn boxed<T: Transport + 'static>(transport: T) -> BoxedTransport {
    Box::new(transport)
}

#[cfg(test)]
mod scenarios {
    use super::*;
    use crate::{
        app::AppError,
        blocking::BlockingPool,
        events::{header, AppEvent, Body, SseEvent, WsMessage},
        limits::BlockingLimits,
    };
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    fn test_env() -> Rc<ConnEnv> {
        let scheduler = SchedulerHandle::new(BlockingPool::new(BlockingLimits::default()));
        Rc::new(ConnEnv::new(AllLimits::default(), State::new(), scheduler))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Runs `app` against a duplex transport and hands the client half to
    /// the driver closure.
    async fn drive<A, F, Fut>(app: A, env: Rc<ConnEnv>, client_fn: F) -> Fut::Output
    where
        A: Application,
        F: FnOnce(DuplexStream) -> Fut,
        Fut: std::future::Future,
    {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let (client, server) = tokio::io::duplex(256 * 1024);
                let conn = Connection::new(
                    boxed(server),
                    Rc::new(app),
                    env,
                    addr(40000),
                    addr(8000),
                    None,
                );
                let server_task = tokio::task::spawn_local(conn.run());
                let out = client_fn(client).await;
                let _ = server_task.await;
                out
            })
            .await
    }

    async fn send_and_collect(mut client: DuplexStream, request: &[u8]) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        // Leave our write side open (keep-alive) but stop sending; read
        // until the server closes or goes idle.
        let mut out = Vec::new();
        loop {
            let mut chunk = [0u8; 4096];
            match timeout(Duration::from_millis(500), client.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break,
            }
        }
        out
    }

    struct HelloApp;

    impl Application for HelloApp {
        async fn call(
            &self,
            scope: Scope,
            mut receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            let Scope::Http(http) = &scope else {
                return Ok(());
            };
            assert_eq!(http.head().method.as_str(), "GET");
            assert_eq!(http.head().path, "/hello");

            // Terminal body event arrives before we reply.
            match receiver.receive().await {
                Some(ServerEvent::HttpRequest { body, more }) => {
                    assert!(body.is_empty());
                    assert!(!more);
                }
                other => panic!("unexpected event: {other:?}"),
            }

            sender
                .send(AppEvent::HttpResponseStart {
                    status: 200,
                    headers: vec![header("content-type", "text/plain")],
                    trailers: false,
                })
                .await?;
            sender
                .send(AppEvent::HttpResponseBody {
                    body: Body::from("Hi"),
                    more: false,
                })
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn simple_get() {
        let out = drive(HelloApp, test_env(), |client| async move {
            send_and_collect(client, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("\r\ndate: "));
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n2\r\nHi\r\n0\r\n\r\n"));
    }

    struct EchoApp;

    impl Application for EchoApp {
        async fn call(
            &self,
            _scope: Scope,
            mut receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            let mut body = Vec::new();
            while let Some(event) = receiver.receive().await {
                match event {
                    ServerEvent::HttpRequest { body: piece, more } => {
                        body.extend_from_slice(&piece);
                        if !more {
                            break;
                        }
                    }
                    ServerEvent::HttpDisconnect => return Ok(()),
                    other => panic!("unexpected event: {other:?}"),
                }
            }

            sender
                .send(AppEvent::HttpResponseStart {
                    status: 200,
                    headers: vec![header("content-length", body.len().to_string())],
                    trailers: false,
                })
                .await?;
            sender
                .send(AppEvent::HttpResponseBody {
                    body: Body::Bytes(body),
                    more: false,
                })
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn echo_post_content_length() {
        let out = drive(EchoApp, test_env(), |client| async move {
            send_and_collect(client, b"POST /e HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn echo_chunked_request() {
        let out = drive(EchoApp, test_env(), |client| async move {
            send_and_collect(
                client,
                b"POST /e HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  3\r\nfoo\r\n4\r\nbars\r\n0\r\n\r\n",
            )
            .await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\nfoobars"));
    }

    #[tokio::test]
    async fn persistent_connection_serves_two_requests() {
        let out = drive(EchoApp, test_env(), |client| async move {
            send_and_collect(
                client,
                b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nA1\
                  POST /b HTTP/1.1\r\nContent-Length: 2\r\nConnection: close\r\n\r\nB2",
            )
            .await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.contains("A1"));
        assert!(text.contains("B2"));
        // The second response carries the close marker.
        assert!(text.contains("connection: close\r\n"));
    }

    struct PanicApp;

    impl Application for PanicApp {
        async fn call(&self, _: Scope, _: Receiver, _: Sender) -> Result<(), AppError> {
            panic!("application exploded");
        }
    }

    #[tokio::test]
    async fn application_panic_yields_500() {
        let out = drive(PanicApp, test_env(), |client| async move {
            send_and_collect(client, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
    }

    #[tokio::test]
    async fn malformed_request_yields_400() {
        let out = drive(HelloApp, test_env(), |client| async move {
            send_and_collect(client, b"NONSENSE\r\n\r\n").await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    }

    struct StateCounterApp;

    impl Application for StateCounterApp {
        async fn call(
            &self,
            scope: Scope,
            mut receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            while let Some(ServerEvent::HttpRequest { more: true, .. }) = receiver.receive().await {}

            let count = scope
                .state()
                .update("count", |c: &mut u64| {
                    *c += 1;
                    *c
                })
                .unwrap_or_default();

            sender
                .send(AppEvent::HttpResponseStart {
                    status: 200,
                    headers: vec![],
                    trailers: false,
                })
                .await?;
            sender
                .send(AppEvent::HttpResponseBody {
                    body: Body::Bytes(count.to_string().into_bytes()),
                    more: false,
                })
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn state_is_shared_across_requests() {
        let env = test_env();
        env.state.insert("count", 0u64);

        // Four sequential requests on one persistent connection.
        let request = b"GET /n HTTP/1.1\r\nHost: x\r\n\r\n".repeat(4);
        let out = drive(StateCounterApp, env.clone(), |client| async move {
            send_and_collect(client, &request).await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200").count(), 4);
        assert!(text.contains("1\r\n4\r\n0\r\n\r\n"), "{text}");
        assert_eq!(env.state.get::<u64>("count"), Some(4));
        assert_eq!(env.served.get(), 4);
    }

    struct SseApp;

    impl Application for SseApp {
        async fn call(
            &self,
            scope: Scope,
            _receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            assert!(matches!(scope, Scope::Sse(_)));
            sender
                .send(AppEvent::SseStart {
                    status: 200,
                    headers: vec![],
                })
                .await?;
            for data in ["A", "B", "C"] {
                sender.send(AppEvent::SseSend(SseEvent::data(data))).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sse_stream() {
        let out = drive(SseApp, test_env(), |client| async move {
            send_and_collect(
                client,
                b"GET /events HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n",
            )
            .await
        })
        .await;

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-type: text/event-stream; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\n\r\ndata:A\n\ndata:B\n\ndata:C\n\n"), "{text}");
    }

    // --- WebSocket scenario ------------------------------------------------

    const MASK: [u8; 4] = [9, 8, 7, 6];

    fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode, 0x80 | payload.len() as u8];
        out.extend_from_slice(&MASK);
        out.extend(
            payload
                .iter()
                .enumerate()
                .map(|(index, byte)| byte ^ MASK[index % 4]),
        );
        out
    }

    struct WsEchoApp;

    impl Application for WsEchoApp {
        async fn call(
            &self,
            scope: Scope,
            mut receiver: Receiver,
            sender: Sender,
        ) -> Result<(), AppError> {
            let Scope::WebSocket(ws) = &scope else {
                panic!("expected a websocket scope");
            };
            assert_eq!(ws.head().scheme, "ws");

            assert_eq!(receiver.receive().await, Some(ServerEvent::WsConnect));
            sender
                .send(AppEvent::WsAccept {
                    subprotocol: None,
                    headers: vec![],
                })
                .await?;

            while let Some(event) = receiver.receive().await {
                match event {
                    ServerEvent::WsReceive(message) => {
                        sender.send(AppEvent::WsSend(message)).await?;
                    }
                    ServerEvent::WsDisconnect { code } => {
                        scope.state().insert("close-code", code);
                        break;
                    }
                    other => panic!("unexpected event: {other:?}"),
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn websocket_echo_and_close() {
        let env = test_env();
        let out = drive(WsEchoApp, env.clone(), |mut client| async move {
            client
                .write_all(
                    b"GET /chat HTTP/1.1\r\n\
                      Host: x\r\n\
                      Upgrade: websocket\r\n\
                      Connection: Upgrade\r\n\
                      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                      Sec-WebSocket-Version: 13\r\n\r\n",
                )
                .await
                .unwrap();

            // Read the 101 response head.
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                let mut byte = [0u8; 1];
                client.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            let head = String::from_utf8(head).unwrap();
            assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
            assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

            // Text echo.
            client.write_all(&masked_frame(0x1, b"ping")).await.unwrap();
            let mut echo = [0u8; 6];
            client.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, &[0x81, 0x04, b'p', b'i', b'n', b'g']);

            // Client close 1000; server echoes close 1000.
            client
                .write_all(&masked_frame(0x8, &1000u16.to_be_bytes()))
                .await
                .unwrap();
            let mut close = [0u8; 4];
            client.read_exact(&mut close).await.unwrap();
            assert_eq!(&close, &[0x88, 0x02, 0x03, 0xE8]);
        })
        .await;

        let _ = out;
        assert_eq!(env.state.get::<u16>("close-code"), Some(1000));
    }

    #[tokio::test]
    async fn websocket_ping_answered_without_surfacing() {
        let env = test_env();
        drive(WsEchoApp, env, |mut client| async move {
            client
                .write_all(
                    b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                      Sec-WebSocket-Key: AAAAAAAAAAAAAAAAAAAAAA==\r\nSec-WebSocket-Version: 13\r\n\r\n",
                )
                .await
                .unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                let mut byte = [0u8; 1];
                client.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }

            // Ping is echoed as pong by the codec driver; the app (which
            // would panic on an unexpected event) never sees it.
            client.write_all(&masked_frame(0x9, b"hb")).await.unwrap();
            let mut pong = [0u8; 4];
            client.read_exact(&mut pong).await.unwrap();
            assert_eq!(&pong, &[0x8A, 0x02, b'h', b'b']);

            client
                .write_all(&masked_frame(0x8, &1001u16.to_be_bytes()))
                .await
                .unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn draining_disables_keep_alive() {
        let env = test_env();
        env.draining.set(true);

        let out = drive(EchoApp, env, |client| async move {
            send_and_collect(
                client,
                b"POST /a HTTP/1.1\r\nContent-Length: 1\r\n\r\nXPOST /b HTTP/1.1\r\nContent-Length: 1\r\n\r\nY",
            )
            .await
        })
        .await;

        // Only the first request is answered; the connection closes.
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200").count(), 1);
    }
}
