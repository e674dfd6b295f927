/*
 * connection.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Locanda, an embeddable HTTP server library.
 *
 * Locanda is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Locanda is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Locanda.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Per-connection HTTP engine: reads and parses requests, streams bodies
//! (buffered, multipart, octet-stream), dispatches through the aspect chain
//! and router, consults the response cache, writes the response, and honours
//! keep-alive. One request/response pair is live at a time; bytes of a
//! pipelined next request stay buffered until the current exchange is done.
//! A WebSocket upgrade hands the stream over to the WebSocket engine.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::protocol::http::aspect;
use crate::protocol::http::cache::{CachedResponse, Lookup, ResponseCache};
use crate::protocol::http::encoding;
use crate::protocol::http::h1::{
    encode_chunk, encode_final_chunk, BodyFraming, H1RequestHandler, ParseError, ParseState,
    RequestParser, ResponseHead, WireFraming,
};
use crate::protocol::http::multipart::{
    boundary_from_content_type, MultipartError, MultipartEvent, MultipartParser, PartHead,
};
use crate::protocol::http::request::{Body, ContentType, Method, Request, Version};
use crate::protocol::http::response::{BodyKind, CachePolicy, ContentEncoding, Response, StatusCode};
use crate::protocol::http::router::{allow_header, Resolution, Router};
use crate::protocol::http::session::{Session, SessionStore, SESSION_COOKIE};
use crate::protocol::http::static_files;
use crate::protocol::http::upload::{UploadError, UploadManager, UploadPart};
use crate::protocol::websocket::handshake;
use crate::protocol::websocket::{WebSocketHandler, WsConnection};
use crate::urlcodec;

/// Collaborators shared by every connection of one server, constructed
/// before the acceptor starts and injected into each connection.
pub struct ServerContext {
    pub config: ServerConfig,
    pub router: Router,
    pub cache: ResponseCache,
    pub sessions: SessionStore,
    pub uploads: UploadManager,
}

impl ServerContext {
    pub fn new(config: ServerConfig, router: Router) -> Self {
        let cache = ResponseCache::new(config.cache_max_entries);
        let uploads = UploadManager::new(config.upload_dir.clone(), config.max_part_bytes as u64);
        Self {
            config,
            router,
            cache,
            sessions: SessionStore::new(),
            uploads,
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Reading,
    Dispatching,
    Writing,
    Closing,
}

/// Payload applied when a delayed response is released.
#[derive(Debug, Default)]
pub struct DelayedResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

struct HandleShared {
    closed: AtomicBool,
    remote_addr: Option<SocketAddr>,
    release: Mutex<Option<oneshot::Sender<DelayedResponse>>>,
    ws_handler: Mutex<Option<Box<dyn WebSocketHandler>>>,
}

/// Handle given to handlers: out-of-band release of delayed responses,
/// WebSocket handler installation, and access to the shared collaborators.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
    ctx: Arc<ServerContext>,
}

impl ConnectionHandle {
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// True once the connection has entered CLOSING; a detached task holding
    /// this handle should stop working on its behalf.
    pub fn has_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.ctx.sessions
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.ctx.cache
    }

    /// Release a response deferred with `Response::set_delay(true)`. The
    /// first call wins; later calls (or calls with no delayed response
    /// outstanding) are ignored.
    pub fn response_now(&self, response: DelayedResponse) {
        if let Some(tx) = self.shared.release.lock().unwrap().take() {
            let _ = tx.send(response);
        }
    }

    /// Install the WebSocket handler for an upgrade route. Must be called by
    /// the route handler before returning; the engine completes the
    /// handshake afterwards.
    pub fn set_websocket_handler(&self, handler: Box<dyn WebSocketHandler>) {
        *self.shared.ws_handler.lock().unwrap() = Some(handler);
    }

    /// Start a session and announce it on the response via Set-Cookie.
    pub fn start_session(&self, res: &mut Response) -> io::Result<Arc<Session>> {
        let session = self.ctx.sessions.start()?;
        res.add_header("Set-Cookie", session.cookie_value());
        Ok(session)
    }

    /// The live session bound to this request's cookie, if any.
    pub fn session(&self, req: &Request) -> Option<Arc<Session>> {
        req.cookie(SESSION_COOKIE)
            .and_then(|token| self.ctx.sessions.lookup(token))
    }
}

/// Engine failure, mapped to a wire status (or silence) per the error
/// policy. Every failure is local to its connection.
#[derive(Debug)]
enum EngineError {
    Parse(ParseError),
    Multipart(MultipartError),
    Upload(UploadError),
    /// Head was started but never finished in time → 408.
    HeadTimeout,
    /// Nothing in flight, or mid-body stall → close silently.
    SilentClose(&'static str),
    Handler(String),
    Io(io::Error),
    BodyTooLarge,
}

impl EngineError {
    /// Status code to answer with; None closes without a response.
    fn status(&self) -> Option<u16> {
        match self {
            EngineError::Parse(e) => Some(e.status()),
            EngineError::Multipart(e) => Some(e.status()),
            EngineError::Upload(e) => Some(e.status()),
            EngineError::HeadTimeout => Some(408),
            EngineError::SilentClose(_) => None,
            EngineError::Handler(_) => Some(500),
            EngineError::Io(_) => None,
            EngineError::BodyTooLarge => Some(413),
        }
    }

    fn describe(&self) -> String {
        match self {
            EngineError::Parse(e) => e.to_string(),
            EngineError::Multipart(e) => e.to_string(),
            EngineError::Upload(e) => e.to_string(),
            EngineError::HeadTimeout => "request head timed out".to_string(),
            EngineError::SilentClose(reason) => (*reason).to_string(),
            EngineError::Handler(e) => format!("handler failed: {}", e),
            EngineError::Io(e) => format!("socket failure: {}", e),
            EngineError::BodyTooLarge => "request body too large".to_string(),
        }
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Parse(e)
    }
}

impl From<MultipartError> for EngineError {
    fn from(e: MultipartError) -> Self {
        EngineError::Multipart(e)
    }
}

impl From<UploadError> for EngineError {
    fn from(e: UploadError) -> Self {
        EngineError::Upload(e)
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

/// Builds the `Request` from parser events; body chunks are drained by the
/// engine between `receive` calls.
#[derive(Default)]
struct RequestAssembler {
    req: Request,
    chunks: Vec<Bytes>,
    complete: bool,
}

impl H1RequestHandler for RequestAssembler {
    fn request_line(&mut self, method: Method, target: &str, version: Version) {
        self.req.method = Some(method);
        self.req.version = version;
        self.req.set_target(target.to_string());
    }

    fn header(&mut self, name: &str, value: &str) {
        self.req.headers.push((name.to_string(), value.to_string()));
    }

    fn body_chunk(&mut self, data: &[u8]) {
        self.chunks.push(Bytes::copy_from_slice(data));
    }

    fn trailer(&mut self, name: &str, value: &str) {
        self.req.headers.push((name.to_string(), value.to_string()));
    }

    fn complete(&mut self) {
        self.complete = true;
    }
}

/// How the current exchange ends.
enum Exchange {
    KeepAlive,
    Close,
    Upgrade { accept: String },
}

/// One accepted connection. Generic over the stream so plain TCP, TLS, and
/// in-memory test streams all drive the same engine.
pub struct HttpConnection<S> {
    stream: S,
    read_buf: BytesMut,
    parser: RequestParser,
    state: ConnState,
    ctx: Arc<ServerContext>,
    remote_addr: Option<SocketAddr>,
    stop: watch::Receiver<bool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> HttpConnection<S> {
    pub fn new(
        stream: S,
        remote_addr: Option<SocketAddr>,
        ctx: Arc<ServerContext>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let parser = RequestParser::new(ctx.config.max_header_bytes, ctx.config.max_body_bytes);
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            parser,
            state: ConnState::Idle,
            ctx,
            remote_addr,
            stop,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Serve requests until the peer goes away, a fatal error occurs, or the
    /// server stops. Consumes the connection.
    pub async fn serve(mut self) {
        loop {
            let mut assembler = RequestAssembler::default();
            let shared = Arc::new(HandleShared {
                closed: AtomicBool::new(false),
                remote_addr: self.remote_addr,
                release: Mutex::new(None),
                ws_handler: Mutex::new(None),
            });
            let outcome = self.exchange(&mut assembler, &shared).await;
            match outcome {
                Ok(Exchange::KeepAlive) => {
                    self.state = ConnState::Idle;
                    self.parser.reset();
                    continue;
                }
                Ok(Exchange::Close) => {
                    self.state = ConnState::Closing;
                    let _ = self.stream.shutdown().await;
                    return;
                }
                Ok(Exchange::Upgrade { accept }) => {
                    self.state = ConnState::Dispatching;
                    let handler = shared.ws_handler.lock().unwrap().take();
                    let mut handler = match handler {
                        Some(h) => h,
                        None => {
                            // Route accepted the upgrade but installed no
                            // handler; refuse it.
                            let _ = self.write_simple_error(400).await;
                            let _ = self.stream.shutdown().await;
                            return;
                        }
                    };
                    if self.write_upgrade_response(&accept).await.is_err() {
                        let _ = self.stream.shutdown().await;
                        return;
                    }
                    let leftover = std::mem::take(&mut self.read_buf);
                    let ws = WsConnection::new(
                        self.stream,
                        leftover,
                        self.ctx.config.idle_timeout,
                        self.ctx.config.max_body_bytes,
                    );
                    if let Err(e) = ws.run(handler.as_mut()).await {
                        log::debug!("websocket connection ended with error: {}", e);
                    }
                    return;
                }
                Err(e) => {
                    shared.closed.store(true, Ordering::SeqCst);
                    self.state = ConnState::Closing;
                    match e.status() {
                        Some(status) => {
                            log::debug!(
                                "closing connection with {}: {}",
                                status,
                                e.describe()
                            );
                            let _ = self.write_simple_error(status).await;
                        }
                        None => log::debug!("closing connection: {}", e.describe()),
                    }
                    let _ = self.stream.shutdown().await;
                    return;
                }
            }
        }
    }

    /// One full request/response exchange.
    async fn exchange(
        &mut self,
        assembler: &mut RequestAssembler,
        shared: &Arc<HandleShared>,
    ) -> Result<Exchange, EngineError> {
        self.state = ConnState::Reading;
        if !self.read_head(assembler).await? {
            return Ok(Exchange::Close);
        }
        assembler.req.remote_addr = self.remote_addr;
        assembler.req.parse_cookies();

        let framing = BodyFraming::from_headers(&assembler.req.headers)?;
        let is_upgrade = handshake::is_upgrade_request(&assembler.req);
        assembler.req.content_type = ContentType::classify(
            assembler.req.header("Content-Type"),
            is_upgrade,
        );

        // Interim 100 before the body when the client asked for it.
        if assembler
            .req
            .header("Expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
            && !matches!(framing, BodyFraming::None)
        {
            self.write_all_deadline(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }

        self.read_body(assembler, framing).await?;

        self.state = ConnState::Dispatching;
        let handle = ConnectionHandle {
            shared: shared.clone(),
            ctx: self.ctx.clone(),
        };
        self.dispatch(assembler, handle, is_upgrade).await
    }

    /// Read until a complete request head is parsed. Ok(false) means the
    /// peer closed (or the server stopped) with nothing in flight.
    async fn read_head(&mut self, assembler: &mut RequestAssembler) -> Result<bool, EngineError> {
        loop {
            self.parser.receive(&mut self.read_buf, assembler)?;
            if self.parser.state() == ParseState::HeadersComplete {
                return Ok(true);
            }
            // Buffered-but-unparsed bytes still count as a started head
            // (a partial request line has no CRLF for the parser to consume).
            let started = self.parser.head_started() || !self.read_buf.is_empty();
            let deadline = if started {
                self.ctx.config.header_timeout
            } else {
                self.ctx.config.idle_timeout
            };
            let mut tmp = [0u8; 8 * 1024];
            let read = tokio::select! {
                r = timeout(deadline, self.stream.read(&mut tmp)) => r,
                _ = self.stop.changed() => {
                    if started {
                        return Err(EngineError::SilentClose("server stopping"));
                    }
                    return Ok(false);
                }
            };
            match read {
                Err(_) if started => return Err(EngineError::HeadTimeout),
                Err(_) => return Err(EngineError::SilentClose("idle timeout")),
                Ok(Ok(0)) if started => {
                    return Err(EngineError::SilentClose("peer closed mid-head"))
                }
                Ok(Ok(0)) => return Ok(false),
                Ok(Ok(n)) => self.read_buf.extend_from_slice(&tmp[..n]),
                Ok(Err(e)) => return Err(EngineError::Io(e)),
            }
        }
    }

    /// Read and store the body according to its framing and content type.
    async fn read_body(
        &mut self,
        assembler: &mut RequestAssembler,
        framing: BodyFraming,
    ) -> Result<(), EngineError> {
        let is_upload = matches!(
            assembler.req.content_type,
            ContentType::Multipart | ContentType::OctetStream
        );
        if let BodyFraming::ContentLength(n) = framing {
            let limit = if is_upload {
                self.ctx.config.max_upload_bytes
            } else {
                self.ctx.config.max_body_bytes
            };
            if n > limit as u64 {
                return Err(EngineError::BodyTooLarge);
            }
        }
        self.parser.set_body_mode(framing, assembler);
        // Body bytes that arrived behind the head are already buffered;
        // parse them before touching the socket again.
        self.parser.receive(&mut self.read_buf, assembler)?;

        match assembler.req.content_type {
            ContentType::Multipart => self.read_multipart_body(assembler).await,
            ContentType::OctetStream if matches!(framing, BodyFraming::None) => {
                assembler.req.body = Body::None;
                Ok(())
            }
            ContentType::OctetStream => self.read_octet_stream_body(assembler).await,
            _ => self.read_buffered_body(assembler).await,
        }
    }

    /// Pull more body bytes into the assembler. Ok(false) on clean end of
    /// body (parser complete).
    async fn pump_body(&mut self, assembler: &mut RequestAssembler) -> Result<bool, EngineError> {
        if assembler.complete {
            return Ok(false);
        }
        let mut tmp = [0u8; 16 * 1024];
        let read = tokio::select! {
            r = timeout(self.ctx.config.idle_timeout, self.stream.read(&mut tmp)) => r,
            _ = self.stop.changed() => return Err(EngineError::SilentClose("server stopping")),
        };
        match read {
            Err(_) => {
                log::warn!("timeout waiting for request body");
                Err(EngineError::SilentClose("body read timeout"))
            }
            Ok(Ok(0)) => Err(EngineError::SilentClose("peer closed mid-body")),
            Ok(Ok(n)) => {
                self.read_buf.extend_from_slice(&tmp[..n]);
                self.parser.receive(&mut self.read_buf, assembler)?;
                Ok(true)
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
        }
    }

    async fn read_buffered_body(
        &mut self,
        assembler: &mut RequestAssembler,
    ) -> Result<(), EngineError> {
        let mut body = BytesMut::new();
        loop {
            for chunk in assembler.chunks.drain(..) {
                if body.len() + chunk.len() > self.ctx.config.max_body_bytes {
                    return Err(EngineError::BodyTooLarge);
                }
                body.extend_from_slice(&chunk);
            }
            if assembler.complete {
                break;
            }
            self.pump_body(assembler).await?;
        }
        for chunk in assembler.chunks.drain(..) {
            if body.len() + chunk.len() > self.ctx.config.max_body_bytes {
                return Err(EngineError::BodyTooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();
        // Urlencoded forms feed the query list, like query-string pairs.
        if assembler.req.content_type == ContentType::UrlEncoded && body.len() <= 64 * 1024 {
            if let Ok(text) = std::str::from_utf8(&body) {
                let mut pairs = urlcodec::parse_query(text);
                assembler.req.query.append(&mut pairs);
            }
        }
        assembler.req.body = if body.is_empty() {
            Body::None
        } else {
            Body::Bytes(body)
        };
        Ok(())
    }

    async fn read_multipart_body(
        &mut self,
        assembler: &mut RequestAssembler,
    ) -> Result<(), EngineError> {
        let boundary = assembler
            .req
            .header("Content-Type")
            .and_then(boundary_from_content_type)
            .ok_or(EngineError::Parse(ParseError::BadRequest(
                "multipart without boundary",
            )))?;
        let mut mp = MultipartParser::new(&boundary, self.ctx.config.max_parts);
        let mut parts: Vec<UploadPart> = Vec::new();
        let mut writer = None;
        let mut total: u64 = 0;

        let result = loop {
            for chunk in assembler.chunks.drain(..) {
                total += chunk.len() as u64;
                if total > self.ctx.config.max_upload_bytes as u64 {
                    break;
                }
                mp.feed(&chunk);
            }
            if total > self.ctx.config.max_upload_bytes as u64 {
                break Err(EngineError::Upload(UploadError::BodyTooLarge));
            }
            if assembler.complete {
                mp.end_of_body();
            }
            match self.pump_multipart(&mut mp, &mut writer, &mut parts).await {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
            if assembler.complete && !mp.is_finished() {
                break Err(EngineError::Multipart(MultipartError::Malformed(
                    "missing closing boundary",
                )));
            }
            if let Err(e) = self.pump_body(assembler).await {
                break Err(e);
            }
        };

        match result {
            Ok(()) => {
                assembler.req.body = Body::Uploads(parts);
                Ok(())
            }
            Err(e) => {
                if let Some(w) = writer.take() {
                    w.abort().await;
                }
                crate::protocol::http::upload::discard_parts(parts).await;
                Err(e)
            }
        }
    }

    /// Drain multipart events, streaming part data to disk. Ok(true) once
    /// the closing boundary was consumed.
    async fn pump_multipart(
        &mut self,
        mp: &mut MultipartParser,
        writer: &mut Option<crate::protocol::http::upload::UploadWriter>,
        parts: &mut Vec<UploadPart>,
    ) -> Result<bool, EngineError> {
        loop {
            match mp.next_event()? {
                Some(MultipartEvent::PartStart(head)) => {
                    *writer = Some(self.ctx.uploads.open_part(head).await?);
                }
                Some(MultipartEvent::Data(data)) => {
                    match writer.as_mut() {
                        Some(w) => w.write(&data).await?,
                        None => {
                            return Err(EngineError::Multipart(MultipartError::Malformed(
                                "data outside part",
                            )))
                        }
                    }
                }
                Some(MultipartEvent::PartEnd) => {
                    if let Some(w) = writer.take() {
                        parts.push(w.finish().await?);
                    }
                }
                Some(MultipartEvent::Finished) => return Ok(true),
                None => return Ok(false),
            }
        }
    }

    async fn read_octet_stream_body(
        &mut self,
        assembler: &mut RequestAssembler,
    ) -> Result<(), EngineError> {
        let head = PartHead {
            field_name: String::new(),
            file_name: None,
            content_type: Some("application/octet-stream".to_string()),
        };
        let mut writer = self
            .ctx
            .uploads
            .open_part_with_limit(head, self.ctx.config.max_upload_bytes as u64)
            .await?;
        let mut total: u64 = 0;
        let result = loop {
            let mut failed: Option<EngineError> = None;
            for chunk in assembler.chunks.drain(..) {
                total += chunk.len() as u64;
                if total > self.ctx.config.max_upload_bytes as u64 {
                    failed = Some(EngineError::Upload(UploadError::BodyTooLarge));
                    break;
                }
                if let Err(e) = writer.write(&chunk).await {
                    failed = Some(e.into());
                    break;
                }
            }
            if let Some(e) = failed {
                break Err(e);
            }
            if assembler.complete && assembler.chunks.is_empty() {
                break Ok(());
            }
            if let Err(e) = self.pump_body(assembler).await {
                break Err(e);
            }
        };
        match result {
            Ok(()) => {
                let part = writer.finish().await?;
                assembler.req.body = Body::Uploads(vec![part]);
                Ok(())
            }
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        }
    }

    /// Route, run the aspect chain and handler, write the response.
    async fn dispatch(
        &mut self,
        assembler: &mut RequestAssembler,
        handle: ConnectionHandle,
        is_upgrade: bool,
    ) -> Result<Exchange, EngineError> {
        let method = assembler
            .req
            .method
            .ok_or(EngineError::Parse(ParseError::BadRequest("no method")))?;
        let path = assembler.req.path.clone();
        let mut res = Response::new();

        let (route, captures) = match self.ctx.router.resolve(method, &path) {
            Resolution::Found { route, captures } => (route, captures),
            Resolution::MethodNotAllowed(allow) => {
                res.status = Some(StatusCode(405));
                res.add_header("Allow", allow_header(&allow));
                self.fill_error_body(&mut res, 405).await;
                return self.finish(&assembler.req, res).await;
            }
            Resolution::AutoOptions(allow) => {
                res.status = Some(StatusCode(200));
                res.add_header("Allow", allow_header(&allow));
                res.body = BodyKind::Bytes(Bytes::new());
                return self.finish(&assembler.req, res).await;
            }
            Resolution::NotFound => {
                // Static resources answer GET/HEAD for anything unrouted.
                if matches!(method, Method::Get | Method::Head) {
                    if let Some(static_dir) = self.ctx.config.static_dir.clone() {
                        if static_files::serve(
                            &static_dir,
                            &path,
                            &self.ctx.config,
                            &mut res,
                        )
                        .await
                        {
                            return self.finish(&assembler.req, res).await;
                        }
                    }
                }
                res.status = Some(StatusCode::NOT_FOUND);
                self.fill_error_body(&mut res, 404).await;
                return self.finish(&assembler.req, res).await;
            }
        };

        for (name, value) in captures {
            assembler.req.query.push((name, value));
        }

        // Upgrade requests bypass caching; the 101 is never cacheable.
        if is_upgrade {
            match handshake::validate_upgrade(&assembler.req) {
                Ok(upgrade) => {
                    self.run_handler_chain(&route, assembler, &mut res, handle)
                        .await?;
                    return Ok(Exchange::Upgrade {
                        accept: upgrade.accept,
                    });
                }
                Err(reason) => {
                    return Err(EngineError::Parse(ParseError::BadRequest(reason)));
                }
            }
        }

        let cache_enabled = route
            .config
            .enable_cache
            .unwrap_or(self.ctx.config.enable_response_cache);
        let ttl = route
            .config
            .cache_ttl
            .unwrap_or(Duration::from_secs(self.ctx.config.cache_max_age));
        if !cache_enabled || ttl.is_zero() {
            self.run_handler_chain(&route, assembler, &mut res, handle)
                .await?;
            return self.finish(&assembler.req, res).await;
        }

        let fp = self.ctx.cache.fingerprint(&assembler.req);
        loop {
            match self.ctx.cache.lookup(&fp) {
                Lookup::Hit(entry) => {
                    return self.replay_cached(&assembler.req, &entry).await;
                }
                Lookup::Pending(waiter) => match waiter.wait().await {
                    Some(entry) => return self.replay_cached(&assembler.req, &entry).await,
                    None => continue,
                },
                Lookup::Build(guard) => {
                    self.run_handler_chain(&route, assembler, &mut res, handle.clone())
                        .await?;
                    let effective_ttl = match res.cache_policy {
                        CachePolicy::Inherit => ttl,
                        CachePolicy::ForceOn => ttl,
                        CachePolicy::ForceOff => Duration::ZERO,
                        CachePolicy::MaxAge(age) => age,
                    };
                    // Only materialized bodies can be replayed; everything
                    // else skips publication and the guard wakes waiters to
                    // run for themselves.
                    let body = match &res.body {
                        BodyKind::Bytes(b) => Some(b.clone()),
                        BodyKind::Empty => Some(Bytes::new()),
                        _ => None,
                    };
                    if let Some(body) = body {
                        let applied = encoding::negotiate(
                            res.content_encoding,
                            assembler.req.header("Accept-Encoding"),
                        );
                        let encoded = match applied {
                            ContentEncoding::None => body,
                            other => Bytes::from(
                                encoding::encode(&body, other).map_err(EngineError::Io)?,
                            ),
                        };
                        let entry = CachedResponse {
                            status: res.status.unwrap_or(StatusCode::OK).0,
                            headers: res.headers().to_vec(),
                            body: encoded,
                            encoding: applied,
                        };
                        // The builder answers from the same bytes it
                        // published, so every waiter sees identical output.
                        let replay = CachedResponse {
                            status: entry.status,
                            headers: entry.headers.clone(),
                            body: entry.body.clone(),
                            encoding: entry.encoding,
                        };
                        guard.publish(entry, effective_ttl);
                        return self.replay_cached(&assembler.req, &replay).await;
                    }
                    drop(guard);
                    return self.finish(&assembler.req, res).await;
                }
            }
        }
    }

    /// Aspects around the terminal handler, then the delay gate.
    async fn run_handler_chain(
        &mut self,
        route: &Arc<crate::protocol::http::router::Route>,
        assembler: &mut RequestAssembler,
        res: &mut Response,
        handle: ConnectionHandle,
    ) -> Result<(), EngineError> {
        let aspects = &route.config.middleware;
        let before = aspect::run_before(aspects, &mut assembler.req, res)
            .map_err(|e| EngineError::Handler(e.to_string()))?;
        if before.run_terminal {
            // Arm the release channel before the handler runs so a detached
            // task can fire it even before we start waiting.
            let (tx, rx) = oneshot::channel();
            *handle.shared.release.lock().unwrap() = Some(tx);
            (route.handler.as_ref())(&mut assembler.req, res, handle.clone())
                .await
                .map_err(|e| EngineError::Handler(e.to_string()))?;
            if res.delay {
                let released = tokio::select! {
                    r = rx => r.ok(),
                    _ = self.stop.changed() => None,
                };
                match released {
                    Some(delayed) => {
                        res.status = Some(delayed.status);
                        for (name, value) in delayed.headers {
                            res.add_header(name, value);
                        }
                        res.body = BodyKind::Bytes(delayed.body);
                        res.delay = false;
                    }
                    None => return Err(EngineError::SilentClose("stopped while delayed")),
                }
            } else {
                handle.shared.release.lock().unwrap().take();
            }
        }
        aspect::run_after(aspects, before.invoked, &assembler.req, res)
            .map_err(|e| EngineError::Handler(e.to_string()))?;
        Ok(())
    }

    /// Write a cached response verbatim.
    async fn replay_cached(
        &mut self,
        req: &Request,
        entry: &CachedResponse,
    ) -> Result<Exchange, EngineError> {
        self.state = ConnState::Writing;
        let close = req.wants_close();
        let mut head = ResponseHead::with_headers(StatusCode(entry.status), entry.headers.clone());
        if let Some(token) = entry.encoding.token() {
            head.add("Content-Encoding", token);
        }
        head.finalize(WireFraming::Length(entry.body.len() as u64), close);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        if req.method != Some(Method::Head) {
            out.extend_from_slice(&entry.body);
        }
        self.write_all_deadline(&out).await?;
        Ok(if close {
            Exchange::Close
        } else {
            Exchange::KeepAlive
        })
    }

    /// Freeze and write the response built by the handler.
    async fn finish(&mut self, req: &Request, mut res: Response) -> Result<Exchange, EngineError> {
        self.state = ConnState::Writing;
        let close = req.wants_close();
        let status = res.status.unwrap_or(StatusCode::OK);
        let is_head = req.method == Some(Method::Head);
        let suppress_body = matches!(status.0, 100..=199 | 204 | 304);

        let body = std::mem::take(&mut res.body);
        match body {
            BodyKind::Empty => {
                let framing = if suppress_body {
                    WireFraming::None
                } else {
                    WireFraming::Length(0)
                };
                self.write_head(&res, status, framing, close).await?;
            }
            BodyKind::Bytes(bytes) => {
                let applied =
                    encoding::negotiate(res.content_encoding, req.header("Accept-Encoding"));
                let encoded = match applied {
                    ContentEncoding::None => bytes,
                    other => {
                        Bytes::from(encoding::encode(&bytes, other).map_err(EngineError::Io)?)
                    }
                };
                if let Some(token) = applied.token() {
                    res.set_header("Content-Encoding", token);
                }
                let mut out = BytesMut::new();
                let mut head = ResponseHead::with_headers(status, res.headers().to_vec());
                head.finalize(WireFraming::Length(encoded.len() as u64), close);
                head.encode(&mut out);
                if !is_head {
                    out.extend_from_slice(&encoded);
                }
                self.write_all_deadline(&out).await?;
            }
            BodyKind::File(path) => {
                self.write_file_body(req, &res, status, &path, close).await?;
            }
            BodyKind::Chunked(generator) => {
                self.write_head(&res, status, WireFraming::Chunked, close)
                    .await?;
                if !is_head {
                    // One chunk in flight at a time; each is flushed before
                    // the generator is polled again. Generators may read from
                    // disk, so each poll runs on the blocking pool instead of
                    // this worker thread.
                    let mut generator = generator;
                    loop {
                        let (piece, returned) = tokio::task::spawn_blocking(move || {
                            let mut generator = generator;
                            let piece = generator();
                            (piece, generator)
                        })
                        .await
                        .map_err(|e| {
                            EngineError::Io(io::Error::new(io::ErrorKind::Other, e))
                        })?;
                        generator = returned;
                        let piece = match piece {
                            Some(piece) => piece,
                            None => break,
                        };
                        let mut out = BytesMut::new();
                        encode_chunk(&piece, &mut out);
                        self.write_all_deadline(&out).await?;
                    }
                    let mut out = BytesMut::new();
                    encode_final_chunk(&mut out);
                    self.write_all_deadline(&out).await?;
                }
            }
            BodyKind::Raw(bytes) => {
                let mut out = BytesMut::new();
                let mut head = ResponseHead::with_headers(status, res.headers().to_vec());
                head.finalize(WireFraming::None, close);
                head.encode(&mut out);
                out.extend_from_slice(&bytes);
                self.write_all_deadline(&out).await?;
            }
        }

        Ok(if close {
            Exchange::Close
        } else {
            Exchange::KeepAlive
        })
    }

    async fn write_head(
        &mut self,
        res: &Response,
        status: StatusCode,
        framing: WireFraming,
        close: bool,
    ) -> Result<(), EngineError> {
        let mut head = ResponseHead::with_headers(status, res.headers().to_vec());
        head.finalize(framing, close);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        self.write_all_deadline(&out).await
    }

    async fn write_file_body(
        &mut self,
        req: &Request,
        res: &Response,
        status: StatusCode,
        path: &std::path::Path,
        close: bool,
    ) -> Result<(), EngineError> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("response file {} unreadable: {}", path.display(), e);
                let mut error = Response::new();
                error.status = Some(StatusCode::NOT_FOUND);
                self.fill_error_body(&mut error, 404).await;
                let body = match std::mem::take(&mut error.body) {
                    BodyKind::Bytes(b) => b,
                    _ => Bytes::new(),
                };
                let mut out = BytesMut::new();
                let mut head =
                    ResponseHead::with_headers(StatusCode::NOT_FOUND, error.headers().to_vec());
                head.finalize(WireFraming::Length(body.len() as u64), close);
                head.encode(&mut out);
                out.extend_from_slice(&body);
                return self.write_all_deadline(&out).await;
            }
        };
        let len = file
            .metadata()
            .await
            .map_err(EngineError::Io)?
            .len();
        self.write_head(res, status, WireFraming::Length(len), close)
            .await?;
        if req.method == Some(Method::Head) {
            return Ok(());
        }
        let mut remaining = len;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let n = file.read(&mut chunk).await.map_err(EngineError::Io)?;
            if n == 0 {
                return Err(EngineError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while streaming",
                )));
            }
            self.write_all_deadline(&chunk[..n]).await?;
            remaining = remaining.saturating_sub(n as u64);
        }
        Ok(())
    }

    /// Error response body: configured error page when present, minimal text
    /// otherwise.
    async fn fill_error_body(&self, res: &mut Response, status: u16) {
        if let Some(page) = self.ctx.config.error_pages.get(&status) {
            if let Ok(content) = tokio::fs::read(page).await {
                res.set_header_if_absent("Content-Type", "text/html; charset=utf-8");
                res.body = BodyKind::Bytes(Bytes::from(content));
                return;
            }
        }
        let text = format!("{} {}\n", status, StatusCode(status).reason());
        res.set_header_if_absent("Content-Type", "text/plain; charset=utf-8");
        res.body = BodyKind::Bytes(Bytes::from(text));
    }

    /// Minimal error response used when the exchange failed before or
    /// outside a handler. Always Connection: close.
    async fn write_simple_error(&mut self, status: u16) -> Result<(), EngineError> {
        let mut res = Response::new();
        res.status = Some(StatusCode(status));
        self.fill_error_body(&mut res, status).await;
        let body = match std::mem::take(&mut res.body) {
            BodyKind::Bytes(b) => b,
            _ => Bytes::new(),
        };
        let mut head = ResponseHead::with_headers(StatusCode(status), res.headers().to_vec());
        head.finalize(WireFraming::Length(body.len() as u64), true);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        out.extend_from_slice(&body);
        self.write_all_deadline(&out).await
    }

    async fn write_upgrade_response(&mut self, accept: &str) -> Result<(), EngineError> {
        let mut head = ResponseHead::new(StatusCode::SWITCHING_PROTOCOLS);
        head.add("Upgrade", "websocket");
        head.add("Connection", "Upgrade");
        head.add("Sec-WebSocket-Accept", accept);
        head.finalize(WireFraming::None, false);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        self.write_all_deadline(&out).await
    }

    /// Bounded write: the whole buffer must land within the write timeout,
    /// else the connection is failed (the in-flight response is aborted,
    /// never resumed).
    async fn write_all_deadline(&mut self, data: &[u8]) -> Result<(), EngineError> {
        match timeout(self.ctx.config.write_timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        {
            Err(_) => {
                log::warn!("write timeout, aborting connection");
                Err(EngineError::SilentClose("write timeout"))
            }
            Ok(Err(e)) => {
                log::debug!("write failed: {}", e);
                Err(EngineError::Io(e))
            }
            Ok(Ok(())) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use crate::protocol::http::router::handler_fn;
    use tokio::io::duplex;

    fn context_with(config: ServerConfig, router: Router) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(config, router))
    }

    fn hello_router() -> Router {
        let mut router = Router::new();
        router
            .register(
                &[Method::Get],
                "/hello",
                handler_fn(|_req, res, _conn| {
                    Box::pin(async move {
                        res.render_string("hi");
                        Ok(())
                    })
                }),
                RouteConfig::default(),
            )
            .unwrap();
        router
    }

    /// Feed raw bytes, half-close, collect everything the engine writes.
    async fn drive(ctx: Arc<ServerContext>, input: &[u8]) -> Vec<u8> {
        let (mut client, server) = duplex(256 * 1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(HttpConnection::new(server, None, ctx, stop_rx).serve());
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    fn status_of(wire: &[u8]) -> u16 {
        let text = String::from_utf8_lossy(wire);
        text.split(' ').nth(1).unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn ok_then_clean_eof() {
        let ctx = context_with(ServerConfig::default(), hello_router());
        let wire = drive(ctx, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status_of(&wire), 200);
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("Content-Length: 2"));
        assert!(text.ends_with("hi"));
    }

    #[tokio::test]
    async fn unsupported_version_is_505() {
        let ctx = context_with(ServerConfig::default(), hello_router());
        let wire = drive(ctx, b"GET /hello HTTP/3.0\r\nHost: x\r\n\r\n").await;
        assert_eq!(status_of(&wire), 505);
    }

    #[tokio::test]
    async fn unknown_method_is_501() {
        let ctx = context_with(ServerConfig::default(), hello_router());
        let wire = drive(ctx, b"BREW /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status_of(&wire), 501);
    }

    #[tokio::test]
    async fn conflicting_framing_is_400() {
        let ctx = context_with(ServerConfig::default(), hello_router());
        let wire = drive(
            ctx,
            b"GET /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\nxxxx",
        )
        .await;
        assert_eq!(status_of(&wire), 400);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let config = ServerConfig {
            max_body_bytes: 8,
            ..Default::default()
        };
        let ctx = context_with(config, hello_router());
        let wire = drive(
            ctx,
            b"GET /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 64\r\n\r\n",
        )
        .await;
        assert_eq!(status_of(&wire), 413);
    }

    #[tokio::test]
    async fn partial_head_times_out_with_408() {
        let config = ServerConfig {
            header_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        let ctx = context_with(config, hello_router());
        let (mut client, server) = duplex(64 * 1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(HttpConnection::new(server, None, ctx, stop_rx).serve());
        client.write_all(b"GET /hello HTT").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        assert_eq!(status_of(&out), 408);
    }

    #[tokio::test]
    async fn idle_connection_closes_silently() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        let ctx = context_with(config, hello_router());
        let (mut client, server) = duplex(64 * 1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(HttpConnection::new(server, None, ctx, stop_rx).serve());
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        assert!(out.is_empty(), "no bytes on silent close, got {:?}", out);
    }

    #[tokio::test]
    async fn stalled_body_closes_without_response() {
        // Head complete, body never arrives: close without a status (the
        // handler never ran).
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        let ctx = context_with(config, hello_router());
        let (mut client, server) = duplex(64 * 1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(HttpConnection::new(server, None, ctx, stop_rx).serve());
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nabcd")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn expect_100_continue_interim() {
        let mut router = Router::new();
        router
            .register(
                &[Method::Post],
                "/data",
                handler_fn(|req, res, _conn| {
                    let len = req.body_bytes().len();
                    Box::pin(async move {
                        res.render_string(len.to_string());
                        Ok(())
                    })
                }),
                RouteConfig::default(),
            )
            .unwrap();
        let ctx = context_with(ServerConfig::default(), router);
        let wire = drive(
            ctx,
            b"POST /data HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\nabcd",
        )
        .await;
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\n"));
        assert!(text.contains("HTTP/1.1 200 OK"));
        assert!(text.ends_with("4"));
    }

    #[tokio::test]
    async fn delayed_response_released_out_of_band() {
        let mut router = Router::new();
        router
            .register(
                &[Method::Get],
                "/delay",
                handler_fn(|_req, res, conn| {
                    Box::pin(async move {
                        res.set_delay(true);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            if !conn.has_closed() {
                                conn.response_now(DelayedResponse {
                                    status: StatusCode::OK,
                                    headers: Vec::new(),
                                    body: Bytes::from_static(b"late"),
                                });
                            }
                        });
                        Ok(())
                    })
                }),
                RouteConfig::default(),
            )
            .unwrap();
        let ctx = context_with(ServerConfig::default(), router);
        let wire = drive(ctx, b"GET /delay HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status_of(&wire), 200);
        assert!(String::from_utf8_lossy(&wire).ends_with("late"));
    }

    #[tokio::test]
    async fn handler_failure_is_500_and_close() {
        let mut router = Router::new();
        router
            .register(
                &[Method::Get],
                "/boom",
                handler_fn(|_req, _res, _conn| Box::pin(async { Err("kaput".into()) })),
                RouteConfig::default(),
            )
            .unwrap();
        let ctx = context_with(ServerConfig::default(), router);
        let wire = drive(ctx, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(status_of(&wire), 500);
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("Connection: close"));
    }
}
