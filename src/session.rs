//! Per-connection proxy state machine.
//!
//! A [`Session`] owns the client socket, the optional upstream socket, the
//! request/response accumulators and one write queue per direction. The
//! event loop feeds it readiness events and the session advances through
//! the proxy cycle: read request → resolve → connect (or reuse) upstream →
//! write request → read response → stream/cache → idle again. `CONNECT`
//! switches the whole session into an opaque tunnel.
//!
//! Upstream read behaviour is a tagged mode rather than swappable
//! callbacks: `Forward` streams bytes through, `Validating` holds them
//! back until the revalidation status is known, `Draining` discards the
//! tail of a revalidation response, `Tunnel` is the blind copier.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use mio::net::TcpStream;
use mio::{Registry, Token};
use rusty_ulid::Ulid;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{FlushResult, WriteQueue};
use crate::cache::{response_key, CachedResponse};
use crate::parser::{ParseState, Request, Response, DEFAULT_PORT};
use crate::ready::{Ready, Readiness};
use crate::resolver::Resolution;
use crate::server::ServerCtx;
use crate::socket::{socket_read, SocketResult};
use crate::timer::TimeoutContainer;
use crate::{BUFFER_SIZE, MAX_LOOP_ITERATIONS};

pub const ANSWER_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const ANSWER_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// This macro is defined uniquely in this module to help the tracking of
/// session issues inside sluice
macro_rules! log_context {
    ($self:expr) => {
        format!(
            "SLUICE-H1\t{}\tSession(front={}, back={})",
            $self.id,
            $self.frontend_token.0,
            $self
                .backend_token
                .map(|token| token.0.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
        )
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionResult {
    Continue,
    Close,
}

/// How bytes read from the upstream socket are handled.
enum BackendMode {
    /// stream straight through to the client
    Forward,
    /// conditional GET sent, holding bytes until the status is known
    Validating(CachedResponse),
    /// cached body replayed, discarding the rest of the revalidation answer
    Draining,
    /// opaque bidirectional copy after a CONNECT handshake
    Tunnel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackendStatus {
    NotConnected,
    Connecting,
    Connected,
}

/// The upstream endpoint a session is currently bound to. Kept across
/// requests so a matching `host:port` can reuse the open socket.
struct Origin {
    host: String,
    port: u16,
    /// origin-form URI of the in-flight request, the response-cache key
    uri: String,
}

impl Origin {
    fn host_header(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub struct Session {
    id: Ulid,
    frontend_token: Token,
    frontend_socket: TcpStream,
    frontend_readiness: Readiness,
    backend_token: Option<Token>,
    backend_socket: Option<TcpStream>,
    backend_readiness: Readiness,
    backend_status: BackendStatus,
    backend_mode: BackendMode,
    request: Option<Request>,
    response: Option<Response>,
    front_queue: WriteQueue,
    back_queue: WriteQueue,
    origin: Option<Origin>,
    pending_resolution: Option<Arc<Resolution>>,
    timeout: TimeoutContainer,
    /// current request is a CONNECT, upstream success turns into a tunnel
    is_connect: bool,
    /// current exchange started as a GET, the only cacheable method
    request_is_get: bool,
    /// a final answer is queued, close once it is flushed
    closing: bool,
}

impl Session {
    pub fn new(socket: TcpStream, token: Token, idle_timeout: Duration) -> Session {
        Session {
            id: Ulid::generate(),
            frontend_token: token,
            frontend_socket: socket,
            frontend_readiness: Readiness {
                interest: Ready::READABLE | Ready::HUP | Ready::ERROR,
                event: Ready::EMPTY,
            },
            backend_token: None,
            backend_socket: None,
            backend_readiness: Readiness::new(),
            backend_status: BackendStatus::NotConnected,
            backend_mode: BackendMode::Forward,
            request: None,
            response: None,
            front_queue: WriteQueue::new(),
            back_queue: WriteQueue::new(),
            origin: None,
            pending_resolution: None,
            timeout: TimeoutContainer::new(idle_timeout, token),
            is_connect: false,
            request_is_get: false,
            closing: false,
        }
    }

    pub fn frontend_token(&self) -> Token {
        self.frontend_token
    }

    pub fn backend_token(&self) -> Option<Token> {
        self.backend_token
    }

    /// The resolution this session is waiting on, if any.
    pub fn pending_resolution(&self) -> Option<&Arc<Resolution>> {
        self.pending_resolution.as_ref()
    }

    /// The idle timer fired; the wheel already dropped the entry.
    pub fn timeout_triggered(&mut self) {
        self.timeout.triggered();
    }

    /// Record kernel events for one of the session's sockets.
    pub fn update_readiness(&mut self, token: Token, events: Ready) {
        if token == self.frontend_token {
            self.frontend_readiness.event |= events;
        } else if self.backend_token == Some(token) {
            self.backend_readiness.event |= events;
        }
    }

    /// Run the state machine until every actionable event is consumed.
    pub fn ready(&mut self, me: &Rc<RefCell<Session>>, ctx: &mut ServerCtx) -> SessionResult {
        if matches!(self.backend_mode, BackendMode::Tunnel) {
            return self.tunnel_ready();
        }

        if self.backend_status == BackendStatus::Connecting
            && !self.backend_readiness.event.is_empty()
        {
            let event = self.backend_readiness.event;
            if (event.is_hup() || event.is_error()) && !self.test_backend_socket() {
                error!(
                    "{} could not connect to upstream: {}",
                    log_context!(self),
                    self.take_backend_error()
                );
                return SessionResult::Close;
            }
            debug!("{} upstream connected", log_context!(self));
            self.backend_status = BackendStatus::Connected;
            if self.is_connect {
                return self.establish_tunnel();
            }
            self.backend_readiness.interest.insert(Ready::READABLE);
        }

        if self.frontend_readiness.event.is_hup() {
            debug!("{} client hung up", log_context!(self));
            return SessionResult::Close;
        }

        let mut counter = 0;
        while counter < MAX_LOOP_ITERATIONS {
            let frontend_interest = self.frontend_readiness.filter_interest();
            let backend_interest = self.backend_readiness.filter_interest();
            trace!(
                "{} frontend {:?} backend {:?}",
                log_context!(self),
                frontend_interest,
                backend_interest,
            );

            if frontend_interest.is_empty() && backend_interest.is_empty() {
                break;
            }

            if frontend_interest.is_readable()
                && self.readable(me, ctx) == SessionResult::Close
            {
                return SessionResult::Close;
            }

            if backend_interest.is_writable() && self.backend_writable() == SessionResult::Close {
                return SessionResult::Close;
            }

            if backend_interest.is_readable()
                && self.backend_readable(ctx) == SessionResult::Close
            {
                return SessionResult::Close;
            }

            if frontend_interest.is_writable() && self.writable() == SessionResult::Close {
                return SessionResult::Close;
            }

            if frontend_interest.is_error() {
                error!("{} client socket error", log_context!(self));
                return SessionResult::Close;
            }

            // only act on a hang-up once the readable side is drained,
            // there may still be response bytes sitting in the socket
            if (backend_interest.is_hup() || backend_interest.is_error())
                && !self.backend_readiness.event.is_readable()
            {
                self.backend_eof(ctx);
            }

            counter += 1;
        }

        if counter == MAX_LOOP_ITERATIONS {
            error!(
                "{} handling session went through {} iterations, closing",
                log_context!(self),
                MAX_LOOP_ITERATIONS
            );
            return SessionResult::Close;
        }

        SessionResult::Continue
    }

    /// A resolver answer arrived for this session.
    pub fn resolution_ready(
        &mut self,
        me: &Rc<RefCell<Session>>,
        ctx: &mut ServerCtx,
        resolution: &Arc<Resolution>,
    ) -> SessionResult {
        self.pending_resolution = None;
        match resolution.addr() {
            None => {
                warn!(
                    "{} resolution of {}:{} failed, answering 502",
                    log_context!(self),
                    resolution.host(),
                    resolution.port()
                );
                self.set_answer_close(ANSWER_502);
                SessionResult::Continue
            }
            Some(addr) => {
                ctx.addr_cache.put(resolution.host(), resolution.port(), addr);
                self.connect_backend(me, ctx, resolution.host().to_string(), resolution.port(), addr)
            }
        }
    }

    /// Tear down OS resources. The server removes the slab entries.
    pub fn close(&mut self, registry: &Registry) {
        if let Some(resolution) = self.pending_resolution.take() {
            resolution.cancel();
        }
        self.timeout.cancel();
        if let Some(mut socket) = self.backend_socket.take() {
            let _ = registry.deregister(&mut socket);
        }
        let _ = registry.deregister(&mut self.frontend_socket);
        debug!("{} session closed", log_context!(self));
    }

    fn readable(&mut self, me: &Rc<RefCell<Session>>, ctx: &mut ServerCtx) -> SessionResult {
        self.timeout.reset();

        let mut buffer = [0u8; BUFFER_SIZE];
        let (size, status) = socket_read(&mut self.frontend_socket, &mut buffer);
        if size > 0 {
            trace!("{} read {} client bytes", log_context!(self), size);
            match &mut self.request {
                Some(request) => request.add_part(&buffer[..size]),
                None => self.request = Some(Request::new(&buffer[..size])),
            }
        }

        match status {
            SocketResult::Closed => {
                debug!("{} EOF from client", log_context!(self));
                return SessionResult::Close;
            }
            SocketResult::Error => {
                error!("{} client read error", log_context!(self));
                return SessionResult::Close;
            }
            SocketResult::WouldBlock => {
                self.frontend_readiness.event.remove(Ready::READABLE);
            }
            SocketResult::Continue => {}
        }

        match self.request.as_ref().map(Request::state) {
            Some(ParseState::Bad) => {
                warn!("{} unparseable request, answering 400", log_context!(self));
                self.set_answer_close(ANSWER_400);
                SessionResult::Continue
            }
            Some(ParseState::FullBody) => self.dispatch_request(me, ctx),
            _ => SessionResult::Continue,
        }
    }

    /// A complete request is buffered: pick the upstream and move on.
    fn dispatch_request(&mut self, me: &Rc<RefCell<Session>>, ctx: &mut ServerCtx) -> SessionResult {
        let (target, is_connect, uri) = {
            let request = self.request.as_ref().expect("dispatch without a request");
            (
                request.host(),
                request.method() == Some(&Method::CONNECT),
                request.uri().unwrap_or_else(|| "/".to_string()),
            )
        };
        let Some((host, port)) = target else {
            warn!("{} request without a usable authority", log_context!(self));
            self.set_answer_close(ANSWER_400);
            return SessionResult::Continue;
        };
        self.is_connect = is_connect;

        // one request in flight at a time: stop reading the client until
        // the response cycle finishes
        self.frontend_readiness.interest.remove(Ready::READABLE);

        if !is_connect {
            let reusable = self.backend_socket.is_some()
                && self
                    .origin
                    .as_ref()
                    .map(|origin| origin.host == host && origin.port == port)
                    .unwrap_or(false);
            if reusable {
                debug!(
                    "{} reusing upstream connection to {}:{}",
                    log_context!(self),
                    host,
                    port
                );
                if let Some(origin) = self.origin.as_mut() {
                    origin.uri = uri;
                }
                return self.make_request(ctx);
            }
        }

        if self.backend_socket.is_some() {
            self.reset_backend(ctx);
        }

        if !is_connect {
            if let Some(addr) = ctx.addr_cache.get(&host, port) {
                debug!(
                    "{} address cache hit for {}:{}",
                    log_context!(self),
                    host,
                    port
                );
                return self.connect_backend(me, ctx, host, port, addr);
            }
        }

        debug!(
            "{} queueing resolution of {}:{}",
            log_context!(self),
            host,
            port
        );
        let resolution = Arc::new(Resolution::new(host, port, self.frontend_token));
        self.pending_resolution = Some(resolution.clone());
        ctx.resolver.submit(resolution);
        SessionResult::Continue
    }

    fn connect_backend(
        &mut self,
        me: &Rc<RefCell<Session>>,
        ctx: &mut ServerCtx,
        host: String,
        port: u16,
        addr: std::net::SocketAddr,
    ) -> SessionResult {
        let Some(request) = self.request.as_ref() else {
            error!("{} connecting without a request", log_context!(self));
            return SessionResult::Close;
        };
        let uri = request.uri().unwrap_or_else(|| "/".to_string());

        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(error) => {
                error!(
                    "{} could not open upstream socket to {}: {}",
                    log_context!(self),
                    addr,
                    error
                );
                return SessionResult::Close;
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            debug!("{} could not set nodelay upstream: {}", log_context!(self), error);
        }

        let token = match ctx.register_backend(me, &mut stream) {
            Ok(token) => token,
            Err(error) => {
                error!(
                    "{} could not register upstream socket: {}",
                    log_context!(self),
                    error
                );
                return SessionResult::Close;
            }
        };

        debug!(
            "{} connecting upstream {}:{} at {}",
            log_context!(self),
            host,
            port,
            addr
        );
        self.backend_token = Some(token);
        self.backend_socket = Some(stream);
        self.backend_status = BackendStatus::Connecting;
        self.backend_readiness = Readiness {
            interest: Ready::WRITABLE | Ready::HUP | Ready::ERROR,
            event: Ready::EMPTY,
        };
        self.origin = Some(Origin { host, port, uri });

        if self.is_connect {
            // nothing to forward, the 200 goes out once the connect lands
            return SessionResult::Continue;
        }
        self.make_request(ctx)
    }

    /// Send the buffered request upstream, or a conditional revalidation of
    /// the cached response when one exists for this key.
    fn make_request(&mut self, ctx: &mut ServerCtx) -> SessionResult {
        let Some(request) = self.request.take() else {
            error!("{} no request to forward", log_context!(self));
            return SessionResult::Close;
        };
        let Some(origin) = self.origin.as_ref() else {
            error!("{} no upstream bound", log_context!(self));
            return SessionResult::Close;
        };

        self.request_is_get = request.method() == Some(&Method::GET);
        let key = response_key(&origin.host, origin.port, &origin.uri);

        if self.request_is_get && !request.is_validating() {
            if let Some(cached) = ctx.response_cache.get(&key) {
                let cached = cached.clone();
                info!(
                    "{} cache hit for {}, revalidating against origin",
                    log_context!(self),
                    key
                );
                self.back_queue
                    .enqueue(cached.validating_request(&origin.uri, &origin.host_header()));
                self.backend_mode = BackendMode::Validating(cached);
                self.sync_back_interest();
                self.backend_readiness.interest.insert(Ready::READABLE);
                return SessionResult::Continue;
            }
        }

        self.backend_mode = BackendMode::Forward;
        self.back_queue.enqueue(request.wire());
        self.sync_back_interest();
        self.backend_readiness.interest.insert(Ready::READABLE);
        SessionResult::Continue
    }

    fn backend_writable(&mut self) -> SessionResult {
        self.timeout.reset();
        let Some(socket) = self.backend_socket.as_mut() else {
            self.backend_readiness.event = Ready::EMPTY;
            return SessionResult::Continue;
        };
        let (size, result) = self.back_queue.flush(socket);
        if size > 0 {
            trace!("{} wrote {} bytes upstream", log_context!(self), size);
        }
        match result {
            FlushResult::Drained => self.sync_back_interest(),
            FlushResult::WouldBlock => self.backend_readiness.event.remove(Ready::WRITABLE),
            FlushResult::Error => {
                error!("{} upstream write error", log_context!(self));
                return SessionResult::Close;
            }
        }
        SessionResult::Continue
    }

    fn backend_readable(&mut self, ctx: &mut ServerCtx) -> SessionResult {
        self.timeout.reset();
        let Some(socket) = self.backend_socket.as_mut() else {
            self.backend_readiness.event = Ready::EMPTY;
            return SessionResult::Continue;
        };

        let mut buffer = [0u8; BUFFER_SIZE];
        let (size, status) = socket_read(socket, &mut buffer);
        if size > 0 {
            trace!("{} read {} upstream bytes", log_context!(self), size);
            let chunk = &buffer[..size];
            match self.backend_mode {
                BackendMode::Forward | BackendMode::Validating(_) | BackendMode::Draining => {
                    match &mut self.response {
                        Some(response) => response.add_part(chunk),
                        None => self.response = Some(Response::new(chunk)),
                    }
                }
                BackendMode::Tunnel => unreachable!("tunnel bytes handled in tunnel_ready"),
            }
            if matches!(self.backend_mode, BackendMode::Forward) {
                self.front_queue.enqueue(chunk.to_vec());
                self.sync_front_interest();
            }
        }

        let progress = self.response_progress(ctx);
        if progress == SessionResult::Close {
            return SessionResult::Close;
        }

        match status {
            SocketResult::Closed => self.backend_eof(ctx),
            SocketResult::Error => {
                error!("{} upstream read error", log_context!(self));
                SessionResult::Close
            }
            SocketResult::WouldBlock => {
                self.backend_readiness.event.remove(Ready::READABLE);
                SessionResult::Continue
            }
            SocketResult::Continue => SessionResult::Continue,
        }
    }

    /// Inspect the response parse state and act according to the current
    /// backend mode.
    fn response_progress(&mut self, ctx: &mut ServerCtx) -> SessionResult {
        let Some(state) = self.response.as_ref().map(Response::state) else {
            return SessionResult::Continue;
        };

        if state == ParseState::Bad {
            error!("{} unparseable upstream response", log_context!(self));
            return SessionResult::Close;
        }

        match &self.backend_mode {
            BackendMode::Forward => {
                if state == ParseState::FullBody {
                    self.complete_response(ctx);
                }
            }
            BackendMode::Validating(cached) => {
                let code = match self.response.as_ref().and_then(Response::code) {
                    Some(code) if state >= ParseState::FirstLineDone => code,
                    _ => return SessionResult::Continue,
                };
                if code == 200 {
                    info!(
                        "{} origin has a fresh copy, streaming it through",
                        log_context!(self)
                    );
                    let raw = self
                        .response
                        .as_ref()
                        .map(|response| response.raw().to_vec())
                        .unwrap_or_default();
                    self.front_queue.enqueue(raw);
                    self.sync_front_interest();
                    self.backend_mode = BackendMode::Forward;
                    if state == ParseState::FullBody {
                        self.complete_response(ctx);
                    }
                } else {
                    info!(
                        "{} origin answered {}, replaying cached response",
                        log_context!(self),
                        code
                    );
                    let wire = cached.wire().to_vec();
                    self.front_queue.enqueue(wire);
                    self.sync_front_interest();
                    if state == ParseState::FullBody {
                        self.finish_drain(ctx);
                    } else {
                        self.backend_mode = BackendMode::Draining;
                    }
                }
            }
            BackendMode::Draining => {
                if state == ParseState::FullBody {
                    self.finish_drain(ctx);
                }
            }
            BackendMode::Tunnel => {}
        }
        SessionResult::Continue
    }

    /// The response is complete: store it if it qualifies, go back to
    /// reading requests, keep the upstream socket for reuse.
    fn complete_response(&mut self, ctx: &mut ServerCtx) {
        let Some(response) = self.response.take() else {
            return;
        };
        if self.request_is_get && response.is_cacheable() {
            if let Some(origin) = self.origin.as_ref() {
                let key = response_key(&origin.host, origin.port, &origin.uri);
                if let Some(entry) = CachedResponse::from_response(&response) {
                    info!(
                        "{} caching response for {} (validator: {:?})",
                        log_context!(self),
                        key,
                        response.header("etag").or_else(|| response.header("last-modified")),
                    );
                    ctx.response_cache.put(key, entry);
                }
            }
        }
        self.frontend_readiness.interest.insert(Ready::READABLE);
        self.backend_mode = BackendMode::Forward;
    }

    /// The revalidation answer has been fully received (or abandoned):
    /// drop the upstream socket instead of trying to reuse a connection
    /// whose response we only partly consumed.
    fn finish_drain(&mut self, ctx: &mut ServerCtx) {
        self.response = None;
        self.reset_backend(ctx);
        self.frontend_readiness.interest.insert(Ready::READABLE);
        self.backend_mode = BackendMode::Forward;
    }

    /// Upstream closed its end: finish what framing allows, maybe cache,
    /// and return to the idle state with no upstream bound.
    fn backend_eof(&mut self, ctx: &mut ServerCtx) -> SessionResult {
        debug!("{} EOF from upstream", log_context!(self));
        match &self.backend_mode {
            BackendMode::Validating(cached) => {
                // origin went away before answering the revalidation, the
                // cached copy is the best answer the client can get
                warn!(
                    "{} upstream EOF during revalidation, replaying cached response",
                    log_context!(self)
                );
                let wire = cached.wire().to_vec();
                self.front_queue.enqueue(wire);
                self.sync_front_interest();
                self.response = None;
            }
            BackendMode::Draining => {
                self.response = None;
            }
            BackendMode::Forward => {
                if let Some(response) = self.response.as_mut() {
                    response.finalize();
                    if response.state() == ParseState::FullBody {
                        self.complete_response(ctx);
                    } else {
                        warn!(
                            "{} upstream closed before the response was complete",
                            log_context!(self)
                        );
                        self.response = None;
                    }
                }
            }
            BackendMode::Tunnel => {}
        }
        self.reset_backend(ctx);
        self.frontend_readiness.interest.insert(Ready::READABLE);
        self.backend_mode = BackendMode::Forward;
        SessionResult::Continue
    }

    fn writable(&mut self) -> SessionResult {
        self.timeout.reset();
        let (size, result) = self.front_queue.flush(&mut self.frontend_socket);
        if size > 0 {
            trace!("{} wrote {} bytes to client", log_context!(self), size);
        }
        match result {
            FlushResult::Drained => {
                self.sync_front_interest();
                if self.closing {
                    debug!("{} final answer flushed, closing", log_context!(self));
                    return SessionResult::Close;
                }
            }
            FlushResult::WouldBlock => self.frontend_readiness.event.remove(Ready::WRITABLE),
            FlushResult::Error => {
                error!("{} client write error", log_context!(self));
                return SessionResult::Close;
            }
        }
        SessionResult::Continue
    }

    /// The CONNECT target is reachable: acknowledge to the client and turn
    /// the session into a blind byte copier.
    fn establish_tunnel(&mut self) -> SessionResult {
        info!("{} tunnel established", log_context!(self));
        self.front_queue.enqueue(TUNNEL_ESTABLISHED.to_vec());
        self.sync_front_interest();
        self.frontend_readiness.interest.insert(Ready::READABLE);
        self.backend_readiness.interest = Ready::READABLE | Ready::HUP | Ready::ERROR;
        self.backend_mode = BackendMode::Tunnel;
        self.request = None;
        self.tunnel_ready()
    }

    /// Event pump for tunnel mode: copy bytes both ways until either side
    /// goes away.
    fn tunnel_ready(&mut self) -> SessionResult {
        let mut counter = 0;
        while counter < MAX_LOOP_ITERATIONS {
            let frontend_interest = self.frontend_readiness.filter_interest();
            let backend_interest = self.backend_readiness.filter_interest();

            if frontend_interest.is_empty() && backend_interest.is_empty() {
                break;
            }

            if frontend_interest.is_readable() {
                self.timeout.reset();
                let mut buffer = [0u8; BUFFER_SIZE];
                let (size, status) = socket_read(&mut self.frontend_socket, &mut buffer);
                if size > 0 {
                    self.back_queue.enqueue(buffer[..size].to_vec());
                    self.sync_back_interest();
                }
                match status {
                    SocketResult::Closed => {
                        debug!("{} tunnel client EOF", log_context!(self));
                        self.flush_tunnel_tail();
                        return SessionResult::Close;
                    }
                    SocketResult::Error => return SessionResult::Close,
                    SocketResult::WouldBlock => {
                        self.frontend_readiness.event.remove(Ready::READABLE)
                    }
                    SocketResult::Continue => {}
                }
            }

            if backend_interest.is_readable() {
                self.timeout.reset();
                let Some(socket) = self.backend_socket.as_mut() else {
                    return SessionResult::Close;
                };
                let mut buffer = [0u8; BUFFER_SIZE];
                let (size, status) = socket_read(socket, &mut buffer);
                if size > 0 {
                    self.front_queue.enqueue(buffer[..size].to_vec());
                    self.sync_front_interest();
                }
                match status {
                    SocketResult::Closed => {
                        debug!("{} tunnel upstream EOF", log_context!(self));
                        self.flush_tunnel_tail();
                        return SessionResult::Close;
                    }
                    SocketResult::Error => return SessionResult::Close,
                    SocketResult::WouldBlock => {
                        self.backend_readiness.event.remove(Ready::READABLE)
                    }
                    SocketResult::Continue => {}
                }
            }

            if backend_interest.is_writable() && self.backend_writable() == SessionResult::Close {
                return SessionResult::Close;
            }

            if frontend_interest.is_writable() && self.writable() == SessionResult::Close {
                return SessionResult::Close;
            }

            let frontend_gone = (frontend_interest.is_hup() || frontend_interest.is_error())
                && !self.frontend_readiness.event.is_readable();
            let backend_gone = (backend_interest.is_hup() || backend_interest.is_error())
                && !self.backend_readiness.event.is_readable();
            if frontend_gone || backend_gone {
                debug!("{} tunnel peer went away", log_context!(self));
                self.flush_tunnel_tail();
                return SessionResult::Close;
            }

            counter += 1;
        }
        SessionResult::Continue
    }

    /// Best-effort flush of both queues before tearing a tunnel down, so
    /// bytes that raced the EOF still reach the other side.
    fn flush_tunnel_tail(&mut self) {
        if let Some(socket) = self.backend_socket.as_mut() {
            let _ = self.back_queue.flush(socket);
        }
        let _ = self.front_queue.flush(&mut self.frontend_socket);
    }

    /// Queue a final wire answer for the client and close once it drains.
    fn set_answer_close(&mut self, answer: &[u8]) {
        self.front_queue.enqueue(answer.to_vec());
        self.sync_front_interest();
        self.frontend_readiness.interest.remove(Ready::READABLE);
        self.closing = true;
    }

    /// Drop the upstream socket and everything bound to it.
    fn reset_backend(&mut self, ctx: &mut ServerCtx) {
        if let Some(mut socket) = self.backend_socket.take() {
            let _ = ctx.registry.deregister(&mut socket);
        }
        if let Some(token) = self.backend_token.take() {
            ctx.remove_token(token);
        }
        self.backend_status = BackendStatus::NotConnected;
        self.backend_readiness = Readiness::new();
        self.back_queue.clear();
        self.origin = None;
    }

    fn sync_front_interest(&mut self) {
        if self.front_queue.is_empty() {
            self.frontend_readiness.interest.remove(Ready::WRITABLE);
        } else {
            self.frontend_readiness.interest.insert(Ready::WRITABLE);
        }
    }

    fn sync_back_interest(&mut self) {
        if self.back_queue.is_empty() {
            self.backend_readiness.interest.remove(Ready::WRITABLE);
        } else {
            self.backend_readiness.interest.insert(Ready::WRITABLE);
        }
    }

    fn test_backend_socket(&self) -> bool {
        self.backend_socket
            .as_ref()
            .map(|socket| socket.peer_addr().is_ok())
            .unwrap_or(false)
    }

    fn take_backend_error(&self) -> String {
        self.backend_socket
            .as_ref()
            .and_then(|socket| socket.take_error().ok().flatten())
            .map(|error| error.to_string())
            .unwrap_or_else(|| "connection refused".to_string())
    }
}
