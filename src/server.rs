//! The reactor: one thread, one `mio::Poll`, every session multiplexed on
//! top of it.
//!
//! Token layout: token 0 is the listener, token 1 the resolver wake-up,
//! everything above maps into the session slab (a session occupies one
//! slot per socket it owns, so an upstream connection gets its own token
//! pointing at the same session). Timers live in the thread-local wheel in
//! [`crate::timer`]; the poll timeout is derived from its next deadline.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info};

use crate::cache::{AddrCache, ResponseCache, ADDR_CACHE_ENTRIES, RESPONSE_CACHE_ENTRIES};
use crate::ready::Ready;
use crate::resolver::{ResolverPool, DEFAULT_WORKERS};
use crate::session::{Session, SessionResult};
use crate::timer;
use crate::ServerError;

const LISTENER: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const TOKEN_BASE: usize = 2;
const EVENT_CAPACITY: usize = 1024;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// resolver worker threads performing blocking lookups
    pub resolver_workers: usize,
    /// per-session idle timer, restarted on any socket activity
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            resolver_workers: DEFAULT_WORKERS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Reactor-owned resources a session needs while handling its events.
pub struct ServerCtx<'a> {
    pub registry: &'a Registry,
    pub sessions: &'a mut Slab<Rc<RefCell<Session>>>,
    pub response_cache: &'a mut ResponseCache,
    pub addr_cache: &'a mut AddrCache,
    pub resolver: &'a ResolverPool,
}

impl ServerCtx<'_> {
    /// Allocate a token for an upstream socket and register it, pointing
    /// the slot at the owning session.
    pub fn register_backend(
        &mut self,
        session: &Rc<RefCell<Session>>,
        stream: &mut TcpStream,
    ) -> io::Result<Token> {
        let entry = self.sessions.vacant_entry();
        let token = Token(entry.key() + TOKEN_BASE);
        self.registry
            .register(stream, token, Interest::READABLE | Interest::WRITABLE)?;
        entry.insert(session.clone());
        Ok(token)
    }

    /// Release a slab slot, typically when a session drops its upstream.
    pub fn remove_token(&mut self, token: Token) {
        if let Some(key) = token.0.checked_sub(TOKEN_BASE) {
            self.sessions.try_remove(key);
        }
    }
}

pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: Slab<Rc<RefCell<Session>>>,
    resolver: ResolverPool,
    response_cache: ResponseCache,
    addr_cache: AddrCache,
    config: ServerConfig,
}

impl Server {
    /// Bind the listening socket and spin up the resolver pool.
    pub fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Server, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;
        let mut listener = TcpListener::bind(addr).map_err(|error| ServerError::Listen {
            address: addr.to_string(),
            error,
        })?;
        let local_addr = listener.local_addr().map_err(|error| ServerError::Listen {
            address: addr.to_string(),
            error,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Waker)?;
        let resolver = ResolverPool::new(config.resolver_workers, waker);

        Ok(Server {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            local_addr,
            sessions: Slab::new(),
            resolver,
            response_cache: ResponseCache::new(RESPONSE_CACHE_ENTRIES),
            addr_cache: AddrCache::new(ADDR_CACHE_ENTRIES),
            config,
        })
    }

    /// The bound address, useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop. Only returns on a poll failure; per-session
    /// errors never escape their session.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            "listening on {} ({} resolver workers, {:?} idle timeout)",
            self.local_addr, self.config.resolver_workers, self.config.idle_timeout
        );

        loop {
            let poll_timeout = timer::poll_timeout();
            if let Err(error) = self.poll.poll(&mut self.events, poll_timeout) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Run(error));
            }

            let batch: Vec<(Token, Ready)> = self
                .events
                .iter()
                .map(|event| (event.token(), Ready::from(event)))
                .collect();

            for (token, events) in batch {
                match token {
                    LISTENER => self.accept_clients(),
                    WAKER_TOKEN => self.handle_resolver_answers(),
                    token => self.dispatch(token, events),
                }
            }

            self.handle_timeouts();
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.sessions.vacant_entry();
                    let token = Token(entry.key() + TOKEN_BASE);
                    if let Err(error) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!("could not register client socket from {peer}: {error}");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!("client connected from {peer} (token {})", token.0);
                    entry.insert(Rc::new(RefCell::new(Session::new(
                        stream,
                        token,
                        self.config.idle_timeout,
                    ))));
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    // accept failures are not fatal to the proxy
                    error!("could not accept a client connection: {error}");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, events: Ready) {
        let Some(key) = token.0.checked_sub(TOKEN_BASE) else {
            return;
        };
        let Some(session) = self.sessions.get(key).cloned() else {
            return;
        };

        let result = {
            let mut guard = session.borrow_mut();
            guard.update_readiness(token, events);
            let Server {
                poll,
                sessions,
                response_cache,
                addr_cache,
                resolver,
                ..
            } = self;
            let mut ctx = ServerCtx {
                registry: poll.registry(),
                sessions,
                response_cache,
                addr_cache,
                resolver,
            };
            guard.ready(&session, &mut ctx)
        };

        if result == SessionResult::Close {
            self.close_session(&session);
        }
    }

    /// The resolver waker fired: drain every posted answer (wakes
    /// coalesce) and resume the sessions that were waiting on them.
    fn handle_resolver_answers(&mut self) {
        for resolution in self.resolver.drain_answers() {
            if resolution.is_canceled() {
                continue;
            }
            let Some(key) = resolution.token().0.checked_sub(TOKEN_BASE) else {
                continue;
            };
            let Some(session) = self.sessions.get(key).cloned() else {
                continue;
            };
            // the slot may have been recycled since the lookup was queued
            let owned = session
                .borrow()
                .pending_resolution()
                .map(|pending| Arc::ptr_eq(pending, &resolution))
                .unwrap_or(false);
            if !owned {
                continue;
            }

            let result = {
                let mut guard = session.borrow_mut();
                let Server {
                    poll,
                    sessions,
                    response_cache,
                    addr_cache,
                    resolver,
                    ..
                } = self;
                let mut ctx = ServerCtx {
                    registry: poll.registry(),
                    sessions,
                    response_cache,
                    addr_cache,
                    resolver,
                };
                match guard.resolution_ready(&session, &mut ctx, &resolution) {
                    SessionResult::Continue => guard.ready(&session, &mut ctx),
                    SessionResult::Close => SessionResult::Close,
                }
            };

            if result == SessionResult::Close {
                self.close_session(&session);
            }
        }
    }

    fn handle_timeouts(&mut self) {
        for token in timer::expired_tokens(Instant::now()) {
            let Some(key) = token.0.checked_sub(TOKEN_BASE) else {
                continue;
            };
            if let Some(session) = self.sessions.get(key).cloned() {
                info!("idle timeout on token {}, closing session", token.0);
                session.borrow_mut().timeout_triggered();
                self.close_session(&session);
            }
        }
    }

    fn close_session(&mut self, session: &Rc<RefCell<Session>>) {
        let (frontend_token, backend_token) = {
            let mut guard = session.borrow_mut();
            guard.close(self.poll.registry());
            (guard.frontend_token(), guard.backend_token())
        };
        if let Some(key) = frontend_token.0.checked_sub(TOKEN_BASE) {
            self.sessions.try_remove(key);
        }
        if let Some(token) = backend_token {
            if let Some(key) = token.0.checked_sub(TOKEN_BASE) {
                self.sessions.try_remove(key);
            }
        }
    }
}
