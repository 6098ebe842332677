//! Server orchestration: listen, dispatch, drain.
//!
//! The server owns the listening socket and the lifecycle state machine
//! `Starting -> Opened -> Stopping -> Stopped` (strictly forward). Each
//! connection runs as its own task; each request races the service hooks
//! against the response timeout and the server stop signal, so a stuck
//! handler can never wedge the connection and shutdown never waits on
//! handler cooperation.

use std::fmt;
use std::future::Future;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use async_io::{Async, Timer};
use futures_lite::io::BufReader;
use futures_lite::{future, AsyncRead, AsyncWrite};
use http_types::{bail, Error, Method, StatusCode, Url};

use crate::h2::{CompatResponse, PushCapability, PushSession};
use crate::reply::{Reply, ReplyBody};
use crate::request::Request;
use crate::service::Services;
use crate::stop::{StopSource, StopToken};
use crate::upgrade::{RawDuplex, WebsocketGate};

pub(crate) mod decode;
pub(crate) mod encode;
mod origin;
#[cfg(unix)]
pub(crate) mod signals;

use decode::{ConnectionInfo, Decoded, Reclaim};
use encode::WriteOutcome;

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `SIGHUP` was received.
    Hangup,
    /// `SIGINT` was received.
    Interrupt,
    /// `SIGTERM` was received.
    Terminate,
    /// The host process is exiting.
    ProcessExit,
    /// [`Server::stop`] was called directly.
    Manual,
    /// An unhandled request error with
    /// [`stop_on_internal_error`][ServerConfig::stop_on_internal_error] set.
    InternalError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Hangup => "hangup",
            StopReason::Interrupt => "interrupt",
            StopReason::Terminate => "terminate",
            StopReason::ProcessExit => "process exit",
            StopReason::Manual => "manual",
            StopReason::InternalError => "internal error",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle states. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// Constructed, not yet bound.
    Starting,
    /// Bound and accepting connections.
    Opened,
    /// Draining in-flight work.
    Stopping,
    /// Fully shut down.
    Stopped,
}

/// Where the server is reachable, reported once the listener is bound.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// The bound address, with the real port for ephemeral binds.
    pub addr: SocketAddr,
    /// Canonical origin for the configured hostname.
    pub local_origin: String,
    /// Origin reachable from the local network, for wildcard binds.
    pub internal_origin: Option<String>,
    /// Externally visible origin, when one was configured.
    pub external_origin: Option<String>,
}

/// Which process signals stop the server.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Stop on `SIGHUP`.
    pub hangup: bool,
    /// Stop on `SIGINT`.
    pub interrupt: bool,
    /// Stop on `SIGTERM`.
    pub terminate: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            hangup: true,
            interrupt: true,
            terminate: true,
        }
    }
}

impl SignalConfig {
    /// Ignore every signal.
    pub fn none() -> Self {
        Self {
            hangup: false,
            interrupt: false,
            terminate: false,
        }
    }
}

/// Configure the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname to bind and to display in origins. Defaults to
    /// `localhost`.
    pub hostname: String,
    /// Port to bind. `0` asks the OS for an ephemeral port. Defaults to
    /// `8080`.
    pub port: u16,
    /// Bind the wildcard address and accept traffic on every interface.
    pub accept_any_ip: bool,
    /// Whether TLS is terminated in front of this server. Affects origin
    /// schemes and [`Request::secure`].
    pub secure: bool,
    /// Externally visible origin, when the server sits behind a proxy.
    pub public_origin: Option<String>,
    /// How long an unread request body may hold the transport before it
    /// is released. Defaults to 60 seconds.
    pub body_idle_timeout: Option<Duration>,
    /// How long the hook pipeline may take to produce a reply before a
    /// `504` is synthesized. Defaults to 10 minutes.
    pub response_timeout: Option<Duration>,
    /// Stop the whole server when a request error reaches the end of the
    /// `handle_error` chain unhandled.
    pub stop_on_internal_error: bool,
    /// Render error details in `500` bodies instead of an empty payload.
    pub expose_internal_errors: bool,
    /// Process signals wired to [`Server::stop`].
    pub signals: SignalConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 8080,
            accept_any_ip: false,
            secure: false,
            public_origin: None,
            body_idle_timeout: Some(Duration::from_secs(60)),
            response_timeout: Some(Duration::from_secs(600)),
            stop_on_internal_error: false,
            expose_internal_errors: false,
            signals: SignalConfig::default(),
        }
    }
}

/// Window granted to a half-read body before its connection is closed
/// instead of reused, when no idle timeout is configured.
const RECLAIM_GRACE: Duration = Duration::from_secs(60);

type StopCallback =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = http_types::Result<()>> + Send>> + Send>;

/// An embeddable HTTP server.
///
/// Cloning is cheap; every clone drives the same instance.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    config: ServerConfig,
    services: Arc<Services>,
    lifecycle: Mutex<Lifecycle>,
    stop_source: StopSource,
    stop_reason: Mutex<Option<StopReason>>,
    stop_callbacks: Mutex<Vec<StopCallback>>,
    listener: Mutex<Option<Async<TcpListener>>>,
    info: Mutex<Option<ServerInfo>>,
    fatal: Mutex<Option<Error>>,
    // Connection accounting: every connection task holds a clone of
    // `conn_tx`; shutdown drops the original and waits for the receiver
    // to report the channel closed.
    conn_tx: Mutex<Option<Sender<()>>>,
    conn_rx: Receiver<()>,
    // Closed once shutdown has fully finished.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("lifecycle", &*lock(&self.shared.lifecycle))
            .field("info", &*lock(&self.shared.info))
            .finish()
    }
}

impl Server {
    /// Create a server from its configuration and hook registry.
    pub fn new(config: ServerConfig, services: Services) -> Self {
        let (conn_tx, conn_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                config,
                services: Arc::new(services),
                lifecycle: Mutex::new(Lifecycle::Starting),
                stop_source: StopSource::new(),
                stop_reason: Mutex::new(None),
                stop_callbacks: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                info: Mutex::new(None),
                fatal: Mutex::new(None),
                conn_tx: Mutex::new(Some(conn_tx)),
                conn_rx,
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }),
        }
    }

    /// The current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.shared.lifecycle)
    }

    /// A token that trips when the server stops.
    pub fn token(&self) -> StopToken {
        self.shared.stop_source.token()
    }

    /// The listening addresses and origins, once bound.
    pub fn info(&self) -> Option<ServerInfo> {
        lock(&self.shared.info).clone()
    }

    /// Register a callback to run during shutdown. Callbacks run in
    /// registration order; a failing callback is logged and does not
    /// block its siblings.
    pub fn on_stop<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = http_types::Result<()>> + Send + 'static,
    {
        lock(&self.shared.stop_callbacks).push(Box::new(move || Box::pin(callback())));
    }

    /// Bind the listener, wire process signals and run the
    /// `server_listening` hooks. Idempotent.
    pub async fn listen(&self) -> http_types::Result<ServerInfo> {
        self.shared.listen().await
    }

    /// Accept connections until the server stops. Returns the fatal
    /// error when the stop was caused by one.
    pub async fn serve(&self) -> http_types::Result<()> {
        self.shared.serve().await
    }

    /// Serve a single established connection. This is the transport
    /// seam the accept loop itself uses; embedders hand in any cloneable
    /// duplex, `peer` being the remote address when one is known.
    pub async fn serve_connection<IO>(
        &self,
        io: IO,
        peer: Option<SocketAddr>,
    ) -> http_types::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Clone + Send + Sync + Unpin + 'static,
    {
        self.shared.handle_connection(io, peer, None).await
    }

    /// Serve one request arriving over an HTTP/2 compatibility
    /// transport. The platform owns framing; `session` enables server
    /// push for handlers when provided.
    pub async fn serve_compat(
        &self,
        req: Request,
        sink: Box<dyn CompatResponse>,
        session: Option<Arc<dyn PushSession>>,
    ) -> http_types::Result<()> {
        self.shared.serve_compat(req, sink, session).await
    }

    /// Stop the server. The first caller's reason wins; every caller
    /// observes that same reason, and the shutdown side effects run
    /// exactly once.
    pub async fn stop(&self, reason: StopReason) -> StopReason {
        self.shared.stop(reason).await
    }

    /// Resolves once shutdown has fully finished.
    pub async fn stopped(&self) {
        let _ = self.shared.done_rx.recv().await;
    }
}

impl Shared {
    async fn listen(self: &Arc<Self>) -> http_types::Result<ServerInfo> {
        if let Some(info) = lock(&self.info).clone() {
            return Ok(info);
        }
        if *lock(&self.lifecycle) >= Lifecycle::Stopping {
            bail!("server is stopped");
        }

        let binding = origin::resolve(
            &self.config.hostname,
            self.config.port,
            self.config.accept_any_ip,
        )
        .await;
        let listener = Async::<TcpListener>::bind(binding.addr)?;
        let addr = listener.get_ref().local_addr()?;
        let info = origin::server_info(
            &binding,
            addr,
            self.config.secure,
            self.config.public_origin.clone(),
        );

        #[cfg(unix)]
        {
            let shared = Arc::downgrade(self);
            signals::watch(&self.config.signals, move |reason| {
                if let Some(shared) = shared.upgrade() {
                    async_global_executor::spawn(async move {
                        shared.stop(reason).await;
                    })
                    .detach();
                }
            })?;
        }

        *lock(&self.listener) = Some(listener);
        *lock(&self.info) = Some(info.clone());
        self.advance(Lifecycle::Opened);
        log::info!("server listening on {}", info.local_origin);
        self.services.server_listening(&info).await;
        Ok(info)
    }

    async fn serve(self: &Arc<Self>) -> http_types::Result<()> {
        if lock(&self.info).is_none() {
            self.listen().await?;
        }
        let listener = match lock(&self.listener).take() {
            Some(listener) => listener,
            None => bail!("server is already running or stopped"),
        };

        let token = self.stop_source.token();
        loop {
            let accepted = {
                let stopped = async {
                    token.stopped().await;
                    None
                };
                let accept = async { Some(listener.accept().await) };
                future::or(stopped, accept).await
            };
            match accepted {
                None => break,
                Some(Err(err)) => {
                    log::warn!("accept failed: {}", err);
                    future::yield_now().await;
                }
                Some(Ok((stream, peer))) => {
                    let guard = match lock(&self.conn_tx).clone() {
                        Some(guard) => guard,
                        None => break,
                    };
                    log::debug!("accepted connection from {}", peer);
                    let io = async_dup::Arc::new(stream);
                    let shared = self.clone();
                    async_global_executor::spawn(async move {
                        if let Err(err) =
                            shared.handle_connection(io, Some(peer), Some(guard)).await
                        {
                            log::warn!("connection from {} failed: {}", peer, err);
                        }
                    })
                    .detach();
                }
            }
        }
        drop(listener);

        // `stop` drives the drain; wait for it to finish.
        let _ = self.done_rx.recv().await;
        if let Some(err) = lock(&self.fatal).take() {
            return Err(err);
        }
        Ok(())
    }

    async fn stop(&self, reason: StopReason) -> StopReason {
        let (effective, owner) = {
            let mut slot = lock(&self.stop_reason);
            match *slot {
                Some(memoized) => (memoized, false),
                None => {
                    *slot = Some(reason);
                    (reason, true)
                }
            }
        };
        if !owner {
            let _ = self.done_rx.recv().await;
            return effective;
        }

        log::info!("server stopping: {}", effective);
        self.advance(Lifecycle::Stopping);
        // Stops the accept loop and makes every in-flight request
        // observe drain through its own token.
        self.stop_source.stop();
        drop(lock(&self.listener).take());

        let callbacks = mem::take(&mut *lock(&self.stop_callbacks));
        for callback in callbacks {
            if let Err(err) = callback().await {
                log::error!("stop callback failed: {}", err);
            }
        }

        // Wait for connection tasks to write their drain responses.
        drop(lock(&self.conn_tx).take());
        let _ = self.conn_rx.recv().await;

        self.advance(Lifecycle::Stopped);
        self.services.server_stopped(effective).await;
        drop(lock(&self.done_tx).take());
        log::info!("server stopped");
        effective
    }

    async fn handle_connection<IO>(
        self: &Arc<Self>,
        io: IO,
        peer: Option<SocketAddr>,
        guard: Option<Sender<()>>,
    ) -> http_types::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Clone + Send + Sync + Unpin + 'static,
    {
        let server_token = self.stop_source.token();
        let conn_source = StopSource::new();
        let token = StopToken::merged(&server_token, &conn_source.token());
        let info = ConnectionInfo {
            peer,
            secure: self.config.secure,
            body_idle: self.config.body_idle_timeout,
        };

        let mut reader = BufReader::new(io.clone());
        loop {
            let decoded = {
                let stopped = async {
                    server_token.stopped().await;
                    None
                };
                let next =
                    async { Some(decode::decode(reader, io.clone(), token.clone(), &info).await) };
                future::or(stopped, next).await
            };
            let Decoded {
                request,
                keep_alive,
                reclaim,
            } = match decoded {
                None | Some(Ok(None)) => break,
                Some(Ok(Some(decoded))) => decoded,
                Some(Err(err)) => {
                    // Malformed head: refuse best-effort, then drop the
                    // connection.
                    let mut refusal = Reply::new();
                    refusal.set_status(StatusCode::BadRequest);
                    refusal.insert_header("connection", "close");
                    refusal.insert_header("content-length", "0");
                    let mut writer = io.clone();
                    let _ = encode::write_raw_head(&mut writer, &refusal).await;
                    return Err(err);
                }
            };

            if request.is_websocket_upgrade() {
                let reader = match reclaim {
                    Reclaim::Ready(reader) => reader,
                    Reclaim::AfterBody(_) => {
                        // Upgrade requests must not carry a body.
                        let mut refusal = Reply::new();
                        refusal.set_status(StatusCode::BadRequest);
                        refusal.insert_header("connection", "close");
                        let mut writer = io.clone();
                        let _ = encode::write_raw_head(&mut writer, &refusal).await;
                        break;
                    }
                };
                // Upgraded sockets belong to their handler; shutdown
                // does not wait for them.
                drop(guard);
                self.handle_upgrade(request, reader, io).await;
                return Ok(());
            }

            let push = PushCapability::without_session(self.services.clone());
            match self.dispatch(request, push).await {
                Dispatch::Replied { req, reply } => {
                    let reply = self.services.inject_response_headers(&req, reply).await;
                    self.services.response_ready(&req, &reply).await;
                    let mut writer = io.clone();
                    let (outcome, reusable) = encode::write_http1(&mut writer, &req, reply).await;
                    match outcome {
                        WriteOutcome::Ended => {}
                        WriteOutcome::Aborted => {
                            log::trace!("response to {} aborted", req.path());
                            break;
                        }
                        WriteOutcome::Errored(err) => return Err(err),
                    }
                    if !keep_alive || !reusable || server_token.is_stopped() {
                        break;
                    }
                }
                Dispatch::Failed { req, err } => {
                    log::error!("unhandled request error: {}", err);
                    let mut reply = Reply::new();
                    reply.set_status(StatusCode::InternalServerError);
                    if self.config.expose_internal_errors {
                        reply.set_body_string(err.to_string());
                    }
                    reply.insert_header("connection", "close");
                    let mut writer = io.clone();
                    let _ = encode::write_http1(&mut writer, &req, reply).await;
                    self.escalate(err);
                    break;
                }
                Dispatch::TimedOut { method, url } => {
                    let window = self.config.response_timeout.unwrap_or_default();
                    log::warn!(
                        "{} {} produced no response within {:?}",
                        method,
                        url.path(),
                        window
                    );
                    let shadow = Request::new(method, url, StopToken::never());
                    let mut reply = Reply::new();
                    reply.set_status(StatusCode::GatewayTimeout);
                    reply.set_reason(format!("no response within {} seconds", window.as_secs()));
                    reply.insert_header("connection", "close");
                    let mut writer = io.clone();
                    let _ = encode::write_http1(&mut writer, &shadow, reply).await;
                    break;
                }
                Dispatch::Draining { .. } => {
                    let mut reply = Reply::new();
                    reply.set_status(self.drain_status());
                    reply.insert_header("connection", "close");
                    reply.insert_header("content-length", "0");
                    let mut writer = io.clone();
                    let _ = encode::write_raw_head(&mut writer, &reply).await;
                    break;
                }
                Dispatch::Crashed { .. } => {
                    log::error!("request pipeline dropped without responding");
                    let mut reply = Reply::new();
                    reply.set_status(StatusCode::InternalServerError);
                    reply.insert_header("connection", "close");
                    reply.insert_header("content-length", "0");
                    let mut writer = io.clone();
                    let _ = encode::write_raw_head(&mut writer, &reply).await;
                    break;
                }
            }

            reader = match self.reclaim_transport(reclaim, &server_token).await {
                Some(reader) => reader,
                None => break,
            };
        }
        Ok(())
    }

    /// Run the hook pipeline for one request, racing it against the
    /// response timeout and server stop. The pipeline task is detached:
    /// a losing pipeline keeps running in the background and its result
    /// is discarded.
    async fn dispatch(&self, req: Request, push: PushCapability) -> Dispatch {
        let method = req.method();
        let url = req.url().clone();
        let services = self.services.clone();
        let (done_tx, done_rx) = async_channel::bounded(1);
        async_global_executor::spawn(async move {
            let mut push = push;
            let mut req = services.redirect_request(req).await;
            let outcome = match services.handle_request(&mut req, &mut push).await {
                Ok(Some(reply)) => Ok(reply),
                // No hook claimed the request; the writer renders the
                // status-less reply as 404.
                Ok(None) => Ok(Reply::new()),
                Err(err) => match services.handle_error(&err, &req).await {
                    Some(reply) => Ok(reply),
                    None => Err(err),
                },
            };
            let _ = done_tx.send((req, outcome)).await;
        })
        .detach();

        let finished = async {
            match done_rx.recv().await {
                Ok((req, Ok(reply))) => Dispatch::Replied { req, reply },
                Ok((req, Err(err))) => Dispatch::Failed { req, err },
                Err(_) => Dispatch::Crashed {
                    method,
                    url: url.clone(),
                },
            }
        };
        let timeout = async {
            match self.config.response_timeout {
                Some(window) => {
                    Timer::after(window).await;
                }
                None => future::pending().await,
            }
            Dispatch::TimedOut {
                method,
                url: url.clone(),
            }
        };
        let draining = async {
            self.stop_source.token().stopped().await;
            Dispatch::Draining {
                method,
                url: url.clone(),
            }
        };
        future::or(draining, future::or(finished, timeout)).await
    }

    async fn serve_compat(
        self: &Arc<Self>,
        req: Request,
        sink: Box<dyn CompatResponse>,
        session: Option<Arc<dyn PushSession>>,
    ) -> http_types::Result<()> {
        if self.stop_source.is_stopped() {
            return self.write_compat_drain(sink, req.method(), req.url().clone()).await;
        }

        let push = match session {
            Some(session) => PushCapability::new(session, self.services.clone()),
            None => PushCapability::without_session(self.services.clone()),
        };
        match self.dispatch(req, push).await {
            Dispatch::Replied { req, reply } => {
                let reply = self.services.inject_response_headers(&req, reply).await;
                self.services.response_ready(&req, &reply).await;
                match encode::write_to_compat(sink, &req, reply).await {
                    WriteOutcome::Ended | WriteOutcome::Aborted => Ok(()),
                    WriteOutcome::Errored(err) => Err(err),
                }
            }
            Dispatch::Failed { req, err } => {
                log::error!("unhandled request error: {}", err);
                let message = err.to_string();
                let mut reply = Reply::new();
                reply.set_status(StatusCode::InternalServerError);
                if self.config.expose_internal_errors {
                    reply.set_body_string(message.clone());
                }
                let _ = encode::write_to_compat(sink, &req, reply).await;
                self.escalate(err);
                Err(http_types::format_err!("{}", message))
            }
            Dispatch::TimedOut { method, url } => {
                let window = self.config.response_timeout.unwrap_or_default();
                log::warn!(
                    "{} {} produced no response within {:?}",
                    method,
                    url.path(),
                    window
                );
                let shadow = Request::new(method, url, StopToken::never());
                let mut reply = Reply::new();
                reply.set_status(StatusCode::GatewayTimeout);
                reply.set_reason(format!("no response within {} seconds", window.as_secs()));
                let _ = encode::write_to_compat(sink, &shadow, reply).await;
                Ok(())
            }
            Dispatch::Draining { method, url } => {
                // The request never finished the pipeline; drain it like
                // the connection loop would.
                let shadow = Request::new(method, url, StopToken::never());
                let mut reply = Reply::new();
                reply.set_status(self.drain_status());
                let _ = encode::write_to_compat(sink, &shadow, reply).await;
                Ok(())
            }
            Dispatch::Crashed { method, url } => {
                log::error!("request pipeline dropped without responding");
                let shadow = Request::new(method, url, StopToken::never());
                let mut reply = Reply::new();
                reply.set_status(StatusCode::InternalServerError);
                let _ = encode::write_to_compat(sink, &shadow, reply).await;
                bail!("request pipeline dropped without responding");
            }
        }
    }

    async fn write_compat_drain(
        &self,
        sink: Box<dyn CompatResponse>,
        method: Method,
        url: Url,
    ) -> http_types::Result<()> {
        let shadow = Request::new(method, url, StopToken::never());
        let mut reply = Reply::new();
        reply.set_status(self.drain_status());
        let _ = encode::write_to_compat(sink, &shadow, reply).await;
        Ok(())
    }

    async fn handle_upgrade<IO>(&self, mut req: Request, reader: BufReader<IO>, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Clone + Send + Sync + Unpin + 'static,
    {
        let mut gate = WebsocketGate::new();
        let reply = match self.services.handle_websocket(&mut req, &mut gate).await {
            Ok(reply) => reply,
            Err(err) => match self.services.handle_error(&err, &req).await {
                Some(reply) => Some(reply),
                None => {
                    log::error!("unhandled websocket error: {}", err);
                    let mut refusal = Reply::new();
                    refusal.set_status(StatusCode::InternalServerError);
                    let mut writer = io;
                    let _ = encode::write_raw_head(&mut writer, &refusal).await;
                    return;
                }
            },
        };

        match (reply, gate.into_handler()) {
            (Some(reply), Some(handler)) if matches!(reply.body(), ReplyBody::Upgrade) => {
                // The handshake head was prepared by a hook; write it,
                // then hand over the live duplex.
                let mut writer = io.clone();
                if let Err(err) = encode::write_raw_head(&mut writer, &reply).await {
                    log::debug!("upgrade handshake failed to write: {}", err);
                    return;
                }
                handler.call(Box::new(RawDuplex::new(reader, io))).await;
            }
            (Some(reply), _) => {
                let mut writer = io;
                let _ = encode::write_raw_head(&mut writer, &reply).await;
            }
            (None, Some(handler)) => {
                handler.call(Box::new(RawDuplex::new(reader, io))).await;
            }
            (None, None) => {
                log::debug!("upgrade request for {} had no takers", req.path());
                let mut refusal = Reply::new();
                refusal.set_status(StatusCode::NotFound);
                refusal.insert_header("connection", "close");
                let mut writer = io;
                let _ = encode::write_raw_head(&mut writer, &refusal).await;
            }
        }
    }

    /// Get the buffered reader back once the previous request's body is
    /// done with the transport. Gives up on shutdown or after a grace
    /// window, closing the connection instead of waiting on a stalled
    /// peer.
    async fn reclaim_transport<IO>(
        &self,
        reclaim: Reclaim<IO>,
        server_token: &StopToken,
    ) -> Option<BufReader<IO>> {
        match reclaim {
            Reclaim::Ready(reader) => Some(reader),
            Reclaim::AfterBody(rx) => {
                let recv = async { rx.recv().await.ok() };
                let give_up = async {
                    let grace = self.config.body_idle_timeout.unwrap_or(RECLAIM_GRACE);
                    let stopped = async {
                        server_token.stopped().await;
                    };
                    let expired = async {
                        Timer::after(grace).await;
                    };
                    future::or(stopped, expired).await;
                    None
                };
                future::or(recv, give_up).await
            }
        }
    }

    /// Record an unhandled request error and, when configured, stop the
    /// server because of it. The stop runs detached: this is called from
    /// inside connection tasks, which shutdown waits for.
    fn escalate(self: &Arc<Self>, err: Error) {
        if !self.config.stop_on_internal_error {
            return;
        }
        let mut fatal = lock(&self.fatal);
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        let shared = self.clone();
        async_global_executor::spawn(async move {
            shared.stop(StopReason::InternalError).await;
        })
        .detach();
    }

    fn drain_status(&self) -> StatusCode {
        match *lock(&self.stop_reason) {
            Some(StopReason::InternalError) => StatusCode::InternalServerError,
            _ => StatusCode::ServiceUnavailable,
        }
    }

    fn advance(&self, next: Lifecycle) {
        let mut state = lock(&self.lifecycle);
        if next > *state {
            log::trace!("lifecycle {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

/// The outcome of racing one request's pipeline against the response
/// timeout and server stop.
enum Dispatch {
    /// The hooks produced a reply (possibly via `handle_error`).
    Replied { req: Request, reply: Reply },
    /// An error fell through the whole `handle_error` chain.
    Failed { req: Request, err: Error },
    /// The response timeout expired first.
    TimedOut { method: Method, url: Url },
    /// The server stopped first.
    Draining { method: Method, url: Url },
    /// The pipeline task died without reporting.
    Crashed { method: Method, url: Url },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
