//! Named server extensions.
//!
//! A [`Service`] contributes behavior through a closed set of hooks.
//! Hooks run in registration order, awaited one at a time; the
//! request-handling hooks short-circuit on the first service that
//! returns a reply.

use std::future::Future;
use std::pin::Pin;

use http_types::{Error, Method, Result};

use crate::h2::PushCapability;
use crate::reply::Reply;
use crate::request::{Request, RequestPatch};
use crate::server::{ServerInfo, StopReason};
use crate::upgrade::WebsocketGate;

/// The future a hook returns.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A named extension participating in the server lifecycle.
///
/// Every hook has a no-op default; a service implements only the ones
/// it cares about.
pub trait Service: Send + Sync + 'static {
    /// The service name, used in log lines.
    fn name(&self) -> &str;

    /// The server has bound its listener and is accepting connections.
    fn server_listening<'a>(&'a self, _info: &'a ServerInfo) -> HookFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Inspect an incoming request before dispatch and optionally
    /// rewrite its path or query.
    fn redirect_request<'a>(&'a self, _req: &'a Request) -> HookFuture<'a, Option<RequestPatch>> {
        Box::pin(async { None })
    }

    /// Produce the reply for a request, or pass by returning `None`.
    fn handle_request<'a>(
        &'a self,
        _req: &'a mut Request,
        _push: &'a mut PushCapability,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async { Ok(None) })
    }

    /// Decide the fate of a websocket handshake. Returning a reply
    /// rejects the upgrade with that head; calling
    /// [`WebsocketGate::connect`] takes the socket over.
    fn handle_websocket<'a>(
        &'a self,
        _req: &'a mut Request,
        _gate: &'a mut WebsocketGate,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        Box::pin(async { Ok(None) })
    }

    /// Turn a failed request into a reply, or pass.
    fn handle_error<'a>(&'a self, _err: &'a Error, _req: &'a Request) -> HookFuture<'a, Option<Reply>> {
        Box::pin(async { None })
    }

    /// Veto a server push before it is opened. All services must
    /// return `true` for the push to proceed.
    fn on_response_push<'a>(&'a self, _method: Method, _target: &'a str) -> HookFuture<'a, bool> {
        Box::pin(async { true })
    }

    /// Contribute headers to an outgoing reply. Contributions merge
    /// via [`Reply::compose`].
    fn inject_response_headers<'a>(&'a self, _req: &'a Request) -> HookFuture<'a, Option<Reply>> {
        Box::pin(async { None })
    }

    /// Observe the final reply right before it is written.
    fn response_ready<'a>(&'a self, _req: &'a Request, _reply: &'a Reply) -> HookFuture<'a, ()> {
        Box::pin(async {})
    }

    /// The server has stopped.
    fn server_stopped<'a>(&'a self, _reason: StopReason) -> HookFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// An ordered service registry, fixed at server construction.
#[derive(Default)]
pub struct Services {
    services: Vec<Box<dyn Service>>,
}

impl Services {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `service`. Registration order is dispatch order.
    pub fn register(&mut self, service: impl Service) {
        log::trace!("registering service {}", service.name());
        self.services.push(Box::new(service));
    }

    /// Builder-style [`register`][Services::register].
    pub fn with(mut self, service: impl Service) -> Self {
        self.register(service);
        self
    }

    /// The number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) async fn server_listening(&self, info: &ServerInfo) {
        for service in &self.services {
            service.server_listening(info).await;
        }
    }

    /// Fold every redirect patch into the request, left to right.
    pub(crate) async fn redirect_request(&self, mut req: Request) -> Request {
        for service in &self.services {
            if let Some(patch) = service.redirect_request(&req).await {
                log::trace!("service {} redirected {}", service.name(), req.path());
                req = req.redirect(&patch);
            }
        }
        req
    }

    /// First service to return a reply wins.
    pub(crate) async fn handle_request(
        &self,
        req: &mut Request,
        push: &mut PushCapability,
    ) -> Result<Option<Reply>> {
        for service in &self.services {
            if let Some(reply) = service.handle_request(req, push).await? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    pub(crate) async fn handle_websocket(
        &self,
        req: &mut Request,
        gate: &mut WebsocketGate,
    ) -> Result<Option<Reply>> {
        for service in &self.services {
            if let Some(reply) = service.handle_websocket(req, gate).await? {
                return Ok(Some(reply));
            }
            if gate.is_engaged() {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// First service to produce a reply for `err` wins.
    pub(crate) async fn handle_error(&self, err: &Error, req: &Request) -> Option<Reply> {
        for service in &self.services {
            if let Some(reply) = service.handle_error(err, req).await {
                log::trace!("service {} handled a request error", service.name());
                return Some(reply);
            }
        }
        None
    }

    /// A push proceeds only if no service vetoes it.
    pub(crate) async fn allows_push(&self, method: Method, target: &str) -> bool {
        for service in &self.services {
            if !service.on_response_push(method, target).await {
                log::trace!("service {} vetoed push of {}", service.name(), target);
                return false;
            }
        }
        true
    }

    /// Merge every header contribution into `reply`.
    pub(crate) async fn inject_response_headers(&self, req: &Request, mut reply: Reply) -> Reply {
        for service in &self.services {
            if let Some(patch) = service.inject_response_headers(req).await {
                reply = reply.compose(patch);
            }
        }
        reply
    }

    pub(crate) async fn response_ready(&self, req: &Request, reply: &Reply) {
        for service in &self.services {
            service.response_ready(req, reply).await;
        }
    }

    pub(crate) async fn server_stopped(&self, reason: StopReason) {
        for service in &self.services {
            service.server_stopped(reason).await;
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.services.iter().map(|s| s.name()))
            .finish()
    }
}

type MethodHandler = Box<
    dyn for<'a> Fn(&'a mut Request, &'a mut PushCapability) -> HookFuture<'a, Result<Option<Reply>>>
        + Send
        + Sync,
>;

/// A service dispatching `handle_request` by method.
///
/// A request whose method has no registered handler passes through
/// unanswered; no rejection is synthesized.
pub struct MethodService {
    name: String,
    handlers: Vec<(Method, MethodHandler)>,
}

impl MethodService {
    /// A method-keyed service called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// Register `handler` for `method`.
    pub fn on<F>(mut self, method: Method, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Request, &'a mut PushCapability) -> HookFuture<'a, Result<Option<Reply>>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.push((method, Box::new(handler)));
        self
    }
}

impl Service for MethodService {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_request<'a>(
        &'a self,
        req: &'a mut Request,
        push: &'a mut PushCapability,
    ) -> HookFuture<'a, Result<Option<Reply>>> {
        let method = req.method();
        match self.handlers.iter().find(|(m, _)| *m == method) {
            Some((_, handler)) => handler(req, push),
            None => Box::pin(async { Ok(None) }),
        }
    }
}

impl std::fmt::Debug for MethodService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodService")
            .field("name", &self.name)
            .field("methods", &self.handlers.iter().map(|(m, _)| *m).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopToken;
    use futures_lite::future::block_on;
    use http_types::{StatusCode, Url};

    fn request(method: Method) -> Request {
        let url = Url::parse("http://localhost/demo").unwrap();
        Request::new(method, url, StopToken::never())
    }

    struct Always(&'static str, StatusCode);

    impl Service for Always {
        fn name(&self) -> &str {
            self.0
        }

        fn handle_request<'a>(
            &'a self,
            _req: &'a mut Request,
            _push: &'a mut PushCapability,
        ) -> HookFuture<'a, Result<Option<Reply>>> {
            Box::pin(async move {
                let mut reply = Reply::new();
                reply.set_status(self.1);
                Ok(Some(reply))
            })
        }
    }

    #[test]
    fn first_reply_short_circuits() {
        let services = Services::new()
            .with(Always("first", StatusCode::Ok))
            .with(Always("second", StatusCode::ImATeapot));
        let mut req = request(Method::Get);
        let mut push = PushCapability::unavailable();
        let reply = block_on(services.handle_request(&mut req, &mut push))
            .unwrap()
            .unwrap();
        assert_eq!(reply.status(), Some(StatusCode::Ok));
    }

    #[test]
    fn unanswered_request_yields_none() {
        let services = Services::new();
        let mut req = request(Method::Get);
        let mut push = PushCapability::unavailable();
        let reply = block_on(services.handle_request(&mut req, &mut push)).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn method_service_skips_other_methods() {
        let service = MethodService::new("demo").on(Method::Post, |_req, _push| {
            Box::pin(async {
                let mut reply = Reply::new();
                reply.set_status(StatusCode::Created);
                Ok(Some(reply))
            })
        });
        let services = Services::new().with(service);
        let mut push = PushCapability::unavailable();

        let mut get = request(Method::Get);
        assert!(block_on(services.handle_request(&mut get, &mut push))
            .unwrap()
            .is_none());

        let mut post = request(Method::Post);
        let reply = block_on(services.handle_request(&mut post, &mut push))
            .unwrap()
            .unwrap();
        assert_eq!(reply.status(), Some(StatusCode::Created));
    }

    #[test]
    fn redirects_compose_in_order() {
        struct Patch(&'static str, Option<&'static str>);

        impl Service for Patch {
            fn name(&self) -> &str {
                "patch"
            }

            fn redirect_request<'a>(
                &'a self,
                _req: &'a Request,
            ) -> HookFuture<'a, Option<RequestPatch>> {
                Box::pin(async move {
                    Some(RequestPatch {
                        pathname: Some(self.0.to_string()),
                        query: self.1.map(str::to_string),
                    })
                })
            }
        }

        let services = Services::new()
            .with(Patch("/a", Some("x=1")))
            .with(Patch("/b", None));
        let req = block_on(services.redirect_request(request(Method::Get)));
        assert_eq!(req.path(), "/b");
        assert_eq!(req.query_string(), Some("x=1"));
    }

    #[test]
    fn any_veto_blocks_a_push() {
        struct Veto;

        impl Service for Veto {
            fn name(&self) -> &str {
                "veto"
            }

            fn on_response_push<'a>(&'a self, _method: Method, target: &'a str) -> HookFuture<'a, bool> {
                Box::pin(async move { target != "/secret" })
            }
        }

        let services = Services::new().with(Veto);
        assert!(block_on(services.allows_push(Method::Get, "/style.css")));
        assert!(!block_on(services.allows_push(Method::Get, "/secret")));
    }

    #[test]
    fn header_contributions_merge() {
        struct Inject(&'static str);

        impl Service for Inject {
            fn name(&self) -> &str {
                "inject"
            }

            fn inject_response_headers<'a>(&'a self, _req: &'a Request) -> HookFuture<'a, Option<Reply>> {
                Box::pin(async move {
                    let mut patch = Reply::new();
                    patch.insert_header("vary", self.0);
                    Some(patch)
                })
            }
        }

        let services = Services::new().with(Inject("x")).with(Inject("y"));
        let req = request(Method::Get);
        let reply = block_on(services.inject_response_headers(&req, Reply::new()));
        assert_eq!(reply.header("vary").unwrap().as_str(), "x, y");
    }
}
