//! The normalized request model.
//!
//! Every transport variant is decoded into the same [`Request`] shape:
//! lowercased headers, an absolute URL, a cancellation token tied to the
//! connection, and a body that can be consumed exactly once. Handlers
//! never see the transport the request arrived on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_lite::AsyncReadExt;
use http_types::convert::DeserializeOwned;
use http_types::headers::{HeaderName, HeaderValues, Iter, ToHeaderValues};
use http_types::{format_err, Body, Method, Result, Url};

use crate::body::GuardedBody;
use crate::stop::StopToken;

/// An incoming request, decoded from any transport.
#[derive(Debug)]
pub struct Request {
    inner: http_types::Request,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    token: StopToken,
    body: Option<GuardedBody>,
    active_pushes: Arc<AtomicUsize>,
    parent: Option<Url>,
}

impl Request {
    /// Create a request with an empty body.
    ///
    /// `token` should observe both server stop and connection close; it
    /// cancels body consumption and response writing for this request.
    pub fn new(method: Method, url: Url, token: StopToken) -> Self {
        Self {
            inner: http_types::Request::new(method, url),
            remote_addr: None,
            secure: false,
            token,
            body: Some(GuardedBody::empty()),
            active_pushes: Arc::new(AtomicUsize::new(0)),
            parent: None,
        }
    }

    /// The request method.
    pub fn method(&self) -> Method {
        self.inner.method()
    }

    /// The request URL.
    pub fn url(&self) -> &Url {
        self.inner.url()
    }

    /// The decoded path component.
    pub fn path(&self) -> &str {
        self.inner.url().path()
    }

    /// The raw query string, if any.
    pub fn query_string(&self) -> Option<&str> {
        self.inner.url().query()
    }

    /// The canonical origin (`scheme://authority`, default ports
    /// stripped).
    pub fn origin(&self) -> String {
        self.inner.url().origin().ascii_serialization()
    }

    /// The cancellation token for this request.
    pub fn token(&self) -> &StopToken {
        &self.token
    }

    /// The socket peer, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Record the socket peer.
    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    /// Whether the connection is TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Record TLS-ness of the connection.
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Get a header.
    pub fn header(&self, name: impl Into<HeaderName>) -> Option<&HeaderValues> {
        self.inner.header(name)
    }

    /// Set a header, replacing previous values.
    pub fn insert_header(&mut self, name: impl Into<HeaderName>, values: impl ToHeaderValues) {
        self.inner.insert_header(name, values);
    }

    /// Append a header value, keeping previous ones.
    pub fn append_header(&mut self, name: impl Into<HeaderName>, values: impl ToHeaderValues) {
        self.inner.append_header(name, values);
    }

    /// Iterate over all headers.
    pub fn iter(&self) -> Iter<'_> {
        self.inner.iter()
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: GuardedBody) {
        self.body = Some(body);
    }

    /// The client address, honoring forwarding headers.
    ///
    /// Precedence: `Forwarded` (`for=` of the first element), then the
    /// first `X-Forwarded-For` entry, then the socket peer.
    pub fn client_ip(&self) -> Option<String> {
        if let Some(values) = self.header("forwarded") {
            if let Some(found) = forwarded_param(values.as_str(), "for") {
                return Some(strip_port(&found));
            }
        }
        if let Some(values) = self.header("x-forwarded-for") {
            let first = values.as_str().split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(strip_port(first));
            }
        }
        self.remote_addr.map(|addr| addr.ip().to_string())
    }

    /// The client-facing host, honoring forwarding headers.
    ///
    /// Precedence: `Forwarded` (`host=`), then `X-Forwarded-Host`, then
    /// the `Host` header the request was decoded with.
    pub fn client_host(&self) -> Option<String> {
        if let Some(values) = self.header("forwarded") {
            if let Some(host) = forwarded_param(values.as_str(), "host") {
                return Some(host);
            }
        }
        if let Some(values) = self.header("x-forwarded-host") {
            let first = values.as_str().split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_owned());
            }
        }
        self.header("host")
            .map(|values| values.as_str().to_owned())
            .or_else(|| self.inner.url().host_str().map(str::to_owned))
    }

    /// Whether the request asks to switch this connection to WebSocket.
    pub fn is_websocket_upgrade(&self) -> bool {
        let connection_upgrades = self
            .header("connection")
            .map(|values| has_token(values.as_str(), "upgrade"))
            .unwrap_or(false);
        let upgrade_websocket = self
            .header("upgrade")
            .map(|values| has_token(values.as_str(), "websocket"))
            .unwrap_or(false);
        connection_upgrades && upgrade_websocket
    }

    /// Read the whole body. The body can be consumed once; a second
    /// accessor call errors.
    pub async fn body_bytes(&mut self) -> Result<Vec<u8>> {
        let mut reader = self.consume_body()?.into_reader();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Read the whole body as a UTF-8 string.
    pub async fn body_string(&mut self) -> Result<String> {
        let bytes = self.body_bytes().await?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Deserialize the body as JSON.
    pub async fn body_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.consume_http_body()?.into_json().await
    }

    /// Deserialize the body as `application/x-www-form-urlencoded`.
    pub async fn body_form<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.consume_http_body()?.into_form().await
    }

    /// Read the body as raw urlencoded pairs.
    pub async fn body_query(&mut self) -> Result<Vec<(String, String)>> {
        self.body_form().await
    }

    /// Apply a rewrite, producing the request the hooks will see. The
    /// path and query are recomputed from the patch; everything else
    /// carries over.
    pub fn redirect(mut self, patch: &RequestPatch) -> Request {
        let url = self.inner.url_mut();
        if let Some(pathname) = &patch.pathname {
            url.set_path(pathname);
        }
        if let Some(query) = &patch.query {
            if query.is_empty() {
                url.set_query(None);
            } else {
                url.set_query(Some(query));
            }
        }
        self
    }

    /// Derive the request for a server-initiated push of `target`
    /// (a path, optionally with a query).
    ///
    /// The child inherits this request's headers minus the caching
    /// validators (`if-none-match`, `if-modified-since`), uses `GET`,
    /// carries no body, and shares this request's push accounting.
    /// `token` is the child's own signal; cancelling it never cancels
    /// the parent.
    pub fn derive_push(&self, target: &str, token: StopToken) -> Request {
        let mut url = self.inner.url().clone();
        let mut parts = target.splitn(2, '?');
        url.set_path(parts.next().unwrap_or(target));
        url.set_query(parts.next());

        let mut pushed = Request::new(Method::Get, url, token);
        for (name, values) in self.inner.iter() {
            let name_str = name.as_str();
            if name_str == "if-none-match" || name_str == "if-modified-since" {
                continue;
            }
            for value in values.iter() {
                pushed.inner.append_header(name.clone(), value.clone());
            }
        }
        pushed.remote_addr = self.remote_addr;
        pushed.secure = self.secure;
        pushed.parent = Some(self.inner.url().clone());
        pushed.active_pushes = self.active_pushes.clone();
        pushed
    }

    /// Whether this request was derived for a server push.
    pub fn is_push(&self) -> bool {
        self.parent.is_some()
    }

    /// The URL of the request this push was derived from.
    pub fn parent_url(&self) -> Option<&Url> {
        self.parent.as_ref()
    }

    /// Whether pushes derived from this request are still open.
    pub fn has_active_pushes(&self) -> bool {
        self.active_pushes.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn push_counter(&self) -> Arc<AtomicUsize> {
        self.active_pushes.clone()
    }

    fn consume_body(&mut self) -> Result<GuardedBody> {
        self.body
            .take()
            .ok_or_else(|| format_err!("request body already consumed"))
    }

    fn consume_http_body(&mut self) -> Result<Body> {
        let body = self.consume_body()?;
        let len = body.len();
        Ok(Body::from_reader(body.into_reader(), len))
    }
}

/// A rewrite applied to a request before hook dispatch.
#[derive(Debug, Default, Clone)]
pub struct RequestPatch {
    /// Replacement path, when set.
    pub pathname: Option<String>,
    /// Replacement raw query, when set; empty clears the query.
    pub query: Option<String>,
}

/// Tracks one open push derived from a request; dropping it closes the
/// books.
#[derive(Debug)]
pub(crate) struct PushGuard(Arc<AtomicUsize>);

impl PushGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The value of `param` in the first element of a `Forwarded` header.
fn forwarded_param(header: &str, param: &str) -> Option<String> {
    let first = header.split(',').next()?;
    for pair in first.split(';') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?.trim();
        if key.eq_ignore_ascii_case(param) {
            let value = parts.next()?.trim().trim_matches('"');
            if value.is_empty() {
                return None;
            }
            return Some(value.to_owned());
        }
    }
    None
}

/// Drop a `:port` suffix and IPv6 brackets from a node identifier.
fn strip_port(node: &str) -> String {
    let node = node.trim();
    if let Some(rest) = node.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_owned();
        }
    }
    // A single colon separates host and port; several mean a bare IPv6.
    if node.matches(':').count() == 1 {
        return node.split(':').next().unwrap_or(node).to_owned();
    }
    node.to_owned()
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    fn request(url: &str) -> Request {
        Request::new(
            Method::Get,
            Url::parse(url).unwrap(),
            StopToken::never(),
        )
    }

    #[test]
    fn forwarded_wins_over_x_forwarded_for() {
        let mut req = request("http://example.com/");
        req.insert_header("forwarded", "for=192.0.2.60;proto=http, for=198.51.100.17");
        req.insert_header("x-forwarded-for", "203.0.113.5");
        assert_eq!(req.client_ip().unwrap(), "192.0.2.60");
    }

    #[test]
    fn forwarded_quoted_ipv6_is_unwrapped() {
        let mut req = request("http://example.com/");
        req.insert_header("forwarded", "for=\"[2001:db8::1]:8080\"");
        assert_eq!(req.client_ip().unwrap(), "2001:db8::1");
    }

    #[test]
    fn x_forwarded_for_uses_first_entry() {
        let mut req = request("http://example.com/");
        req.insert_header("x-forwarded-for", "203.0.113.5:4711, 10.0.0.1");
        assert_eq!(req.client_ip().unwrap(), "203.0.113.5");
    }

    #[test]
    fn client_ip_falls_back_to_peer() {
        let mut req = request("http://example.com/");
        req.set_remote_addr("10.1.2.3:4000".parse().unwrap());
        assert_eq!(req.client_ip().unwrap(), "10.1.2.3");
    }

    #[test]
    fn client_host_precedence() {
        let mut req = request("http://internal.example/");
        req.insert_header("host", "internal.example");
        req.insert_header("x-forwarded-host", "public.example");
        assert_eq!(req.client_host().unwrap(), "public.example");

        req.insert_header("forwarded", "host=front.example");
        assert_eq!(req.client_host().unwrap(), "front.example");
    }

    #[test]
    fn origin_strips_default_port() {
        let req = request("http://example.com:80/a/b?c=1");
        assert_eq!(req.origin(), "http://example.com");
    }

    #[test]
    fn redirect_recomputes_path_and_query() {
        let req = request("http://example.com/old?keep=no");
        let patch = RequestPatch {
            pathname: Some("/new".into()),
            query: Some("".into()),
        };
        let req = req.redirect(&patch);
        assert_eq!(req.path(), "/new");
        assert_eq!(req.query_string(), None);
    }

    #[test]
    fn derive_push_strips_caching_validators() {
        let mut req = request("https://example.com/page");
        req.insert_header("accept", "text/html");
        req.insert_header("if-none-match", "\"abc\"");
        req.insert_header("if-modified-since", "Wed, 21 Oct 2015 07:28:00 GMT");

        let pushed = req.derive_push("/style.css?v=2", StopToken::never());
        assert_eq!(pushed.method(), Method::Get);
        assert_eq!(pushed.path(), "/style.css");
        assert_eq!(pushed.query_string(), Some("v=2"));
        assert!(pushed.header("if-none-match").is_none());
        assert!(pushed.header("if-modified-since").is_none());
        assert_eq!(pushed.header("accept").unwrap().as_str(), "text/html");
        assert!(pushed.is_push());
        assert_eq!(
            pushed.parent_url().unwrap().as_str(),
            "https://example.com/page"
        );
    }

    #[test]
    fn push_accounting_is_shared_with_the_parent() {
        let req = request("http://example.com/");
        let pushed = req.derive_push("/asset.js", StopToken::never());
        assert!(!req.has_active_pushes());
        let guard = PushGuard::new(pushed.push_counter());
        assert!(req.has_active_pushes());
        drop(guard);
        assert!(!req.has_active_pushes());
    }

    #[test]
    fn body_accessors_are_one_shot() {
        block_on(async {
            let mut req = request("http://example.com/");
            req.set_body(GuardedBody::new(
                &crate::body::ChunkStream::from_string("hello"),
                &StopToken::never(),
                None,
                None,
                Some(5),
            ));
            assert_eq!(req.body_string().await.unwrap(), "hello");
            assert!(req.body_string().await.is_err());
        });
    }

    #[test]
    fn websocket_upgrade_detection_is_token_based() {
        let mut req = request("http://example.com/socket");
        req.insert_header("connection", "keep-alive, Upgrade");
        req.insert_header("upgrade", "websocket");
        assert!(req.is_websocket_upgrade());

        let mut plain = request("http://example.com/");
        plain.insert_header("connection", "keep-alive");
        assert!(!plain.is_websocket_upgrade());
    }
}
