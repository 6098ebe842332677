//! Seams for HTTP/2 compatibility transports.
//!
//! The runtime never speaks the HTTP/2 framing layer itself. An
//! embedding adapter implements [`CompatResponse`] for the response
//! half of a stream and [`PushSession`] for the session half; the
//! writer and the push pipeline drive those traits without knowing the
//! transport underneath.

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_lite::future;
use http_types::{Method, Result, StatusCode};

use crate::reply::Reply;
use crate::request::{PushGuard, Request};
use crate::server::encode::{self, WriteOutcome};
use crate::service::Services;
use crate::stop::{StopSource, StopToken};

/// The response half of a compatibility stream.
///
/// Head and body writes map onto whatever header-block and data-frame
/// calls the transport exposes.
pub trait CompatResponse: Send {
    /// Write the header block. `reason` is advisory; transports without
    /// a reason phrase reject non-empty ones through the error path.
    fn send_head(
        &mut self,
        status: StatusCode,
        reason: Option<&str>,
        headers: &[(String, String)],
    ) -> io::Result<()>;

    /// Write one body chunk.
    fn poll_write_chunk(&mut self, cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<()>>;

    /// Finish the response.
    fn poll_end(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Whether the peer already closed the stream.
    fn is_closed(&self) -> bool;

    /// Whether `err` is the transport's write-after-close race. Those
    /// are swallowed; every other error is surfaced.
    fn is_benign_close_race(&self, err: &io::Error) -> bool;
}

impl dyn CompatResponse {
    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        future::poll_fn(|cx| self.poll_write_chunk(cx, chunk)).await
    }

    pub(crate) async fn end(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| self.poll_end(cx)).await
    }
}

/// The session half of a compatibility stream, used to open pushes.
pub trait PushSession: Send + Sync {
    /// Whether the session still accepts pushes.
    fn push_allowed(&self) -> bool;

    /// The remote flow-control window, when the transport reports one.
    fn remote_window(&self) -> Option<u32>;

    /// Open a push stream for `target`, announcing `headers` as the
    /// synthetic request head.
    fn open_push(
        &self,
        target: &str,
        headers: &[(String, String)],
    ) -> io::Result<Box<dyn CompatResponse>>;
}

/// The push handle passed to `handle_request` hooks.
///
/// [`push`][PushCapability::push] is best effort: a refused or failed
/// push is logged and reported as `false`, never as a request error.
pub struct PushCapability {
    session: Option<Arc<dyn PushSession>>,
    services: Arc<Services>,
}

impl PushCapability {
    pub(crate) fn new(session: Arc<dyn PushSession>, services: Arc<Services>) -> Self {
        Self {
            session: Some(session),
            services,
        }
    }

    pub(crate) fn without_session(services: Arc<Services>) -> Self {
        Self {
            session: None,
            services,
        }
    }

    /// A capability with no transport behind it; every push is refused.
    pub fn unavailable() -> Self {
        Self::without_session(Arc::new(Services::new()))
    }

    /// Whether the transport supports pushing at all.
    pub fn is_available(&self) -> bool {
        self.session.is_some()
    }

    /// Push `target` as a derived `GET` alongside the response to
    /// `parent`. Returns whether the push stream was opened; the push
    /// body is produced and written in the background.
    pub async fn push(&mut self, parent: &Request, target: &str) -> bool {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => {
                log::debug!("push of {} skipped: transport does not support push", target);
                return false;
            }
        };
        if !session.push_allowed() {
            log::debug!("push of {} skipped: peer disabled push", target);
            return false;
        }
        if session.remote_window() == Some(0) {
            log::debug!("push of {} skipped: remote window exhausted", target);
            return false;
        }
        if !self.services.allows_push(Method::Get, target).await {
            return false;
        }

        let source = StopSource::new();
        let token = StopToken::merged(parent.token(), &source.token());
        let child = parent.derive_push(target, token);
        let headers: Vec<(String, String)> = child
            .iter()
            .flat_map(|(name, values)| {
                let name = name.as_str().to_string();
                values
                    .iter()
                    .map(move |value| (name.clone(), value.as_str().to_string()))
            })
            .collect();
        let sink = match session.open_push(child.path(), &headers) {
            Ok(sink) => sink,
            Err(err) => {
                log::warn!("opening push stream for {} failed: {}", target, err);
                return false;
            }
        };

        let guard = PushGuard::new(parent.push_counter());
        let services = self.services.clone();
        let path = child.path().to_string();
        async_global_executor::spawn(async move {
            let _source = source;
            let _guard = guard;
            if let Err(err) = respond_push(services, child, sink).await {
                log::warn!("push of {} failed: {}", path, err);
            }
        })
        .detach();
        true
    }
}

impl std::fmt::Debug for PushCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushCapability")
            .field("available", &self.is_available())
            .finish()
    }
}

/// Run the pushed request through the service chain and write the
/// outcome onto the push stream. Pushed requests cannot push further.
async fn respond_push(
    services: Arc<Services>,
    mut child: Request,
    sink: Box<dyn CompatResponse>,
) -> Result<()> {
    let mut capability = PushCapability::without_session(services.clone());
    let reply = match services.handle_request(&mut child, &mut capability).await {
        Ok(Some(reply)) => reply,
        Ok(None) => Reply::new(),
        Err(err) => match services.handle_error(&err, &child).await {
            Some(reply) => reply,
            None => return Err(err),
        },
    };
    let reply = services.inject_response_headers(&child, reply).await;
    services.response_ready(&child, &reply).await;
    match encode::write_to_compat(sink, &child, reply).await {
        WriteOutcome::Ended => Ok(()),
        WriteOutcome::Aborted => {
            log::trace!("push of {} aborted by the peer", child.path());
            Ok(())
        }
        WriteOutcome::Errored(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use http_types::Url;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubSession {
        allowed: bool,
        window: Option<u32>,
        opened: Arc<AtomicBool>,
    }

    impl PushSession for StubSession {
        fn push_allowed(&self) -> bool {
            self.allowed
        }

        fn remote_window(&self) -> Option<u32> {
            self.window
        }

        fn open_push(
            &self,
            _target: &str,
            _headers: &[(String, String)],
        ) -> io::Result<Box<dyn CompatResponse>> {
            self.opened.store(true, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "stub"))
        }
    }

    fn parent() -> Request {
        let url = Url::parse("https://example.com/page").unwrap();
        Request::new(Method::Get, url, StopToken::never())
    }

    #[test]
    fn unavailable_capability_refuses() {
        block_on(async {
            let mut push = PushCapability::unavailable();
            assert!(!push.is_available());
            assert!(!push.push(&parent(), "/style.css").await);
        });
    }

    #[test]
    fn disabled_session_refuses_before_opening() {
        block_on(async {
            let opened = Arc::new(AtomicBool::new(false));
            let session = StubSession {
                allowed: false,
                window: None,
                opened: opened.clone(),
            };
            let mut push = PushCapability::new(Arc::new(session), Arc::new(Services::new()));
            assert!(!push.push(&parent(), "/style.css").await);
            assert!(!opened.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn exhausted_window_refuses_before_opening() {
        block_on(async {
            let opened = Arc::new(AtomicBool::new(false));
            let session = StubSession {
                allowed: true,
                window: Some(0),
                opened: opened.clone(),
            };
            let mut push = PushCapability::new(Arc::new(session), Arc::new(Services::new()));
            assert!(!push.push(&parent(), "/style.css").await);
            assert!(!opened.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn veto_blocks_before_opening() {
        use crate::service::{HookFuture, Service};

        struct Veto;

        impl Service for Veto {
            fn name(&self) -> &str {
                "veto"
            }

            fn on_response_push<'a>(&'a self, _method: Method, _target: &'a str) -> HookFuture<'a, bool> {
                Box::pin(async { false })
            }
        }

        block_on(async {
            let opened = Arc::new(AtomicBool::new(false));
            let session = StubSession {
                allowed: true,
                window: None,
                opened: opened.clone(),
            };
            let services = Arc::new(Services::new().with(Veto));
            let mut push = PushCapability::new(Arc::new(session), services);
            assert!(!push.push(&parent(), "/style.css").await);
            assert!(!opened.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn failed_open_reports_false() {
        block_on(async {
            let opened = Arc::new(AtomicBool::new(false));
            let session = StubSession {
                allowed: true,
                window: Some(65_535),
                opened: opened.clone(),
            };
            let mut push = PushCapability::new(Arc::new(session), Arc::new(Services::new()));
            let req = parent();
            assert!(!push.push(&req, "/style.css").await);
            assert!(opened.load(Ordering::SeqCst));
            assert!(!req.has_active_pushes());
        });
    }
}
