//! Connection takeover after a protocol upgrade.
//!
//! The runtime does not speak the websocket protocol. When a handshake
//! is accepted the connection is detached from HTTP and the raw
//! transport is handed to an [`UpgradeHandler`], byte-for-byte where
//! the request head ended.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::{AsyncRead, AsyncWrite, Future};

/// Bounds for a transport that can outlive its HTTP exchange.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> RawIo for T {}

/// A live duplex transport, detached from HTTP.
pub type RawStream = Box<dyn RawIo>;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Consumes the raw transport after an accepted handshake.
pub struct UpgradeHandler(Box<dyn FnOnce(RawStream) -> HandlerFuture + Send + Sync>);

impl UpgradeHandler {
    /// Wrap `handler`; it receives the transport exactly once.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: FnOnce(RawStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move |io| Box::pin(handler(io))))
    }

    pub(crate) async fn call(self, io: RawStream) {
        (self.0)(io).await
    }
}

impl std::fmt::Debug for UpgradeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UpgradeHandler")
    }
}

/// The takeover handle passed to `handle_websocket` hooks.
///
/// A hook accepts the handshake by calling
/// [`connect`][WebsocketGate::connect]; returning a reply instead
/// rejects it with that head. An engaged gate stops the hook chain.
#[derive(Debug, Default)]
pub struct WebsocketGate {
    handler: Option<UpgradeHandler>,
}

impl WebsocketGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept the handshake: `handler` receives the raw transport with
    /// nothing written to it.
    pub fn connect(&mut self, handler: UpgradeHandler) {
        self.handler = Some(handler);
    }

    /// Whether a handler has claimed the socket.
    pub fn is_engaged(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn into_handler(self) -> Option<UpgradeHandler> {
        self.handler
    }
}

/// Stitches the buffered read half and the shared write half of a
/// connection back into one transport for handoff.
pub(crate) struct RawDuplex<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> RawDuplex<R, W> {
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for RawDuplex<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for RawDuplex<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_close(cx)
    }
}

impl<R, W> std::fmt::Debug for RawDuplex<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RawDuplex")
    }
}
