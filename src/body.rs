//! Adapters between concrete transports and push streams.
//!
//! Inbound, every body — a socket, a file, an in-memory value — becomes a
//! [`Stream`] of byte chunks so the rest of the crate never sees the
//! underlying transport. Outbound, [`BodyReader`] bridges a subscription
//! back into the `AsyncBufRead` world that http-types conversions and the
//! chunked encoder consume.

use std::io;
use std::io::Read as _;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_channel::Sender;
use async_io::Timer;
use futures_lite::io::{AsyncBufRead, AsyncRead};
use futures_lite::{future, AsyncReadExt, Stream as _};

use crate::stop::{StopSource, StopToken};
use crate::stream::{Stream, Subscription, Teardown};

/// One body payload.
pub type Chunk = Vec<u8>;

/// A push stream of byte chunks.
pub type ChunkStream = Stream<Chunk>;

/// The buffer size used when adapting a reader.
const CHUNK_SIZE: usize = 8 * 1024;

impl ChunkStream {
    /// Adapt a platform byte stream: `next` per read, `complete` on
    /// end-of-stream, `error` on a transport error.
    ///
    /// The reader can only be consumed once; a second subscription errors
    /// immediately. The producer also observes `release` so an abandoned
    /// body lets go of the transport when its guard fires.
    pub fn from_reader<R>(reader: R, release: StopToken) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (discard, _) = async_channel::bounded(1);
        Self::from_transport(reader, release, discard, |_| ())
    }

    /// Like [`from_reader`][ChunkStream::from_reader], but hands the
    /// reader back through `reclaim` on a clean end-of-stream so a
    /// connection can serve another request. A body that errors or is
    /// released early drops the reader instead, and the waiting end of
    /// `reclaim` observes the closed channel.
    pub(crate) fn from_transport<R, T>(
        reader: R,
        release: StopToken,
        reclaim: Sender<T>,
        restore: impl FnOnce(R) -> T + Send + 'static,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some((reader, reclaim, restore))));
        Stream::new(move |emitter| {
            let taken = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            let (mut reader, reclaim, restore) = match taken {
                Some(parts) => parts,
                None => {
                    emitter.error(http_types::format_err!("body stream already consumed"));
                    return None;
                }
            };
            let release = release.clone();
            let task = async_global_executor::spawn(async move {
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let result = {
                        let stopped = async {
                            release.stopped().await;
                            None
                        };
                        let read = async { Some(reader.read(&mut buf).await) };
                        future::or(stopped, read).await
                    };
                    match result {
                        Some(Ok(0)) => {
                            let _ = reclaim.try_send(restore(reader));
                            emitter.complete();
                            break;
                        }
                        Some(Ok(n)) => {
                            if !emitter.next(buf[..n].to_vec()) {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            emitter.error(err.into());
                            break;
                        }
                        None => {
                            emitter.complete();
                            break;
                        }
                    }
                }
            });
            Some(Teardown::new(move || drop(task)))
        })
    }

    /// Adapt a file handle. Reads happen on the blocking pool.
    pub fn from_file(path: impl Into<PathBuf>, release: StopToken) -> Self {
        let path = path.into();
        Stream::new(move |emitter| {
            let path = path.clone();
            let release = release.clone();
            let task = async_global_executor::spawn_blocking(move || {
                let mut file = match std::fs::File::open(&path) {
                    Ok(file) => file,
                    Err(err) => {
                        emitter.error(err.into());
                        return;
                    }
                };
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    if release.is_stopped() {
                        emitter.complete();
                        return;
                    }
                    match file.read(&mut buf) {
                        Ok(0) => {
                            emitter.complete();
                            return;
                        }
                        Ok(n) => {
                            if !emitter.next(buf[..n].to_vec()) {
                                return;
                            }
                        }
                        Err(err) => {
                            emitter.error(err.into());
                            return;
                        }
                    }
                }
            });
            Some(Teardown::new(move || drop(task)))
        })
    }

    /// Short-circuit a plain value: one `next`, then `complete`.
    pub fn from_bytes(bytes: impl Into<Chunk>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Stream::empty();
        }
        Stream::of(bytes)
    }

    /// Short-circuit an owned string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self::from_bytes(s.into().into_bytes())
    }
}

/// Bridges a chunk subscription into `AsyncRead`/`AsyncBufRead`.
///
/// On the first actual read it fires every registered notifier once —
/// the hook used both for deferred `100 Continue` replies and to disarm
/// the idle guard.
#[derive(Debug)]
pub struct BodyReader {
    subscription: Subscription<Chunk>,
    chunk: Chunk,
    offset: usize,
    notified: bool,
    notifiers: Vec<Sender<()>>,
}

impl BodyReader {
    fn new(subscription: Subscription<Chunk>, notifiers: Vec<Sender<()>>) -> Self {
        Self {
            subscription,
            chunk: Vec::new(),
            offset: 0,
            notified: false,
            notifiers,
        }
    }
}

impl AsyncBufRead for BodyReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if !this.notified {
            this.notified = true;
            for notifier in &this.notifiers {
                let _ = notifier.try_send(());
            }
        }
        while this.offset >= this.chunk.len() {
            match Pin::new(&mut this.subscription).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.chunk = chunk;
                    this.offset = 0;
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err.to_string())));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(&[])),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(&this.chunk[this.offset..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().offset += amt;
    }
}

impl AsyncRead for BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let available = futures_lite::ready!(self.as_mut().poll_fill_buf(cx))?;
        let amt = buf.len().min(available.len());
        buf[..amt].copy_from_slice(&available[..amt]);
        self.consume(amt);
        Poll::Ready(Ok(amt))
    }
}

/// A request body: a single consumable subscription plus its idle guard.
#[derive(Debug)]
pub struct GuardedBody {
    reader: BodyReader,
    length: Option<usize>,
    // Keeps the guard signal alive for as long as the body exists.
    _guard: Option<Arc<StopSource>>,
}

impl GuardedBody {
    /// Wrap `stream` for consumption under `token`.
    ///
    /// With an `idle` window, a watchdog cancels the subscription and
    /// releases the transport if nothing reads the body in time. The
    /// optional `on_first_read` channel fires when consumption starts.
    pub fn new(
        stream: &ChunkStream,
        token: &StopToken,
        idle: Option<Duration>,
        on_first_read: Option<Sender<()>>,
        length: Option<usize>,
    ) -> Self {
        let mut notifiers = Vec::new();
        if let Some(sender) = on_first_read {
            notifiers.push(sender);
        }
        let mut guard = None;
        let subscription = match idle {
            None => stream.subscribe(token.clone()),
            Some(window) => {
                let source = Arc::new(StopSource::new());
                let sub_token = StopToken::merged(token, &source.token());
                let subscription = stream.subscribe(sub_token.clone());
                let (consumed_tx, consumed_rx) = async_channel::bounded(1);
                notifiers.push(consumed_tx);
                let watchdog = source.clone();
                async_global_executor::spawn(async move {
                    let disarm = async {
                        let _ = consumed_rx.recv().await;
                        false
                    };
                    let cancelled = async {
                        sub_token.stopped().await;
                        false
                    };
                    let expired = async {
                        Timer::after(window).await;
                        true
                    };
                    if future::or(disarm, future::or(cancelled, expired)).await {
                        log::debug!("request body unread for {:?}, releasing transport", window);
                        watchdog.stop();
                    }
                })
                .detach();
                guard = Some(source);
                subscription
            }
        };
        Self {
            reader: BodyReader::new(subscription, notifiers),
            length,
            _guard: guard,
        }
    }

    /// A body with no content.
    pub fn empty() -> Self {
        Self {
            reader: BodyReader::new(Stream::empty().subscribe(StopToken::never()), Vec::new()),
            length: Some(0),
            _guard: None,
        }
    }

    /// The advertised content length, when known up front.
    pub fn len(&self) -> Option<usize> {
        self.length
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }

    pub(crate) fn into_reader(self) -> BodyReader {
        self.reader
    }
}
