//! Writes replies onto their transports.
//!
//! The writer is push driven: it subscribes to the reply's body stream
//! and drives chunks at the sink, racing cancellation ahead of every
//! write. A response that was cancelled before the head goes out
//! writes nothing at all.

use std::io;

use futures_lite::{future, AsyncWrite, AsyncWriteExt, StreamExt};
use http_types::headers::DATE;
use http_types::{format_err, Error, Method, StatusCode};

use crate::chunked::ChunkedEncoder;
use crate::date::fmt_http_date;
use crate::h2::CompatResponse;
use crate::reply::{Reply, ReplyBody};
use crate::request::Request;

/// How a write attempt concluded.
#[derive(Debug)]
pub(crate) enum WriteOutcome {
    /// Head and body were fully written.
    Ended,
    /// Cancellation or a peer close cut the response short.
    Aborted,
    /// The sink failed mid-write, or the body broke its contract.
    Errored(Error),
}

/// How the body will be delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Sized(usize),
    Chunked,
    UntilClose,
}

/// Statuses that never carry a payload.
fn bodyless_status(status: StatusCode) -> bool {
    let code: u16 = status.into();
    matches!(code, 100..=199 | 204 | 304)
}

fn explicit_content_length(reply: &Reply) -> Option<usize> {
    reply
        .header("content-length")
        .and_then(|values| values.as_str().parse().ok())
}

fn close_requested(reply: &Reply) -> bool {
    reply
        .header("connection")
        .map(|values| {
            values
                .as_str()
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false)
}

fn reason_line(status: StatusCode, reason: Option<&str>) -> http_types::Result<String> {
    match reason {
        None => Ok(status.canonical_reason().to_string()),
        Some(reason) => {
            let clean = reason
                .chars()
                .all(|c| c == ' ' || c == '\t' || c.is_ascii_graphic());
            if clean {
                Ok(reason.to_string())
            } else {
                Err(format_err!("invalid character in status message"))
            }
        }
    }
}

/// Whether a write error means the peer went away rather than the
/// transport misbehaving.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

fn disconnect_outcome(err: io::Error) -> WriteOutcome {
    if is_disconnect(&err) {
        WriteOutcome::Aborted
    } else {
        WriteOutcome::Errored(err.into())
    }
}

/// Write `reply` as an HTTP/1.1 response. Returns the outcome plus
/// whether the connection may serve another request afterwards.
pub(crate) async fn write_http1<IO>(
    io: &mut IO,
    req: &Request,
    mut reply: Reply,
) -> (WriteOutcome, bool)
where
    IO: AsyncWrite + Unpin,
{
    let token = req.token().clone();
    if token.is_stopped() {
        // The request is already dead; never start a response.
        return (WriteOutcome::Aborted, false);
    }

    let status = reply.status_or_default();
    let reason = match reason_line(status, reply.reason()) {
        Ok(reason) => reason,
        Err(err) => return (WriteOutcome::Errored(err), false),
    };
    let ignore_body = req.method() == Method::Head;
    let reuse_allowed = !close_requested(&reply);

    let (framing, stream) = match reply.take_body() {
        ReplyBody::None | ReplyBody::Upgrade => (Framing::Sized(0), None),
        ReplyBody::Stream { stream, length } => {
            if bodyless_status(status) {
                // The source is dropped without ever being subscribed.
                (Framing::Sized(0), None)
            } else if let Some(len) = length.or_else(|| explicit_content_length(&reply)) {
                (Framing::Sized(len), Some(stream))
            } else if reply.header("connection").is_some() {
                (Framing::UntilClose, Some(stream))
            } else {
                (Framing::Chunked, Some(stream))
            }
        }
    };

    let mut head = Vec::new();
    let encode_head = |head: &mut Vec<u8>| -> io::Result<()> {
        std::io::Write::write_fmt(head, format_args!("HTTP/1.1 {} {}\r\n", status, reason))?;
        if !bodyless_status(status) {
            match framing {
                Framing::Sized(len) => {
                    if explicit_content_length(&reply).is_none() {
                        std::io::Write::write_fmt(
                            head,
                            format_args!("content-length: {}\r\n", len),
                        )?;
                    }
                }
                Framing::Chunked => {
                    std::io::Write::write_fmt(
                        head,
                        format_args!("transfer-encoding: chunked\r\n"),
                    )?;
                }
                Framing::UntilClose => {}
            }
        }
        if reply.header(DATE).is_none() {
            let date = fmt_http_date(std::time::SystemTime::now());
            std::io::Write::write_fmt(head, format_args!("date: {}\r\n", date))?;
        }
        for (header, values) in reply.iter() {
            for value in values.iter() {
                std::io::Write::write_fmt(head, format_args!("{}: {}\r\n", header, value))?;
            }
        }
        std::io::Write::write_fmt(head, format_args!("\r\n"))?;
        Ok(())
    };
    if let Err(err) = encode_head(&mut head) {
        return (WriteOutcome::Errored(err.into()), false);
    }

    if let Err(err) = io.write_all(&head).await {
        return (disconnect_outcome(err), false);
    }

    let stream = match stream {
        Some(stream) if !ignore_body && framing != Framing::Sized(0) => stream,
        _ => {
            // HEAD and empty bodies end right after the head.
            if let Err(err) = io.flush().await {
                return (disconnect_outcome(err), false);
            }
            return (WriteOutcome::Ended, reuse_allowed);
        }
    };

    let mut sub = stream.subscribe(token.clone());
    let mut chunked = ChunkedEncoder::new(io);
    let mut remaining = match framing {
        Framing::Sized(len) => Some(len),
        _ => None,
    };

    loop {
        let item = {
            let cancelled = async {
                token.stopped().await;
                None
            };
            future::or(cancelled, sub.next()).await
        };
        match item {
            Some(Ok(mut chunk)) => {
                if let Some(remaining) = remaining.as_mut() {
                    if chunk.len() > *remaining {
                        log::warn!("response body produced more than its advertised length");
                        chunk.truncate(*remaining);
                    }
                    *remaining -= chunk.len();
                }
                let write = async {
                    match framing {
                        Framing::Chunked => chunked.write_chunk(&chunk).await,
                        _ => {
                            let io = chunked.get_mut();
                            io.write_all(&chunk).await?;
                            io.flush().await
                        }
                    }
                };
                let cancelled = async {
                    token.stopped().await;
                    Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"))
                };
                match future::or(cancelled, write).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        return (WriteOutcome::Aborted, false);
                    }
                    Err(err) => return (disconnect_outcome(err), false),
                }
            }
            Some(Err(err)) => {
                // The head is out; the peer sees a truncated body.
                return (WriteOutcome::Errored(err), false);
            }
            None => {
                match framing {
                    Framing::Sized(len) => {
                        if remaining != Some(0) {
                            if token.is_stopped() {
                                return (WriteOutcome::Aborted, false);
                            }
                            let err = format_err!(
                                "response body ended {} bytes short of its advertised length {}",
                                remaining.unwrap_or_default(),
                                len
                            );
                            return (WriteOutcome::Errored(err), false);
                        }
                    }
                    Framing::Chunked => {
                        if token.is_stopped() {
                            return (WriteOutcome::Aborted, false);
                        }
                        if let Err(err) = chunked.finish().await {
                            return (disconnect_outcome(err), false);
                        }
                    }
                    Framing::UntilClose => {
                        if token.is_stopped() {
                            return (WriteOutcome::Aborted, false);
                        }
                    }
                }
                if let Err(err) = chunked.get_mut().flush().await {
                    return (disconnect_outcome(err), false);
                }
                let reusable = reuse_allowed && framing != Framing::UntilClose;
                return (WriteOutcome::Ended, reusable);
            }
        }
    }
}

/// Write `reply` onto an HTTP/2 compatibility stream.
pub(crate) async fn write_to_compat(
    mut sink: Box<dyn CompatResponse>,
    req: &Request,
    mut reply: Reply,
) -> WriteOutcome {
    let token = req.token().clone();
    if token.is_stopped() || sink.is_closed() {
        return WriteOutcome::Aborted;
    }

    let status = reply.status_or_default();
    let mut headers: Vec<(String, String)> = Vec::new();
    if let (ReplyBody::Stream { length: Some(len), .. }, None) =
        (reply.body(), explicit_content_length(&reply))
    {
        headers.push(("content-length".into(), len.to_string()));
    }
    for (header, values) in reply.iter() {
        for value in values.iter() {
            headers.push((header.as_str().to_string(), value.as_str().to_string()));
        }
    }

    // Transports without a reason phrase reject custom ones; retry the
    // head bare before giving up.
    if let Err(err) = sink.send_head(status, reply.reason(), &headers) {
        if reply.reason().is_some() {
            log::warn!(
                "response head rejected ({}), retrying without a status message",
                err
            );
            if let Err(err) = sink.send_head(status, None, &headers) {
                return WriteOutcome::Errored(err.into());
            }
        } else {
            return WriteOutcome::Errored(err.into());
        }
    }

    let ignore_body = req.method() == Method::Head;
    let stream = match reply.take_body() {
        ReplyBody::Stream { stream, .. } if !ignore_body && !bodyless_status(status) => {
            Some(stream)
        }
        _ => None,
    };

    if let Some(stream) = stream {
        let mut sub = stream.subscribe(token.clone());
        loop {
            if sink.is_closed() {
                return WriteOutcome::Aborted;
            }
            let item = {
                let cancelled = async {
                    token.stopped().await;
                    None
                };
                future::or(cancelled, sub.next()).await
            };
            match item {
                Some(Ok(chunk)) => {
                    if let Err(err) = sink.write_chunk(&chunk).await {
                        if sink.is_benign_close_race(&err) {
                            log::trace!("peer closed mid-write, dropping the rest of the body");
                            return WriteOutcome::Aborted;
                        }
                        return WriteOutcome::Errored(err.into());
                    }
                }
                Some(Err(err)) => return WriteOutcome::Errored(err),
                None => {
                    if token.is_stopped() {
                        return WriteOutcome::Aborted;
                    }
                    break;
                }
            }
        }
    }

    // Give freshly opened pushes a tick to claim their streams before
    // the parent response ends.
    if req.has_active_pushes() {
        future::yield_now().await;
    }
    match sink.end().await {
        Ok(()) => WriteOutcome::Ended,
        Err(err) if sink.is_benign_close_race(&err) => WriteOutcome::Aborted,
        Err(err) => WriteOutcome::Errored(err.into()),
    }
}

/// Serialize just a status line and headers onto a raw socket, used to
/// refuse protocol upgrades.
pub(crate) async fn write_raw_head<IO>(io: &mut IO, reply: &Reply) -> io::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    let status = reply.status_or_default();
    let reason = match reply.reason() {
        Some(reason) => reason,
        None => status.canonical_reason(),
    };
    let mut head = Vec::new();
    std::io::Write::write_fmt(&mut head, format_args!("HTTP/1.1 {} {}\r\n", status, reason))?;
    for (header, values) in reply.iter() {
        for value in values.iter() {
            std::io::Write::write_fmt(&mut head, format_args!("{}: {}\r\n", header, value))?;
        }
    }
    std::io::Write::write_fmt(&mut head, format_args!("\r\n"))?;
    io.write_all(&head).await?;
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ChunkStream;
    use crate::stop::{StopSource, StopToken};
    use futures_lite::future::block_on;
    use futures_lite::io::Cursor;
    use http_types::Url;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    fn request(method: Method, token: StopToken) -> Request {
        let url = Url::parse("http://localhost/test").unwrap();
        Request::new(method, url, token)
    }

    fn written(cursor: Cursor<Vec<u8>>) -> String {
        String::from_utf8(cursor.into_inner()).unwrap()
    }

    #[test]
    fn cancelled_before_start_writes_no_bytes() {
        block_on(async {
            let source = StopSource::new();
            let req = request(Method::Get, source.token());
            source.stop();

            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_string("never sent");

            let mut io = Cursor::new(Vec::new());
            let (outcome, reusable) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Aborted));
            assert!(!reusable);
            assert!(written(io).is_empty());
        });
    }

    #[test]
    fn sized_bodies_carry_content_length() {
        block_on(async {
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_string("hello");

            let mut io = Cursor::new(Vec::new());
            let (outcome, reusable) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Ended));
            assert!(reusable);

            let out = written(io);
            assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(out.contains("content-length: 5\r\n"));
            assert!(out.contains("date: "));
            assert!(out.ends_with("\r\n\r\nhello"));
        });
    }

    #[test]
    fn unsized_streams_use_chunked_framing() {
        block_on(async {
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_stream(ChunkStream::from_bytes(b"hello".to_vec()), None);

            let mut io = Cursor::new(Vec::new());
            let (outcome, reusable) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Ended));
            assert!(reusable);

            let out = written(io);
            assert!(out.contains("transfer-encoding: chunked\r\n"));
            assert!(out.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
        });
    }

    #[test]
    fn head_requests_write_headers_only() {
        block_on(async {
            let req = request(Method::Head, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_string("hello");

            let mut io = Cursor::new(Vec::new());
            let (outcome, _) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Ended));

            let out = written(io);
            assert!(out.contains("content-length: 5\r\n"));
            assert!(out.ends_with("\r\n\r\n"));
        });
    }

    #[test]
    fn control_characters_in_the_reason_are_rejected() {
        block_on(async {
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_reason("OK\r\nx-sneaky: 1");

            let mut io = Cursor::new(Vec::new());
            let (outcome, _) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Errored(_)));
            assert!(written(io).is_empty());
        });
    }

    #[test]
    fn connection_close_disables_reuse() {
        block_on(async {
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.insert_header("connection", "close");
            reply.set_body_string("bye");

            let mut io = Cursor::new(Vec::new());
            let (outcome, reusable) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Ended));
            assert!(!reusable);
        });
    }

    #[test]
    fn short_sized_bodies_error() {
        block_on(async {
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_stream(ChunkStream::from_bytes(b"hi".to_vec()), Some(10));

            let mut io = Cursor::new(Vec::new());
            let (outcome, reusable) = write_http1(&mut io, &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Errored(_)));
            assert!(!reusable);
        });
    }

    #[derive(Default)]
    struct CompatLog {
        heads: Vec<(StatusCode, Option<String>)>,
        chunks: Vec<Vec<u8>>,
        ended: bool,
    }

    struct StubCompat {
        log: Arc<Mutex<CompatLog>>,
        reject_reason: bool,
        fail_writes: Option<io::ErrorKind>,
        benign: bool,
    }

    impl CompatResponse for StubCompat {
        fn send_head(
            &mut self,
            status: StatusCode,
            reason: Option<&str>,
            _headers: &[(String, String)],
        ) -> io::Result<()> {
            if self.reject_reason && reason.is_some() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad reason"));
            }
            self.log
                .lock()
                .unwrap()
                .heads
                .push((status, reason.map(str::to_string)));
            Ok(())
        }

        fn poll_write_chunk(
            &mut self,
            _cx: &mut Context<'_>,
            chunk: &[u8],
        ) -> Poll<io::Result<()>> {
            if let Some(kind) = self.fail_writes {
                return Poll::Ready(Err(io::Error::new(kind, "write failed")));
            }
            self.log.lock().unwrap().chunks.push(chunk.to_vec());
            Poll::Ready(Ok(()))
        }

        fn poll_end(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.log.lock().unwrap().ended = true;
            Poll::Ready(Ok(()))
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn is_benign_close_race(&self, _err: &io::Error) -> bool {
            self.benign
        }
    }

    #[test]
    fn compat_sinks_receive_head_body_and_end() {
        block_on(async {
            let log = Arc::new(Mutex::new(CompatLog::default()));
            let sink = StubCompat {
                log: log.clone(),
                reject_reason: false,
                fail_writes: None,
                benign: false,
            };
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_string("payload");

            let outcome = write_to_compat(Box::new(sink), &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Ended));

            let log = log.lock().unwrap();
            assert_eq!(log.heads.len(), 1);
            assert_eq!(log.chunks, vec![b"payload".to_vec()]);
            assert!(log.ended);
        });
    }

    #[test]
    fn rejected_reason_is_retried_bare() {
        block_on(async {
            let log = Arc::new(Mutex::new(CompatLog::default()));
            let sink = StubCompat {
                log: log.clone(),
                reject_reason: true,
                fail_writes: None,
                benign: false,
            };
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_reason("Totally Fine");

            let outcome = write_to_compat(Box::new(sink), &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Ended));

            let log = log.lock().unwrap();
            assert_eq!(log.heads.len(), 1);
            assert_eq!(log.heads[0].1, None);
        });
    }

    #[test]
    fn benign_close_races_abort_quietly() {
        block_on(async {
            let log = Arc::new(Mutex::new(CompatLog::default()));
            let sink = StubCompat {
                log: log.clone(),
                reject_reason: false,
                fail_writes: Some(io::ErrorKind::BrokenPipe),
                benign: true,
            };
            let req = request(Method::Get, StopToken::never());
            let mut reply = Reply::new();
            reply.set_status(StatusCode::Ok);
            reply.set_body_string("payload");

            let outcome = write_to_compat(Box::new(sink), &req, reply).await;
            assert!(matches!(outcome, WriteOutcome::Aborted));
        });
    }
}
