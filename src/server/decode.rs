//! Decodes HTTP requests off a connection.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use futures_lite::io::BufReader;
use futures_lite::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use http_types::headers::{CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http_types::{ensure, ensure_eq, format_err, Method, Url};

use crate::body::{ChunkStream, GuardedBody};
use crate::chunked::ChunkedDecoder;
use crate::request::Request;
use crate::stop::StopToken;
use crate::{MAX_HEADERS, MAX_HEAD_LENGTH};

const LF: u8 = b'\n';

/// The number returned from httparse when the request is HTTP 1.1
const HTTP_1_1_VERSION: u8 = 1;

const CONTINUE_HEADER_VALUE: &str = "100-continue";
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Per-connection facts stamped onto every decoded request.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionInfo {
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) secure: bool,
    /// Idle window before an unread body releases the transport.
    pub(crate) body_idle: Option<Duration>,
}

/// How the connection loop gets its reader back after a request.
pub(crate) enum Reclaim<IO> {
    /// The request had no body reading from the transport.
    Ready(BufReader<IO>),
    /// The body owns the reader until it is drained; a dropped channel
    /// means the transport cannot serve another request.
    AfterBody(async_channel::Receiver<BufReader<IO>>),
}

pub(crate) struct Decoded<IO> {
    pub(crate) request: Request,
    pub(crate) keep_alive: bool,
    pub(crate) reclaim: Reclaim<IO>,
}

/// Decode one request head plus body wiring. `Ok(None)` means the peer
/// closed the connection cleanly before sending a head.
pub(crate) async fn decode<IO>(
    mut reader: BufReader<IO>,
    writer: IO,
    token: StopToken,
    info: &ConnectionInfo,
) -> http_types::Result<Option<Decoded<IO>>>
where
    IO: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let mut buf = Vec::new();
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut httparse_req = httparse::Request::new(&mut headers);

    // Keep reading bytes from the stream until we hit the end of the head.
    loop {
        let bytes_read = reader.read_until(LF, &mut buf).await?;
        // No more bytes are yielded from the stream.
        if bytes_read == 0 {
            return Ok(None);
        }

        // Prevent CWE-400 DDOS with large HTTP Headers.
        ensure!(
            buf.len() < MAX_HEAD_LENGTH,
            "Head byte length should be less than 8kb"
        );

        // We've hit the end delimiter of the head.
        let idx = buf.len() - 1;
        if idx >= 3 && &buf[idx - 3..=idx] == b"\r\n\r\n" {
            break;
        }
    }

    let status = httparse_req.parse(&buf)?;
    ensure!(!status.is_partial(), "Malformed HTTP head");

    let method = httparse_req.method;
    let method = method.ok_or_else(|| format_err!("No method found"))?;

    let version = httparse_req.version;
    let version = version.ok_or_else(|| format_err!("No version found"))?;

    ensure_eq!(
        version,
        HTTP_1_1_VERSION,
        "Unsupported HTTP version 1.{}",
        version
    );

    let scheme = if info.secure { "https" } else { "http" };
    let url = url_from_httparse_req(&httparse_req, scheme)?;

    let mut req = Request::new(Method::from_str(method)?, url, token.clone());
    for header in httparse_req.headers.iter() {
        req.append_header(header.name, std::str::from_utf8(header.value)?);
    }
    if let Some(peer) = info.peer {
        req.set_remote_addr(peer);
    }
    req.set_secure(info.secure);

    let keep_alive = !connection_close_requested(&req);

    let content_length = req.header(CONTENT_LENGTH);
    let transfer_encoding = req.header(TRANSFER_ENCODING);

    ensure!(
        content_length.is_none() || transfer_encoding.is_none(),
        "Unexpected Content-Length header"
    );

    let on_first_read = if let Some(CONTINUE_HEADER_VALUE) = req.header(EXPECT).map(|h| h.as_str()) {
        let (sender, receiver) = async_channel::bounded(1);
        let mut writer = writer;
        async_global_executor::spawn(async move {
            if receiver.recv().await.is_ok() {
                writer.write_all(CONTINUE_RESPONSE).await.ok();
            }
        })
        .detach();
        Some(sender)
    } else {
        None
    };

    let chunked = transfer_encoding
        .map(|values| values.last().as_str().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    if chunked {
        let (reclaim_tx, reclaim_rx) = async_channel::bounded(1);
        let stream = ChunkStream::from_transport(
            ChunkedDecoder::new(reader),
            token.clone(),
            reclaim_tx,
            ChunkedDecoder::into_inner,
        );
        let body = GuardedBody::new(&stream, &token, info.body_idle, on_first_read, None);
        req.set_body(body);
        return Ok(Some(Decoded {
            request: req,
            keep_alive,
            reclaim: Reclaim::AfterBody(reclaim_rx),
        }));
    }

    if let Some(len) = content_length {
        let len = len.last().as_str().parse::<usize>()?;
        if len > 0 {
            let (reclaim_tx, reclaim_rx) = async_channel::bounded(1);
            let stream = ChunkStream::from_transport(
                reader.take(len as u64),
                token.clone(),
                reclaim_tx,
                futures_lite::io::Take::into_inner,
            );
            let body = GuardedBody::new(&stream, &token, info.body_idle, on_first_read, Some(len));
            req.set_body(body);
            return Ok(Some(Decoded {
                request: req,
                keep_alive,
                reclaim: Reclaim::AfterBody(reclaim_rx),
            }));
        }
    }

    Ok(Some(Decoded {
        request: req,
        keep_alive,
        reclaim: Reclaim::Ready(reader),
    }))
}

fn connection_close_requested(req: &Request) -> bool {
    req.header("connection")
        .map(|values| {
            values
                .as_str()
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false)
}

fn url_from_httparse_req(req: &httparse::Request<'_, '_>, scheme: &str) -> http_types::Result<Url> {
    let path = req.path.ok_or_else(|| format_err!("No uri found"))?;
    let host = req
        .headers
        .iter()
        .find(|x| x.name.eq_ignore_ascii_case("host"))
        .ok_or_else(|| format_err!("Mandatory Host header missing"))?
        .value;

    let host = std::str::from_utf8(host)?;

    if path.starts_with("http://") || path.starts_with("https://") {
        Ok(Url::parse(path)?)
    } else if path.starts_with('/') {
        Ok(Url::parse(&format!("{}://{}/", scheme, host))?.join(path)?)
    } else if req.method.unwrap_or_default().eq_ignore_ascii_case("connect") {
        Ok(Url::parse(&format!("{}://{}/", scheme, path))?)
    } else {
        Err(format_err!("unexpected uri format"))
    }
}
