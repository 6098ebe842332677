use std::io;

use futures_lite::io::AsyncWrite;
use futures_lite::AsyncWriteExt;

/// Write-side chunked framing according to
/// https://tools.ietf.org/html/rfc7230#section-4.1
///
/// Empty payloads are skipped: a zero-length chunk is the terminator,
/// and only [`finish`][ChunkedEncoder::finish] writes it.
#[derive(Debug)]
pub(crate) struct ChunkedEncoder<W> {
    sink: W,
    done: bool,
}

impl<W: AsyncWrite + Unpin> ChunkedEncoder<W> {
    /// Create a new instance.
    pub(crate) fn new(sink: W) -> Self {
        Self { sink, done: false }
    }

    /// Frame and write one chunk, flushing so long-lived feeds are
    /// delivered promptly.
    pub(crate) async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if self.done || data.is_empty() {
            return Ok(());
        }
        let head = format!("{:X}\r\n", data.len());
        self.sink.write_all(head.as_bytes()).await?;
        self.sink.write_all(data).await?;
        self.sink.write_all(b"\r\n").await?;
        self.sink.flush().await?;
        Ok(())
    }

    /// Access the underlying sink.
    pub(crate) fn get_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    /// Write the terminating chunk. Idempotent.
    pub(crate) async fn finish(&mut self) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.sink.write_all(b"0\r\n\r\n").await?;
        self.sink.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use futures_lite::io::Cursor;

    #[test]
    fn frames_chunks_and_terminator() {
        block_on(async {
            let mut encoder = ChunkedEncoder::new(Cursor::new(Vec::new()));
            encoder.write_chunk(b"Wiki").await.unwrap();
            encoder.write_chunk(b"").await.unwrap();
            encoder.write_chunk(b"pedia").await.unwrap();
            encoder.finish().await.unwrap();
            encoder.finish().await.unwrap();
            let wire = encoder.sink.into_inner();
            assert_eq!(wire, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec());
        });
    }
}
