use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::io::{AsyncBufRead, AsyncRead};
use futures_lite::ready;
use pin_project::pin_project;

/// Decodes a chunked body according to
/// https://tools.ietf.org/html/rfc7230#section-4.1
///
/// Trailers are parsed for framing correctness and then discarded.
#[pin_project]
#[derive(Debug)]
pub(crate) struct ChunkedDecoder<R: AsyncBufRead> {
    /// The underlying stream
    #[pin]
    inner: R,
    /// Current state.
    state: State,
}

impl<R: AsyncBufRead> ChunkedDecoder<R> {
    pub(crate) fn new(inner: R) -> Self {
        ChunkedDecoder {
            inner,
            state: State::Read(ReadState::BeforeChunk {
                size: 0,
                inner: ChunkSizeState::ChunkSize,
            }),
        }
    }

    /// Unwrap the underlying reader. Meaningful once the final chunk
    /// and its trailers have been consumed.
    pub(crate) fn into_inner(self) -> R {
        self.inner
    }
}

const MAX_CHUNK_SIZE: u64 = 0x0FFF_FFFF_FFFF_FFFF;

fn read_chunk_size(
    buf: &[u8],
    size: &mut u64,
    state: &mut ChunkSizeState,
) -> io::Result<(usize, bool)> {
    for (offset, c) in buf.iter().copied().enumerate() {
        match *state {
            ChunkSizeState::ChunkSize => match c {
                b'0'..=b'9' => *size = (*size << 4) + (c - b'0') as u64,
                b'a'..=b'f' => *size = (*size << 4) + (c + 10 - b'a') as u64,
                b'A'..=b'F' => *size = (*size << 4) + (c + 10 - b'A') as u64,
                b';' => *state = ChunkSizeState::Extension,
                b'\r' => *state = ChunkSizeState::NewLine,
                _ => return Err(other_err(httparse::InvalidChunkSize)),
            },
            ChunkSizeState::Extension => match c {
                b'\r' => *state = ChunkSizeState::NewLine,
                _ => return Err(other_err(httparse::InvalidChunkSize)),
            },
            ChunkSizeState::NewLine => match c {
                b'\n' => return Ok((offset + 1, true)),
                _ => return Err(other_err(httparse::InvalidChunkSize)),
            },
        }
        if *size > MAX_CHUNK_SIZE {
            return Err(other_err(httparse::InvalidChunkSize));
        }
    }
    Ok((buf.len(), false))
}

impl<R: AsyncBufRead> AsyncRead for ChunkedDecoder<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let inner_buf = ready!(self.as_mut().poll_fill_buf(cx))?;
        let amt = buf.len().min(inner_buf.len());
        buf[0..amt].copy_from_slice(&inner_buf[0..amt]);
        self.consume(amt);

        Poll::Ready(Ok(amt))
    }
}

impl<R: AsyncBufRead> AsyncBufRead for ChunkedDecoder<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let mut this = self.project();

        let pass_through_state = loop {
            match this.state {
                State::PassThrough(pass_through_state) => {
                    if pass_through_state.offset < pass_through_state.size {
                        break pass_through_state;
                    } else {
                        *this.state = State::Read(ReadState::AfterChunk { new_line: false });
                    }
                }
                State::Read(read_state) => {
                    let inner_buf = ready!(this.inner.as_mut().poll_fill_buf(cx))?;

                    if inner_buf.is_empty() {
                        return Poll::Ready(Err(unexpected_eof()));
                    }

                    let mut read = 0;
                    while read < inner_buf.len() {
                        let (nread, next_state) = read_state.advance(&inner_buf[read..])?;
                        read += nread;
                        if let Some(next_state) = next_state {
                            *this.state = next_state;
                            break;
                        }
                    }
                    this.inner.as_mut().consume(read);
                }
                State::Done => return Poll::Ready(Ok(&[])),
            }
        };

        // Unfortunately due to lifetime limitations, this can't be part of the main loop
        let inner_buf = ready!(this.inner.poll_fill_buf(cx))?;

        // Work out how much of the buffer we can pass through
        let max_read = pass_through_state.size - pass_through_state.offset;
        let amt = max_read.min(inner_buf.len() as u64) as usize;

        Poll::Ready(if amt == 0 {
            Err(unexpected_eof())
        } else {
            Ok(&inner_buf[0..amt])
        })
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.project();
        if amt > 0 {
            if let State::PassThrough(pass_through_state) = this.state {
                pass_through_state.offset += amt as u64;
                assert!(pass_through_state.offset <= pass_through_state.size);
                this.inner.consume(amt);
            } else {
                panic!("Called consume without first filling buffer");
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ChunkSizeState {
    ChunkSize,
    Extension,
    NewLine,
}

// Decoder state
#[derive(Debug)]
enum State {
    // We're inside a chunk
    PassThrough(PassThroughState),
    // We're reading the framing around a chunk
    Read(ReadState),
    // We're done
    Done,
}

#[derive(Debug)]
struct PassThroughState {
    // Where we are within the chunk
    offset: u64,
    // How big the chunk is
    size: u64,
}

#[derive(Debug)]
enum ReadState {
    // Reading the framing before a chunk
    BeforeChunk { size: u64, inner: ChunkSizeState },
    // Just finished reading the chunk data
    AfterChunk { new_line: bool },
    // Just read CRLF after chunk data
    MaybeTrailer { new_line: bool },
    // Accumulating trailers into a buffer
    Trailer { buffer: Vec<u8> },
}

impl ReadState {
    fn advance(&mut self, buf: &[u8]) -> io::Result<(usize, Option<State>)> {
        match self {
            ReadState::BeforeChunk { size, inner } => {
                let (amt, done) = read_chunk_size(buf, size, inner)?;
                if done {
                    Ok((
                        amt,
                        if *size > 0 {
                            Some(State::PassThrough(PassThroughState {
                                offset: 0,
                                size: *size,
                            }))
                        } else {
                            *self = ReadState::MaybeTrailer { new_line: false };
                            None
                        },
                    ))
                } else {
                    Ok((amt, None))
                }
            }
            ReadState::AfterChunk { new_line } => match (*new_line, buf[0]) {
                (false, b'\r') => {
                    *new_line = true;
                    Ok((1, None))
                }
                (true, b'\n') => {
                    *self = ReadState::BeforeChunk {
                        size: 0,
                        inner: ChunkSizeState::ChunkSize,
                    };
                    Ok((1, None))
                }
                _ => Err(invalid_data_err()),
            },
            ReadState::MaybeTrailer { new_line } => match (*new_line, buf[0]) {
                (false, b'\r') => {
                    *new_line = true;
                    Ok((1, None))
                }
                (true, b'\n') => Ok((1, Some(State::Done))),
                (false, _) => {
                    *self = ReadState::Trailer { buffer: Vec::new() };
                    Ok((0, None))
                }
                (true, _) => Err(invalid_data_err()),
            },
            ReadState::Trailer { buffer } => {
                buffer.extend_from_slice(buf);
                let mut headers = [httparse::EMPTY_HEADER; 16];
                match httparse::parse_headers(buffer, &mut headers) {
                    Ok(httparse::Status::Complete((amt, headers))) => {
                        log::trace!("discarding {} chunked trailer(s)", headers.len());
                        Ok((amt, Some(State::Done)))
                    }
                    Ok(httparse::Status::Partial) => Ok((buf.len(), None)),
                    Err(err) => Err(other_err(err)),
                }
            }
        }
    }
}

fn other_err<E: Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn invalid_data_err() -> io::Error {
    io::Error::from(io::ErrorKind::InvalidData)
}

fn unexpected_eof() -> io::Error {
    io::Error::from(io::ErrorKind::UnexpectedEof)
}
