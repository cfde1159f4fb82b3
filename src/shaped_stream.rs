//! Asynchronous stream implementation of the inner shaper layer.

use core::{
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::io::{self, ErrorKind};

use bytes::BytesMut;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    drbg::Seed,
    error::{Error, Retryable},
    polymorph::PendingFrames,
    shaper::ShaperSession,
    specification::CONSUME_READ_SIZE,
    stretch::TableCache,
};

pin_project! {
    /// A byte stream whose wire form is entropy-reshaped.
    ///
    /// Writes are expanded through the session tables and emitted in
    /// randomly sized segments; reads reverse the transform. Both peers
    /// must construct their stream from the same seed.
    ///
    /// [`ShapedStream`] implements [`AsyncRead`] and [`AsyncWrite`], so it
    /// can be used like a [`TcpStream`] and stacked under the framed outer
    /// layer.
    ///
    /// [`TcpStream`]: tokio::net::TcpStream
    #[derive(Debug)]
    pub struct ShapedStream<IO> {
        stream: IO,
        session: ShaperSession,
        recv_buf: BytesMut,
        read_scratch: Vec<u8>,
        decoded: PendingFrames,
        pending: PendingFrames,
        write_state: WriteState,
        segment_remaining: usize,
        read_eof: bool,
    }
}

#[derive(Copy, Clone, Debug)]
enum WriteState {
    Ready,
    Flushing { consumed: usize },
}

impl<IO> ShapedStream<IO> {
    /// Wrap `stream`, deriving every shaper parameter from `seed`.
    ///
    /// Connections created from the same seed share reshaping tables
    /// through `cache`.
    pub fn with_seed_in(seed: &Seed, is_server: bool, cache: &TableCache, stream: IO) -> Self {
        Self {
            stream,
            session: ShaperSession::new(seed, is_server, cache),
            recv_buf: BytesMut::with_capacity(CONSUME_READ_SIZE),
            read_scratch: vec![0u8; CONSUME_READ_SIZE],
            decoded: PendingFrames::new(),
            pending: PendingFrames::new(),
            write_state: WriteState::Ready,
            segment_remaining: 0,
            read_eof: false,
        }
    }

    /// Returns a reference to the inner stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }
}

impl<IO> ShapedStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    /// Drain pending wire bytes, one sampled segment per underlying write.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            if self.segment_remaining == 0 {
                self.segment_remaining = self.session.segmenter.next_length();
            }

            let chunk = self.pending.peek(self.segment_remaining);
            let chunk_len = chunk.len();
            match ready!(Pin::new(&mut self.stream).poll_write(cx, chunk)) {
                Ok(0) => {
                    return Poll::Ready(Err(ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    debug_assert!(n <= chunk_len);
                    self.pending.advance(n);
                    self.segment_remaining -= n;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<IO> AsyncRead for ShapedStream<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            // Serve already-decoded bytes first.
            if !me.decoded.is_empty() {
                let n = buf.remaining().min(me.decoded.len());
                buf.put_slice(me.decoded.peek(n));
                me.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }
            if me.read_eof {
                return Poll::Ready(Ok(()));
            }

            // Decode as many complete frames as the receive buffer holds.
            loop {
                match me.session.decoder.decode(&mut me.recv_buf) {
                    Ok(body) => {
                        me.decoded.buf_mut().extend_from_slice(&body);
                    }
                    Err(Error::Retryable(Retryable::MoreDataNeeded)) => break,
                    Err(e) => return Poll::Ready(Err(e.into())),
                }
            }
            if !me.decoded.is_empty() {
                continue;
            }

            // Need more wire bytes.
            let mut scratch = ReadBuf::new(&mut me.read_scratch);
            ready!(Pin::new(&mut me.stream).poll_read(cx, &mut scratch))?;
            let filled = scratch.filled();
            if filled.is_empty() {
                me.read_eof = true;
                return Poll::Ready(Ok(()));
            }
            me.recv_buf.extend_from_slice(filled);
        }
    }
}

impl<IO> AsyncWrite for ShapedStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        loop {
            match me.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    me.session
                        .encoder
                        .chop(buf, me.pending.buf_mut())
                        .map_err(io::Error::from)?;
                    me.write_state = WriteState::Flushing {
                        consumed: buf.len(),
                    };
                }
                WriteState::Flushing { consumed } => {
                    ready!(me.poll_drain(cx))?;
                    me.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_drain(cx))?;
        // A completed flush retires any abandoned in-flight write; the
        // next poll_write starts a fresh burst.
        me.write_state = WriteState::Ready;
        Pin::new(&mut me.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let me = self.get_mut();
        Pin::new(&mut me.stream).poll_shutdown(cx)
    }
}
