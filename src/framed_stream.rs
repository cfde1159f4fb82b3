//! Asynchronous stream implementation of the outer layer: AEAD framing,
//! burst padding, inter-arrival scheduling, cover traffic, and the decoy
//! discipline applied after detected tampering.

use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::io::{self, ErrorKind};

use bytes::BytesMut;
use pin_project_lite::pin_project;
use rand::{
    rngs::{OsRng, StdRng},
    Rng, SeedableRng, TryRngCore,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Duration, Sleep},
};

use crate::{
    config::IatMode,
    cover::CoverPolicy,
    crypto::SessionKeys,
    drbg::Seed,
    error::{Error, PeerMisbehaved, Retryable},
    framing::{parse_packet, Decoder, Encoder, SealCodec},
    polymorph::{dummy_traffic, PendingFrames, Polymorph},
    specification::{
        CONSUME_READ_SIZE, MAX_SEGMENT_LENGTH, PACKET_TYPE_PAYLOAD, PACKET_TYPE_PRNG_SEED,
        SEED_PACKET_PAYLOAD_LENGTH,
    },
};

pin_project! {
    /// The outer obfuscated stream.
    ///
    /// Application writes are chopped into packets, sealed into frames with
    /// obfuscated lengths, padded per the length distribution, and written
    /// with the configured inter-arrival schedule. Reads reverse the
    /// framing; padding, dummy and heartbeat bytes never reach the
    /// application.
    ///
    /// On detected tampering the stream enters a decoy mode: it keeps
    /// consuming the underlying connection for a random delay before
    /// surfacing the error, denying active probers a timing signal.
    #[derive(Debug)]
    pub struct FramedStream<IO> {
        stream: IO,
        encoder: Encoder<SealCodec>,
        decoder: Decoder<SealCodec>,
        polymorph: Polymorph,
        cover: Option<CoverPolicy>,
        is_server: bool,
        established: bool,

        recv_buf: BytesMut,
        read_scratch: Vec<u8>,
        decoded: PendingFrames,
        read_eof: bool,
        pending_seed: Option<Seed>,

        pending: PendingFrames,
        write_state: WriteState,
        iat_sleep: Option<Pin<Box<Sleep>>>,

        dummy_queue: PendingFrames,
        heartbeat: Option<Pin<Box<Sleep>>>,

        detected_error: Option<Error>,
        shutdown_timer: Option<Pin<Box<Sleep>>>,
        rng: StdRng,
        max_delay_before_shutdown_ms: u64,
    }
}

#[derive(Copy, Clone, Debug)]
enum WriteState {
    Ready,
    Burst { consumed: usize, segment: usize },
    IatSleep { consumed: usize },
}

impl<IO> FramedStream<IO> {
    pub(crate) fn new(
        stream: IO,
        keys: &SessionKeys,
        is_server: bool,
        len_seed: &Seed,
        iat_mode: IatMode,
        biased: bool,
        cover: Option<CoverPolicy>,
    ) -> Self {
        let (tx, rx) = if is_server {
            (&keys.server, &keys.client)
        } else {
            (&keys.client, &keys.server)
        };

        let mut rng_seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut rng_seed)
            .expect("system random source failure");

        Self {
            encoder: Encoder::new(SealCodec::new(tx), &tx.drbg_seed),
            decoder: Decoder::new(SealCodec::new(rx), &rx.drbg_seed),
            polymorph: Polymorph::new(len_seed, iat_mode, biased),
            cover,
            is_server,
            established: false,
            stream,
            recv_buf: BytesMut::with_capacity(CONSUME_READ_SIZE),
            read_scratch: vec![0u8; CONSUME_READ_SIZE],
            decoded: PendingFrames::new(),
            read_eof: false,
            pending_seed: None,
            pending: PendingFrames::new(),
            write_state: WriteState::Ready,
            iat_sleep: None,
            dummy_queue: PendingFrames::new(),
            heartbeat: None,
            detected_error: None,
            shutdown_timer: None,
            rng: StdRng::from_seed(rng_seed),
            max_delay_before_shutdown_ms: 5000,
        }
    }

    /// Mark the session bootstrap complete. Cover traffic refuses to run
    /// before this.
    pub(crate) fn mark_established(&mut self) {
        self.established = true;
    }

    /// Queue a `PrngSeed` frame carrying `seed`. The server sends this as
    /// its first frame; flush to put it on the wire.
    pub(crate) fn queue_prng_seed(&mut self, seed: &Seed) -> Result<(), Error> {
        self.encoder.make_packet(
            self.pending.buf_mut(),
            PACKET_TYPE_PRNG_SEED,
            seed.as_bytes(),
            0,
        )
    }

    /// Sets the maximum delay before the connection surfaces a detected
    /// tampering error, in milliseconds. The default is 5000.
    ///
    /// The delay is sampled uniformly from `[0, delay_in_millis]`.
    pub fn set_max_delay_before_shutdown(&mut self, delay_in_millis: u64) {
        self.max_delay_before_shutdown_ms = delay_in_millis;
    }

    /// Returns a reference to the inner stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }

    /// Enter decoy mode: remember the error, start the randomized
    /// shutdown timer, and keep reading.
    fn detect(&mut self, error: Error) {
        if self.detected_error.is_some() {
            return;
        }
        let delay = self.rng.random_range(0..=self.max_delay_before_shutdown_ms);
        tracing::debug!(?error, delay_ms = delay, "tampering detected, entering decoy mode");
        self.detected_error = Some(error);
        self.shutdown_timer = Some(Box::pin(sleep(Duration::from_millis(delay))));
    }

    fn in_decoy_mode(&self) -> bool {
        self.detected_error.is_some()
    }

    /// Poll the decoy shutdown timer; once it fires the stored error is
    /// surfaced to every subsequent operation.
    fn poll_shutdown_timer(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let fired = match &mut self.shutdown_timer {
            None => true,
            Some(timer) => {
                let fired = timer.as_mut().poll(cx).is_ready();
                if fired {
                    self.shutdown_timer = None;
                }
                fired
            }
        };
        if fired {
            let error = self
                .detected_error
                .clone()
                .expect("decoy timer without a detected error");
            return Poll::Ready(error.into());
        }
        Poll::Pending
    }
}

impl<IO> FramedStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Build `n` bytes of dummy traffic, provided no application burst is
    /// in flight (dummy frames may only land on frame boundaries).
    fn queue_dummy(&mut self, n: usize) -> Result<(), Error> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        match dummy_traffic(&mut self.encoder, self.established, n, self.dummy_queue.buf_mut()) {
            Ok(()) => Ok(()),
            Err(Error::Retryable(Retryable::NotEstablished)) => {
                tracing::debug!("skipping dummy traffic, session not yet established");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Opportunistically drain queued dummy bytes. Write errors stop the
    /// heartbeat but are not surfaced on the read path.
    fn drain_dummy(&mut self, cx: &mut Context<'_>) {
        while !self.dummy_queue.is_empty() {
            let chunk = self.dummy_queue.peek(usize::MAX);
            match Pin::new(&mut self.stream).poll_write(cx, chunk) {
                Poll::Ready(Ok(n)) if n > 0 => self.dummy_queue.advance(n),
                Poll::Ready(_) => {
                    tracing::debug!("dummy traffic write failed, stopping heartbeat");
                    if let Some(cover) = &mut self.cover {
                        cover.stop_heartbeat();
                    }
                    self.dummy_queue.advance(usize::MAX);
                    return;
                }
                Poll::Pending => return,
            }
        }
    }

    /// Arm and poll the heartbeat timer; fires dummy traffic on expiry.
    fn poll_heartbeat(&mut self, cx: &mut Context<'_>) -> Result<(), Error> {
        if !self.established {
            return Ok(());
        }
        let Some(interval) = self.cover.as_ref().and_then(CoverPolicy::heartbeat_interval)
        else {
            self.heartbeat = None;
            return Ok(());
        };

        let timer = self
            .heartbeat
            .get_or_insert_with(|| Box::pin(sleep(interval)));
        if timer.as_mut().poll(cx).is_ready() {
            let n = self
                .cover
                .as_mut()
                .expect("heartbeat without cover policy")
                .next_dummy_len();
            tracing::debug!(bytes = n, "heartbeat dummy traffic");
            self.queue_dummy(n)?;
            self.heartbeat = Some(Box::pin(sleep(interval)));
        }
        Ok(())
    }

    /// Drive reads until the peer's first frame decodes, without consuming
    /// any application bytes. The client bootstrap uses this to await the
    /// server's `PrngSeed` frame before reporting the connection up.
    pub(crate) async fn wait_first_frame(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| {
            loop {
                if self.in_decoy_mode() {
                    if let Poll::Ready(err) = self.poll_shutdown_timer(cx) {
                        return Poll::Ready(Err(err));
                    }
                    let mut scratch = ReadBuf::new(&mut self.read_scratch);
                    match Pin::new(&mut self.stream).poll_read(cx, &mut scratch) {
                        Poll::Ready(Ok(())) if scratch.filled().is_empty() => {
                            return Poll::Ready(Err(ErrorKind::UnexpectedEof.into()))
                        }
                        Poll::Ready(Ok(())) => continue,
                        Poll::Ready(Err(_)) | Poll::Pending => return Poll::Pending,
                    }
                }

                if self.pending_seed.is_some() || !self.decoded.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                if self.read_eof {
                    return Poll::Ready(Err(ErrorKind::UnexpectedEof.into()));
                }
                if !self.process_frames()? {
                    continue;
                }
                match ready!(self.poll_fill_recv(cx)) {
                    Ok(0) => return Poll::Ready(Err(ErrorKind::UnexpectedEof.into())),
                    Ok(_) => {}
                    Err(e) => match protocol_error(&e) {
                        Some(err @ Error::BadDataReceived(_)) => self.detect(err),
                        _ => return Poll::Ready(Err(e)),
                    },
                }
            }
        })
        .await
    }

    /// Decode every complete frame in the receive buffer into the decoded
    /// byte queue. Returns `Ok(true)` to continue reading, `Ok(false)` on
    /// entering decoy mode.
    fn process_frames(&mut self) -> io::Result<bool> {
        loop {
            match self.decoder.decode(&mut self.recv_buf) {
                Ok(body) => {
                    let pkt = parse_packet(&body).map_err(io::Error::from)?;
                    match pkt.pkt_type {
                        PACKET_TYPE_PAYLOAD => {
                            if !pkt.payload.is_empty() {
                                self.decoded.buf_mut().extend_from_slice(pkt.payload);
                            }
                        }
                        PACKET_TYPE_PRNG_SEED => {
                            if pkt.payload.len() != SEED_PACKET_PAYLOAD_LENGTH {
                                return Err(PeerMisbehaved::SeedPayloadLenInvalid {
                                    received: pkt.payload.len() as u16,
                                }
                                .into());
                            }
                            // Only the client installs the server's
                            // distribution seed; the writer applies it at
                            // the start of its next burst.
                            if !self.is_server {
                                self.pending_seed = Seed::from_slice(pkt.payload);
                            }
                        }
                        _ => {
                            // Unknown packet types are ignored for forward
                            // compatibility.
                        }
                    }
                }
                Err(Error::Retryable(Retryable::MoreDataNeeded)) => return Ok(true),
                Err(e @ Error::BadDataReceived(_)) => {
                    self.detect(e);
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read once from the underlying stream into the receive buffer,
    /// counting the bytes for the cover policy.
    fn poll_fill_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut scratch = ReadBuf::new(&mut self.read_scratch);
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut scratch))?;
        let filled = scratch.filled();
        let n = filled.len();
        if n == 0 {
            self.read_eof = true;
            return Poll::Ready(Ok(0));
        }
        self.recv_buf.extend_from_slice(filled);

        if let Some(cover) = &mut self.cover {
            cover.record_received(n);
            if cover.should_break_burst() {
                let dummy_len = cover.next_dummy_len();
                cover.reset_burst();
                tracing::debug!(bytes = dummy_len, "breaking burst with dummy traffic");
                self.queue_dummy(dummy_len).map_err(io::Error::from)?;
            }
        }
        Poll::Ready(Ok(n))
    }
}

impl<IO> AsyncRead for FramedStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if me.in_decoy_mode() {
                // Keep consuming and discarding until the randomized timer
                // fires, so tampering cannot elicit a prompt reaction. A
                // further error from the (possibly poisoned) lower layer
                // just waits the timer out.
                if let Poll::Ready(err) = me.poll_shutdown_timer(cx) {
                    return Poll::Ready(Err(err));
                }
                let mut scratch = ReadBuf::new(&mut me.read_scratch);
                match Pin::new(&mut me.stream).poll_read(cx, &mut scratch) {
                    Poll::Ready(Ok(())) if scratch.filled().is_empty() => {
                        return Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(_)) | Poll::Pending => return Poll::Pending,
                }
            }

            if let Err(e) = me.poll_heartbeat(cx) {
                return Poll::Ready(Err(e.into()));
            }
            me.drain_dummy(cx);

            if !me.decoded.is_empty() {
                let n = buf.remaining().min(me.decoded.len());
                buf.put_slice(me.decoded.peek(n));
                me.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }
            if me.read_eof {
                return Poll::Ready(Ok(()));
            }

            if !me.process_frames()? {
                // Entered decoy mode; loop into the branch above.
                continue;
            }
            if !me.decoded.is_empty() {
                continue;
            }

            match ready!(me.poll_fill_recv(cx)) {
                Ok(0) => return Poll::Ready(Ok(())),
                Ok(_) => {}
                Err(e) => match protocol_error(&e) {
                    // The lower layer detected tampering of its own; apply
                    // the same decoy discipline.
                    Some(err @ Error::BadDataReceived(_)) => me.detect(err),
                    _ => return Poll::Ready(Err(e)),
                },
            }
        }
    }
}

/// Extract the protocol error carried inside an I/O error, if any.
fn protocol_error(e: &io::Error) -> Option<Error> {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<Error>())
        .cloned()
}

impl<IO> AsyncWrite for FramedStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        loop {
            if me.in_decoy_mode() {
                // The read side is draining toward shutdown; refuse to
                // feed more application data into a dead session.
                if let Poll::Ready(err) = me.poll_shutdown_timer(cx) {
                    return Poll::Ready(Err(err));
                }
                return Poll::Pending;
            }

            match me.write_state {
                WriteState::Ready => {
                    me.drain_dummy(cx);
                    if !me.dummy_queue.is_empty() {
                        return Poll::Pending;
                    }
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }

                    // In-band reseeds take effect at the start of a burst.
                    if let Some(seed) = me.pending_seed.take() {
                        me.polymorph.install_seed(&seed);
                    }

                    me.encoder
                        .chop(buf, me.pending.buf_mut())
                        .map_err(io::Error::from)?;

                    if me.polymorph.iat_mode() != IatMode::Paranoid {
                        // Pad once per burst; paranoid mode pads while
                        // scheduling instead.
                        let target = me.polymorph.sample_target();
                        me.polymorph
                            .pad_burst(&mut me.encoder, &mut me.pending, target)
                            .map_err(io::Error::from)?;
                    }

                    me.write_state = WriteState::Burst {
                        consumed: buf.len(),
                        segment: 0,
                    };
                }
                WriteState::Burst { consumed, segment } => {
                    if me.pending.is_empty() {
                        me.write_state = WriteState::Ready;
                        return Poll::Ready(Ok(consumed));
                    }

                    let segment = if segment > 0 {
                        segment
                    } else {
                        match me.polymorph.iat_mode() {
                            IatMode::None => me.pending.len(),
                            IatMode::Enabled => me.pending.len().min(MAX_SEGMENT_LENGTH),
                            IatMode::Paranoid => {
                                let target = me.polymorph.sample_target();
                                if target == 0 {
                                    continue;
                                }
                                if me.pending.len() < target {
                                    me.polymorph
                                        .pad_burst(&mut me.encoder, &mut me.pending, target)
                                        .map_err(io::Error::from)?;
                                    if me.pending.len() != target {
                                        // Padding needed more than one
                                        // frame and overshot; resample.
                                        continue;
                                    }
                                }
                                target
                            }
                        }
                    };

                    let chunk = me.pending.peek(segment);
                    match ready!(Pin::new(&mut me.stream).poll_write(cx, chunk)) {
                        Ok(0) => return Poll::Ready(Err(ErrorKind::WriteZero.into())),
                        Ok(n) => {
                            me.pending.advance(n);
                            let remaining = segment - n;
                            if remaining > 0 {
                                me.write_state = WriteState::Burst {
                                    consumed,
                                    segment: remaining,
                                };
                            } else if me.polymorph.iat_mode() == IatMode::None {
                                me.write_state = WriteState::Burst {
                                    consumed,
                                    segment: 0,
                                };
                            } else {
                                me.iat_sleep =
                                    Some(Box::pin(sleep(me.polymorph.sample_delay())));
                                me.write_state = WriteState::IatSleep { consumed };
                            }
                        }
                        Err(e) => return Poll::Ready(Err(e)),
                    }
                }
                WriteState::IatSleep { consumed } => {
                    let timer = me
                        .iat_sleep
                        .as_mut()
                        .expect("IAT sleep state without a timer");
                    ready!(timer.as_mut().poll(cx));
                    me.iat_sleep = None;
                    me.write_state = WriteState::Burst {
                        consumed,
                        segment: 0,
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        // Flush drains without inter-arrival scheduling; it is used by the
        // harness to push the bootstrap frames out promptly.
        while !me.dummy_queue.is_empty() {
            let chunk = me.dummy_queue.peek(usize::MAX);
            match ready!(Pin::new(&mut me.stream).poll_write(cx, chunk)) {
                Ok(0) => return Poll::Ready(Err(ErrorKind::WriteZero.into())),
                Ok(n) => me.dummy_queue.advance(n),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        while !me.pending.is_empty() {
            let chunk = me.pending.peek(usize::MAX);
            match ready!(Pin::new(&mut me.stream).poll_write(cx, chunk)) {
                Ok(0) => return Poll::Ready(Err(ErrorKind::WriteZero.into())),
                Ok(n) => me.pending.advance(n),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        me.write_state = WriteState::Ready;
        me.iat_sleep = None;
        Pin::new(&mut me.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let me = self.get_mut();
        Pin::new(&mut me.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{drbg::SEED_LENGTH, specification::KEY_LENGTH};

    fn stream_pair(
        iat_mode: IatMode,
    ) -> (
        FramedStream<tokio::io::DuplexStream>,
        FramedStream<tokio::io::DuplexStream>,
    ) {
        let keys = SessionKeys::derive(&[40u8; KEY_LENGTH].into(), &[41u8; 32]);
        let keys_again = SessionKeys::derive(&[40u8; KEY_LENGTH].into(), &[41u8; 32]);
        let len_seed = Seed::from([42u8; SEED_LENGTH]);

        let (client_io, server_io) = duplex(1 << 22);
        let mut client =
            FramedStream::new(client_io, &keys, false, &len_seed, iat_mode, false, None);
        let mut server =
            FramedStream::new(server_io, &keys_again, true, &len_seed, iat_mode, false, None);
        client.mark_established();
        server.mark_established();
        (client, server)
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (mut client, mut server) = stream_pair(IatMode::None);
        const DATA_LEN: usize = 100_000;
        let data: Vec<u8> = (0..DATA_LEN).map(|i| (i * 31) as u8).collect();

        let writer = {
            let data = data.clone();
            tokio::spawn(async move {
                client.write_all(&data).await.unwrap();
                client.flush().await.unwrap();
                client
            })
        };

        let mut got = vec![0u8; DATA_LEN];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);

        let mut client = writer.await.unwrap();

        // And the reverse direction.
        let reply = b"reply".to_vec();
        server.write_all(&reply).await.unwrap();
        server.flush().await.unwrap();
        let mut got = vec![0u8; reply.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn test_prng_seed_transfers_distribution() {
        let (mut client, mut server) = stream_pair(IatMode::None);
        let new_seed = Seed::from([77u8; SEED_LENGTH]);

        server.queue_prng_seed(&new_seed).unwrap();
        server.flush().await.unwrap();
        server.write_all(b"after seed").await.unwrap();
        server.flush().await.unwrap();

        let mut got = vec![0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"after seed");
        assert!(client.pending_seed.is_some());

        // The seed takes effect on the client's next write.
        client.write_all(b"x").await.unwrap();
        assert!(client.pending_seed.is_none());

        let reference = Polymorph::new(&new_seed, IatMode::None, false);
        assert_eq!(client.polymorph.shapes(), reference.shapes());
    }

    #[tokio::test]
    async fn test_tampering_enters_decoy_then_errors() {
        let keys = SessionKeys::derive(&[50u8; KEY_LENGTH].into(), &[51u8; 32]);
        let len_seed = Seed::from([52u8; SEED_LENGTH]);

        let (client_io, mut attacker) = duplex(1 << 16);
        let mut client =
            FramedStream::new(client_io, &keys, false, &len_seed, IatMode::None, false, None);
        client.mark_established();
        client.set_max_delay_before_shutdown(50);

        // A forged frame: random length prefix plus a full segment of noise.
        attacker.write_all(&[0xde, 0xad]).await.unwrap();
        attacker
            .write_all(&vec![0x5c; MAX_SEGMENT_LENGTH * 2])
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let err = client.read(&mut buf).await.unwrap_err();
        let err = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<Error>())
            .cloned()
            .expect("protocol error expected");
        assert!(matches!(err, Error::BadDataReceived(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_writes_blocked_after_decoy_shutdown() {
        let keys = SessionKeys::derive(&[60u8; KEY_LENGTH].into(), &[61u8; 32]);
        let len_seed = Seed::from([62u8; SEED_LENGTH]);

        let (client_io, mut attacker) = duplex(1 << 16);
        let mut client =
            FramedStream::new(client_io, &keys, false, &len_seed, IatMode::None, false, None);
        client.mark_established();
        client.set_max_delay_before_shutdown(10);

        attacker.write_all(&[0xba, 0xad]).await.unwrap();
        attacker
            .write_all(&vec![0u8; MAX_SEGMENT_LENGTH * 2])
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        assert!(client.read(&mut buf).await.is_err());
        assert!(client.write_all(b"more").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paranoid_write_lengths_come_from_the_distribution() {
        use std::sync::{Arc, Mutex};

        struct CountingIo<IO> {
            inner: IO,
            writes: Arc<Mutex<Vec<usize>>>,
        }

        impl<IO: AsyncRead + Unpin> AsyncRead for CountingIo<IO> {
            fn poll_read(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Pin::new(&mut self.inner).poll_read(cx, buf)
            }
        }

        impl<IO: AsyncWrite + Unpin> AsyncWrite for CountingIo<IO> {
            fn poll_write(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                let result = Pin::new(&mut self.inner).poll_write(cx, buf);
                if let Poll::Ready(Ok(n)) = &result {
                    self.writes.lock().unwrap().push(*n);
                }
                result
            }

            fn poll_flush(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<io::Result<()>> {
                Pin::new(&mut self.inner).poll_flush(cx)
            }

            fn poll_shutdown(
                mut self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<io::Result<()>> {
                Pin::new(&mut self.inner).poll_shutdown(cx)
            }
        }

        let keys = SessionKeys::derive(&[80u8; KEY_LENGTH].into(), &[81u8; 32]);
        let keys_again = SessionKeys::derive(&[80u8; KEY_LENGTH].into(), &[81u8; 32]);
        let len_seed = Seed::from([82u8; SEED_LENGTH]);

        let (client_io, server_io) = duplex(1 << 23);
        let writes = Arc::new(Mutex::new(Vec::new()));
        let counting = CountingIo {
            inner: client_io,
            writes: writes.clone(),
        };

        let mut client = FramedStream::new(
            counting,
            &keys,
            false,
            &len_seed,
            IatMode::Paranoid,
            false,
            None,
        );
        client.mark_established();
        let mut server = FramedStream::new(
            server_io,
            &keys_again,
            true,
            &len_seed,
            IatMode::Paranoid,
            false,
            None,
        );
        server.mark_established();

        const LEN: usize = 50_000;
        let data = vec![0x7au8; LEN];
        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
        });

        let mut got = vec![0u8; LEN];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, vec![0x7au8; LEN]);
        writer.await.unwrap();

        // Every underlying write was exactly one length-distribution
        // sample.
        let reference = Polymorph::new(&len_seed, IatMode::Paranoid, false);
        let values = reference.shapes().0 .0;
        let writes = writes.lock().unwrap();
        assert!(!writes.is_empty());
        for &n in writes.iter() {
            assert!(values.contains(&n), "write of {} not in the length table", n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_emits_dummy_frames_when_idle() {
        let keys = SessionKeys::derive(&[70u8; KEY_LENGTH].into(), &[71u8; 32]);
        let keys_again = SessionKeys::derive(&[70u8; KEY_LENGTH].into(), &[71u8; 32]);
        let len_seed = Seed::from([72u8; SEED_LENGTH]);

        let mut cover = CoverPolicy::new(&Seed::from([73u8; SEED_LENGTH]));
        cover.force_heartbeat(Duration::from_secs(5));

        let (client_io, server_io) = duplex(1 << 20);
        let mut client = FramedStream::new(
            client_io,
            &keys,
            false,
            &len_seed,
            IatMode::None,
            false,
            Some(cover),
        );
        client.mark_established();
        let mut server =
            FramedStream::new(server_io, &keys_again, true, &len_seed, IatMode::None, false, None);
        server.mark_established();

        // The client writes nothing; its read loop keeps the heartbeat
        // timer polled. The server must still decode a frame (all padding,
        // so its read stays pending) without any application data.
        let client_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = client.read(&mut buf).await;
        });

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            tokio::time::timeout(Duration::from_secs(60), server.read(&mut buf)).await
        });

        // With time paused, the timeout resolves only once all timers have
        // been driven; the heartbeat fires well before the 60 s cap and
        // the server keeps waiting on application data that never comes.
        let result = server_task.await.unwrap();
        assert!(result.is_err(), "server saw application data unexpectedly");
        client_task.abort();
    }
}
