//! Composition harness: named transports, client/server factories, and the
//! session bootstrap.
//!
//! Three transports are registered at startup:
//!
//! * `"shaper"`: the inner entropy-reshaping layer alone, for
//!   low-overhead deployments;
//! * `"framed"`: AEAD framing plus polymorphism over the raw stream;
//! * `"stacked"`: shaper below framing, polymorphism and cover traffic,
//!   the intended production configuration.
//!
//! A [`Registry`] owns the reshaping table cache, so every connection
//! derived from one server identity shares its tables. Factories follow
//! two small capability seams: a client factory knows how to obtain a
//! wrapped connection from parsed arguments; a server factory knows how to
//! wrap an accepted connection.
//!
//! Connections expose close as the single cancellation primitive.
//! Per-read/per-write deadlines are deliberately not provided: the
//! inter-arrival scheduler sleeps inside writes, and a write deadline
//! would turn every sampled delay into a spurious failure. Deadlines
//! exist only around the session bootstrap.

use core::{
    pin::Pin,
    task::{Context, Poll},
};
use std::{io, sync::Arc};

use rand::{Rng, TryRngCore};
use subtle::ConstantTimeEq;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time::{timeout, timeout_at, Duration, Instant},
};

use crate::{
    config::{Config, IatMode, Identity, StackKind, TransportArgs},
    cover::CoverPolicy,
    crypto::{bootstrap_mac, SessionKeys},
    drbg::{HashDrbg, Seed},
    error::{ArgumentError, BadDataReceived, Error},
    framed_stream::FramedStream,
    replay_filter::{unix_seconds, ReplayFilter},
    shaped_stream::ShapedStream,
    specification::{
        BOOTSTRAP_LENGTH, BOOTSTRAP_SALT_LENGTH, CLIENT_HANDSHAKE_TIMEOUT_SECS,
        MAX_CLOSE_DELAY_SECS, SERVER_HANDSHAKE_TIMEOUT_SECS,
    },
    stretch::TableCache,
};

/// The table of named transports, populated at startup.
#[derive(Debug)]
pub struct Registry {
    entries: Vec<(&'static str, StackKind)>,
    table_cache: Arc<TableCache>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_default_transports()
    }
}

impl Registry {
    /// A registry holding the three standard transports.
    pub fn with_default_transports() -> Self {
        Self {
            entries: vec![
                ("shaper", StackKind::Shaper),
                ("framed", StackKind::Framed),
                ("stacked", StackKind::Stacked),
            ],
            table_cache: Arc::new(TableCache::new()),
        }
    }

    /// Names of the registered transports.
    pub fn transport_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    fn lookup(&self, name: &str) -> Result<StackKind, Error> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
            .ok_or(Error::Arguments(ArgumentError::UnknownTransport))
    }

    /// Build a client factory for the named transport.
    pub fn client_factory(&self, name: &str) -> Result<ClientFactory, Error> {
        Ok(ClientFactory {
            kind: self.lookup(name)?,
            table_cache: self.table_cache.clone(),
        })
    }

    /// Build a server factory for the named transport.
    pub fn server_factory(&self, name: &str, config: Config) -> Result<ServerFactory, Error> {
        let kind = self.lookup(name)?;
        let args = TransportArgs::for_server(&config.identity, config.iat_mode);

        // The drain interval applied to failed bootstraps is drawn once
        // per factory from the endpoint's seed.
        let close_delay_secs =
            HashDrbg::new(&config.drbg_seed).random_range(0..MAX_CLOSE_DELAY_SECS);

        Ok(ServerFactory {
            kind,
            config,
            args,
            replay_filter: ReplayFilter::with_capacity(1024),
            table_cache: self.table_cache.clone(),
            close_delay_secs,
        })
    }
}

/// Arguments a client needs to reach one server, parsed from the
/// transport argument bundle.
#[derive(Clone, Debug)]
pub struct ClientParams {
    identity: Identity,
    iat_mode: IatMode,
}

/// Knows how to obtain a wrapped client connection from parsed arguments.
#[derive(Debug)]
pub struct ClientFactory {
    kind: StackKind,
    table_cache: Arc<TableCache>,
}

impl ClientFactory {
    /// Parse a transport argument bundle into dialing parameters.
    pub fn parse_args(&self, args: &TransportArgs) -> Result<ClientParams, Error> {
        Ok(ClientParams {
            identity: args.identity().map_err(Error::Arguments)?,
            iat_mode: args.iat_mode().map_err(Error::Arguments)?,
        })
    }

    /// Dial `addr` and establish the disguised connection.
    pub async fn dial(
        &self,
        addr: impl ToSocketAddrs,
        params: &ClientParams,
    ) -> io::Result<Conn<TcpStream>> {
        let stream = TcpStream::connect(addr).await?;
        self.wrap(stream, params).await
    }

    /// Wrap an already-connected stream and establish the disguised
    /// connection. The whole bootstrap runs under the client deadline.
    pub async fn wrap<IO>(&self, stream: IO, params: &ClientParams) -> io::Result<Conn<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        timeout(
            Duration::from_secs(CLIENT_HANDSHAKE_TIMEOUT_SECS),
            self.wrap_inner(stream, params),
        )
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
    }

    async fn wrap_inner<IO>(&self, stream: IO, params: &ClientParams) -> io::Result<Conn<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        // All clients of one server derive the shaping seed from its
        // identity, so their flows are indistinguishable from each other.
        let shaping_seed = params.identity.shaping_seed();

        match self.kind {
            StackKind::Shaper => Ok(Conn::Shaped(ShapedStream::with_seed_in(
                &shaping_seed,
                false,
                &self.table_cache,
                stream,
            ))),
            StackKind::Framed => {
                let framed = client_bootstrap(stream, params, None).await?;
                Ok(Conn::Framed(framed))
            }
            StackKind::Stacked => {
                let shaped =
                    ShapedStream::with_seed_in(&shaping_seed, false, &self.table_cache, stream);
                let cover = CoverPolicy::new(&shaping_seed);
                let framed = client_bootstrap(shaped, params, Some(cover)).await?;
                Ok(Conn::Stacked(framed))
            }
        }
    }
}

/// Run the client half of the session bootstrap over `stream`.
async fn client_bootstrap<IO>(
    mut stream: IO,
    params: &ClientParams,
    cover: Option<CoverPolicy>,
) -> io::Result<FramedStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut salt = [0u8; BOOTSTRAP_SALT_LENGTH];
    rand::rngs::OsRng
        .try_fill_bytes(&mut salt)
        .expect("system random source failure");
    let mac = bootstrap_mac(params.identity.key(), &salt);

    stream.write_all(&salt).await?;
    stream.write_all(&mac).await?;
    stream.flush().await?;

    let keys = SessionKeys::derive(params.identity.key(), &salt);

    // The client pads from a throwaway distribution until the server's
    // seed arrives in its first frame.
    let mut framed = FramedStream::new(
        stream,
        &keys,
        false,
        &Seed::from_entropy(),
        params.iat_mode,
        false,
        cover,
    );
    framed.wait_first_frame().await?;
    framed.mark_established();
    Ok(framed)
}

/// Knows how to wrap an accepted server-side connection.
#[derive(Debug)]
pub struct ServerFactory {
    kind: StackKind,
    config: Config,
    args: TransportArgs,
    replay_filter: ReplayFilter,
    table_cache: Arc<TableCache>,
    close_delay_secs: u64,
}

impl ServerFactory {
    /// The argument bundle this server advertises to its clients.
    pub fn args(&self) -> &TransportArgs {
        &self.args
    }

    /// Accept connections on `listener`, yielding one wrapped connection
    /// per accept.
    pub async fn accept(&self, listener: &TcpListener) -> io::Result<Conn<TcpStream>> {
        let (stream, _) = listener.accept().await?;
        self.wrap(stream).await
    }

    /// Wrap an accepted connection and run the server half of the
    /// bootstrap under the server deadline.
    ///
    /// On bootstrap failure the stream is drained for a randomized
    /// interval before the error returns, denying probers a precise
    /// failure timing signal.
    pub async fn wrap<IO>(&self, stream: IO) -> io::Result<Conn<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let shaping_seed = self.config.identity.shaping_seed();

        match self.kind {
            StackKind::Shaper => Ok(Conn::Shaped(ShapedStream::with_seed_in(
                &shaping_seed,
                true,
                &self.table_cache,
                stream,
            ))),
            StackKind::Framed => {
                let framed = self.server_bootstrap(stream).await?;
                Ok(Conn::Framed(framed))
            }
            StackKind::Stacked => {
                let shaped =
                    ShapedStream::with_seed_in(&shaping_seed, true, &self.table_cache, stream);
                let framed = self.server_bootstrap(shaped).await?;
                Ok(Conn::Stacked(framed))
            }
        }
    }

    async fn server_bootstrap<IO>(&self, mut stream: IO) -> io::Result<FramedStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let handshake = timeout(
            Duration::from_secs(SERVER_HANDSHAKE_TIMEOUT_SECS),
            self.read_bootstrap(&mut stream),
        )
        .await
        .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut)));

        let salt = match handshake {
            Ok(salt) => salt,
            Err(e) => {
                tracing::debug!(error = %e, "bootstrap failed, draining before close");
                self.close_after_delay(stream, start).await;
                return Err(e);
            }
        };

        let keys = SessionKeys::derive(self.config.identity.key(), &salt);
        let mut framed = FramedStream::new(
            stream,
            &keys,
            true,
            &self.config.drbg_seed,
            self.config.iat_mode,
            self.config.biased_dist,
            None,
        );

        // The first frame transfers this server's padding distribution to
        // the client without leaking it on the wire.
        framed
            .queue_prng_seed(&self.config.drbg_seed)
            .map_err(io::Error::from)?;
        framed.mark_established();
        framed.flush().await?;
        Ok(framed)
    }

    async fn read_bootstrap<IO>(&self, stream: &mut IO) -> io::Result<[u8; BOOTSTRAP_SALT_LENGTH]>
    where
        IO: AsyncRead + Unpin,
    {
        let mut hello = [0u8; BOOTSTRAP_LENGTH];
        stream.read_exact(&mut hello).await?;

        let salt: [u8; BOOTSTRAP_SALT_LENGTH] = hello[..BOOTSTRAP_SALT_LENGTH].try_into().unwrap();
        let mac = bootstrap_mac(self.config.identity.key(), &salt);
        if mac[..].ct_eq(&hello[BOOTSTRAP_SALT_LENGTH..]).unwrap_u8() != 1 {
            return Err(BadDataReceived::BootstrapFailed.into());
        }

        self.replay_filter
            .check_or_insert(salt, unix_seconds())
            .map_err(io::Error::from)?;
        Ok(salt)
    }

    /// Consume and discard the stream until the factory's randomized
    /// deadline passes, then drop it.
    async fn close_after_delay<IO>(&self, mut stream: IO, start: Instant)
    where
        IO: AsyncRead + Unpin,
    {
        let deadline = start
            + Duration::from_secs(self.close_delay_secs)
            + Duration::from_secs(SERVER_HANDSHAKE_TIMEOUT_SECS);

        let drain = async {
            let mut scratch = vec![0u8; 4096];
            loop {
                match stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = timeout_at(deadline, drain).await;
    }
}

/// One established disguised connection.
///
/// Application bytes written here arrive at the peer in order with
/// TCP-equivalent semantics; padding, dummy and heartbeat bytes are
/// invisible on both ends.
#[derive(Debug)]
pub enum Conn<IO> {
    /// Inner shaper only.
    Shaped(ShapedStream<IO>),
    /// Framing and polymorphism over the raw stream.
    Framed(FramedStream<IO>),
    /// The full stack.
    Stacked(FramedStream<ShapedStream<IO>>),
}

impl<IO> AsyncRead for Conn<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Shaped(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Framed(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Stacked(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for Conn<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Shaped(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Framed(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Stacked(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Shaped(s) => Pin::new(s).poll_flush(cx),
            Conn::Framed(s) => Pin::new(s).poll_flush(cx),
            Conn::Stacked(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Shaped(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Framed(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Stacked(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::duplex;

    use super::*;
    use crate::drbg::SEED_LENGTH;

    fn test_config(stack_seed: u8) -> Config {
        Config::builder_with_identity(Identity::from_entropy())
            .with_iat_mode(IatMode::None)
            .stacked()
            .with_drbg_seed(Seed::from([stack_seed; SEED_LENGTH]))
    }

    async fn round_trip(name: &str) {
        let registry = Registry::with_default_transports();
        let config = test_config(90);

        let server_factory = registry.server_factory(name, config).unwrap();
        let client_factory = registry.client_factory(name).unwrap();
        let params = client_factory.parse_args(server_factory.args()).unwrap();

        let (client_io, server_io) = duplex(1 << 22);

        let server_task = tokio::spawn(async move {
            let mut conn = server_factory.wrap(server_io).await.unwrap();
            let mut buf = vec![0u8; 13];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.flush().await.unwrap();
            buf
        });

        let mut conn = client_factory.wrap(client_io, &params).await.unwrap();
        conn.write_all(b"Hello, world!").await.unwrap();
        conn.flush().await.unwrap();

        let mut echo = vec![0u8; 13];
        conn.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"Hello, world!");
        assert_eq!(server_task.await.unwrap(), b"Hello, world!");
    }

    #[tokio::test]
    async fn test_shaper_round_trip() {
        round_trip("shaper").await;
    }

    #[tokio::test]
    async fn test_framed_round_trip() {
        round_trip("framed").await;
    }

    #[tokio::test]
    async fn test_stacked_round_trip() {
        round_trip("stacked").await;
    }

    #[tokio::test]
    async fn test_unknown_transport_rejected() {
        let registry = Registry::with_default_transports();
        assert!(matches!(
            registry.client_factory("nonesuch"),
            Err(Error::Arguments(ArgumentError::UnknownTransport))
        ));
    }

    #[tokio::test]
    async fn test_replayed_bootstrap_rejected() {
        let registry = Registry::with_default_transports();
        let config = test_config(91);
        let identity = config.identity.clone();
        let factory = registry.server_factory("framed", config).unwrap();

        let salt = [0x42u8; BOOTSTRAP_SALT_LENGTH];
        let mac = bootstrap_mac(identity.key(), &salt);

        // First presentation of this fingerprint is accepted.
        let (mut peer, server_io) = duplex(1 << 16);
        peer.write_all(&salt).await.unwrap();
        peer.write_all(&mac).await.unwrap();
        let first = factory.wrap(server_io).await;
        assert!(first.is_ok());
        drop(first);
        drop(peer);

        // A replay within the TTL is drained and rejected.
        let (mut peer, server_io) = duplex(1 << 16);
        peer.write_all(&salt).await.unwrap();
        peer.write_all(&mac).await.unwrap();
        drop(peer); // EOF lets the decoy drain finish immediately.
        let second = factory.wrap(server_io).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_bad_bootstrap_mac_rejected_after_drain() {
        let registry = Registry::with_default_transports();
        let factory = registry.server_factory("framed", test_config(92)).unwrap();

        let (mut peer, server_io) = duplex(1 << 16);
        peer.write_all(&[0u8; BOOTSTRAP_LENGTH]).await.unwrap();
        drop(peer);

        let result = factory.wrap(server_io).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writers_with_iat_sleeps() {
        use std::sync::Arc;

        use crate::polymorph::Polymorph;

        const WRITER_LEN: usize = 100_000;
        let drbg_seed = Seed::from([94u8; SEED_LENGTH]);

        let registry = Registry::with_default_transports();
        let config = Config::builder_with_identity(Identity::from_entropy())
            .with_iat_mode(IatMode::Enabled)
            .framed_only()
            .with_drbg_seed(drbg_seed.clone());

        let server_factory = registry.server_factory("framed", config).unwrap();
        let client_factory = registry.client_factory("framed").unwrap();
        let params = client_factory.parse_args(server_factory.args()).unwrap();

        let (client_io, server_io) = duplex(1 << 23);

        let server_task = tokio::spawn(async move {
            let mut conn = server_factory.wrap(server_io).await.unwrap();
            let mut counts = [0usize; 256];
            let mut buf = vec![0u8; 16384];
            let mut total = 0;
            while total < WRITER_LEN * 2 {
                let n = conn.read(&mut buf).await.unwrap();
                assert!(n > 0);
                for &b in &buf[..n] {
                    counts[b as usize] += 1;
                }
                total += n;
            }
            counts
        });

        let conn = client_factory.wrap(client_io, &params).await.unwrap();
        let (_rd, wr) = tokio::io::split(conn);
        let wr = Arc::new(tokio::sync::Mutex::new(wr));

        let start = tokio::time::Instant::now();
        let writers: Vec<_> = [0xa1u8, 0xb2]
            .into_iter()
            .map(|fill| {
                let wr = wr.clone();
                tokio::spawn(async move {
                    let chunk = vec![fill; WRITER_LEN / 10];
                    for _ in 0..10 {
                        // One writer per direction-lock at a time; bytes of
                        // each writer stay in order.
                        let mut wr = wr.lock().await;
                        wr.write_all(&chunk).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        wr.lock().await.flush().await.unwrap();
        let elapsed = start.elapsed();

        let counts = server_task.await.unwrap();
        assert_eq!(counts[0xa1], WRITER_LEN);
        assert_eq!(counts[0xb2], WRITER_LEN);

        // Sanity-check that the inter-arrival sleeps actually happened:
        // the virtual transfer time must exceed 50 mean delays.
        let mut reference = Polymorph::new(&drbg_seed, IatMode::Enabled, false);
        let mean = (0..1000)
            .map(|_| reference.sample_delay())
            .sum::<Duration>()
            / 1000;
        assert!(
            elapsed >= mean * 50,
            "elapsed {:?} vs mean delay {:?}",
            elapsed,
            mean
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_bootstrap_deadline() {
        let registry = Registry::with_default_transports();
        let factory = registry.server_factory("framed", test_config(93)).unwrap();

        // A peer that never speaks: the deadline plus the randomized drain
        // elapse under paused time.
        let (_peer, server_io) = duplex(1 << 16);
        let result = factory.wrap(server_io).await;
        let err = result.err().expect("silent peer must time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
