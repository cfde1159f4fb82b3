//! Driftwire is a pluggable-transport core that disguises a reliable,
//! ordered byte stream (e.g. TCP) as innocuous-looking traffic, to counter
//! statistical traffic classifiers and simple deep packet inspection.
//!
//! ## Architecture
//!
//! A connection is a stack of composable wrapping transports, each
//! exposing and consuming the same contract: read and write opaque byte
//! streams.
//!
//! ```text
//!       application bytes
//!             |
//!     +-------v--------+
//!     | Outer (framed) |   AEAD framing + length obfuscation + IAT
//!     |                |   padding + dummy/heartbeat cover
//!     +-------^--------+
//!             |
//!     +-------v--------+
//!     | Inner (shaper) |   Bit-level entropy reshaping
//!     +-------^--------+
//!             |
//!       underlying reliable stream (TCP)
//! ```
//!
//! On the wire, observers see traffic whose length distribution,
//! inter-arrival timing, and byte-value entropy resemble a configured
//! decoy profile rather than the underlying cryptographic stream.
//!
//! ## Quick start
//!
//! Transports are obtained from a [`Registry`] holding the three standard
//! stacks (`"shaper"`, `"framed"`, `"stacked"`). A server builds a
//! [`ServerFactory`] from its [`Config`] and advertises its argument
//! bundle; clients parse that bundle with a [`ClientFactory`] and dial:
//!
//! ```no_run
//! use driftwire::{Config, IatMode, Identity, Registry};
//!
//! # async fn run() -> std::io::Result<()> {
//! let registry = Registry::with_default_transports();
//!
//! // Server side.
//! let config = Config::builder_with_identity(Identity::from_entropy())
//!     .with_iat_mode(IatMode::Enabled)
//!     .stacked();
//! let server = registry.server_factory("stacked", config).unwrap();
//! let args = server.args().clone();
//!
//! // Client side (args arrive out-of-band).
//! let client = registry.client_factory("stacked").unwrap();
//! let params = client.parse_args(&args).unwrap();
//! let conn = client.dial("192.0.2.1:443", &params).await?;
//! # let _ = conn;
//! # Ok(())
//! # }
//! ```
//!
//! The returned connection implements [`AsyncRead`] and [`AsyncWrite`];
//! bytes written on one side arrive on the other in order, with
//! TCP-equivalent semantics. Padding, dummy and heartbeat bytes are
//! invisible to the application on both ends.
//!
//! ## Cancellation
//!
//! Close (dropping the connection, or `shutdown`) is the single
//! cancellation primitive. Per-read/per-write deadlines are deliberately
//! not provided: inter-arrival sleeps inside writes would turn every
//! sampled delay into a spurious timeout. Deadlines apply only to the
//! session bootstrap (60 s client, 30 s server).
//!
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
//! [`Registry`]: transport::Registry
//! [`ServerFactory`]: transport::ServerFactory
//! [`ClientFactory`]: transport::ClientFactory
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod bitops;
mod cover;
mod crypto;
mod drbg;
mod framing;
mod polymorph;
mod probdist;
mod replay_filter;
mod shaper;
mod specification;
mod stretch;

#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod framed_stream;
#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod shaped_stream;
#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod transport;

pub use config::{Config, IatMode, Identity, StackKind, TransportArgs};
pub use crypto::IdentityKey;
pub use drbg::Seed;
pub use error::Error;

#[cfg(feature = "tokio-stream-impl")]
pub use framed_stream::FramedStream;
#[cfg(feature = "tokio-stream-impl")]
pub use shaped_stream::ShapedStream;
#[cfg(feature = "tokio-stream-impl")]
pub use transport::{ClientFactory, ClientParams, Conn, Registry, ServerFactory};
