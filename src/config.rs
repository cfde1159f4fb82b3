//! Configuration structures for setting up driftwire transports.
//!
//! To build a config, make three decisions in order:
//!
//! 1. Obtain the server's [`Identity`] (node id plus identity key) and
//!    distribute its packed `cert` form to clients out-of-band.
//! 2. Choose an inter-arrival timing mode ([`IatMode`]). Timing obfuscation
//!    trades throughput for resistance to inter-arrival classifiers.
//! 3. Choose a stack ([`StackKind`]): the low-overhead shaper, the framed
//!    outer layer alone, or the full stacked transport.
//!
//! # Example
//!
//! ```
//! use driftwire::{Config, Identity, IatMode};
//!
//! let identity = Identity::from_entropy();
//!
//! let server_config = Config::builder_with_identity(identity.clone())
//!     .with_iat_mode(IatMode::Enabled)
//!     .stacked();
//!
//! let cert = identity.cert();
//! # let _ = (server_config, cert);
//! ```

use core::fmt::{Debug, Formatter};
use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, TryRngCore};

use crate::{
    crypto::IdentityKey,
    drbg::Seed,
    error::ArgumentError,
    specification::{KEY_LENGTH, NODE_ID_LENGTH},
};

/// Inter-arrival timing obfuscation mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum IatMode {
    /// Frames are written back to back.
    #[default]
    None,
    /// Bulk-transfer friendly: near-MTU writes with sampled delays between
    /// them.
    Enabled,
    /// Every write length is sampled from the length distribution;
    /// throughput is sacrificed entirely.
    Paranoid,
}

impl IatMode {
    pub(crate) fn parse(value: &str) -> Result<Self, ArgumentError> {
        match value {
            "0" => Ok(IatMode::None),
            "1" => Ok(IatMode::Enabled),
            "2" => Ok(IatMode::Paranoid),
            _ => Err(ArgumentError::InvalidArgument { name: "iat-mode" }),
        }
    }

    pub(crate) fn as_arg(&self) -> &'static str {
        match self {
            IatMode::None => "0",
            IatMode::Enabled => "1",
            IatMode::Paranoid => "2",
        }
    }
}

/// Which layers a named transport composes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StackKind {
    /// Inner shaper only, for low-overhead deployments.
    Shaper,
    /// Framing plus polymorphism only, for parity with prior art.
    Framed,
    /// Shaper below framing, polymorphism and cover traffic: the intended
    /// production configuration.
    Stacked,
}

/// A server's identity: a public node id and the identity key its clients
/// hold.
///
/// The packed form of both is the `cert` transport argument. Everything a
/// session derives (keys, shaping seed, reshaping tables) flows from this
/// value, so all clients of one server shape their traffic identically.
#[derive(Clone, Eq, PartialEq)]
pub struct Identity {
    node_id: [u8; NODE_ID_LENGTH],
    key: IdentityKey,
}

impl Identity {
    /// Generate a fresh identity from system entropy.
    pub fn from_entropy() -> Self {
        let mut node_id = [0u8; NODE_ID_LENGTH];
        OsRng
            .try_fill_bytes(&mut node_id)
            .expect("system random source failure");
        Self {
            node_id,
            key: IdentityKey::from_entropy(),
        }
    }

    /// Assemble an identity from its parts.
    pub fn new(node_id: [u8; NODE_ID_LENGTH], key: IdentityKey) -> Self {
        Self { node_id, key }
    }

    /// The public node identifier.
    pub fn node_id(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.node_id
    }

    pub(crate) fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// The packed, base-coded `cert` argument value.
    pub fn cert(&self) -> String {
        let mut packed = Vec::with_capacity(NODE_ID_LENGTH + KEY_LENGTH);
        packed.extend_from_slice(&self.node_id);
        packed.extend_from_slice(self.key.as_bytes());
        STANDARD.encode(packed)
    }

    /// Unpack a `cert` argument value.
    pub fn from_cert(cert: &str) -> Result<Self, ArgumentError> {
        let packed = STANDARD
            .decode(cert)
            .map_err(|_| ArgumentError::InvalidArgument { name: "cert" })?;
        if packed.len() != NODE_ID_LENGTH + KEY_LENGTH {
            return Err(ArgumentError::InvalidArgument { name: "cert" });
        }

        let node_id: [u8; NODE_ID_LENGTH] = packed[..NODE_ID_LENGTH].try_into().unwrap();
        let key: [u8; KEY_LENGTH] = packed[NODE_ID_LENGTH..].try_into().unwrap();
        Ok(Self {
            node_id,
            key: IdentityKey::from(key),
        })
    }

    /// The per-session shaping seed, derived from the identity key so that
    /// every client of this server shapes identically.
    pub(crate) fn shaping_seed(&self) -> Seed {
        Seed::from_slice(&self.key.as_bytes()[..crate::drbg::SEED_LENGTH])
            .expect("identity key is longer than a seed")
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .field("key", &"*****")
            .finish()
    }
}

/// The text key/value argument bundle exchanged with the handshake layer.
#[derive(Clone, Debug, Default)]
pub struct TransportArgs {
    entries: HashMap<String, String>,
}

impl TransportArgs {
    /// An empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one key/value pair.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_owned(), value.into());
    }

    /// Look up one value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The bundle a server advertises to its clients.
    pub fn for_server(identity: &Identity, iat_mode: IatMode) -> Self {
        let mut args = Self::new();
        args.insert("cert", identity.cert());
        args.insert("iat-mode", iat_mode.as_arg());
        args
    }

    /// Resolve the server identity from either the packed `cert` argument
    /// or the legacy `node-id` + `public-key` split.
    pub(crate) fn identity(&self) -> Result<Identity, ArgumentError> {
        if let Some(cert) = self.get("cert") {
            return Identity::from_cert(cert);
        }

        let node_id = self
            .get("node-id")
            .ok_or(ArgumentError::MissingArgument { name: "node-id" })?;
        let key = self
            .get("public-key")
            .ok_or(ArgumentError::MissingArgument { name: "public-key" })?;

        let node_id: [u8; NODE_ID_LENGTH] = STANDARD
            .decode(node_id)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(ArgumentError::InvalidArgument { name: "node-id" })?;
        let key: [u8; KEY_LENGTH] = STANDARD
            .decode(key)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(ArgumentError::InvalidArgument { name: "public-key" })?;

        Ok(Identity::new(node_id, IdentityKey::from(key)))
    }

    pub(crate) fn iat_mode(&self) -> Result<IatMode, ArgumentError> {
        let value = self
            .get("iat-mode")
            .ok_or(ArgumentError::MissingArgument { name: "iat-mode" })?;
        IatMode::parse(value)
    }
}

/// Configuration for one transport endpoint.
///
/// For details on constructing a config, refer to the [`config`] module.
///
/// [`config`]: crate::config
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) identity: Identity,
    pub(crate) iat_mode: IatMode,
    pub(crate) stack: StackKind,
    pub(crate) drbg_seed: Seed,
    pub(crate) biased_dist: bool,
}

/// A builder for creating a [`Config`] instance.
///
/// To get a [`ConfigBuilder`], use [`Config::builder_with_identity`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder<State> {
    state: State,
}

impl Config {
    /// Sets up the endpoint identity.
    pub fn builder_with_identity(identity: Identity) -> ConfigBuilder<WantsIatMode> {
        ConfigBuilder {
            state: WantsIatMode { identity },
        }
    }
}

impl ConfigBuilder<WantsIatMode> {
    /// Sets up the inter-arrival timing mode.
    ///
    /// Both endpoints must agree on the mode; it is part of the advertised
    /// argument bundle.
    pub fn with_iat_mode(self, iat_mode: IatMode) -> ConfigBuilder<WantsStack> {
        ConfigBuilder {
            state: WantsStack {
                identity: self.state.identity,
                iat_mode,
            },
        }
    }
}

impl ConfigBuilder<WantsStack> {
    /// Inner shaper only.
    pub fn shaper_only(self) -> Config {
        self.build(StackKind::Shaper)
    }

    /// Framing and polymorphism without the inner shaper.
    pub fn framed_only(self) -> Config {
        self.build(StackKind::Framed)
    }

    /// The full production stack.
    pub fn stacked(self) -> Config {
        self.build(StackKind::Stacked)
    }

    fn build(self, stack: StackKind) -> Config {
        Config {
            identity: self.state.identity,
            iat_mode: self.state.iat_mode,
            stack,
            drbg_seed: Seed::from_entropy(),
            biased_dist: false,
        }
    }
}

impl Config {
    /// Replace the endpoint's distribution seed. Mostly useful for servers
    /// restoring persisted state, and for tests.
    pub fn with_drbg_seed(mut self, seed: Seed) -> Self {
        self.drbg_seed = seed;
        self
    }

    /// Use biased (geometric-decay) weight tables instead of uniform ones.
    pub fn with_biased_distributions(mut self) -> Self {
        self.biased_dist = true;
        self
    }
}

/// Config builder state where the caller must supply an IAT mode.
#[derive(Clone, Debug)]
pub struct WantsIatMode {
    identity: Identity,
}

/// Config builder state where the caller must choose the stack.
#[derive(Clone, Debug)]
pub struct WantsStack {
    identity: Identity,
    iat_mode: IatMode,
}
