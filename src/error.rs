//! All possible non-I/O protocol errors.
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O protocol errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The data was corrupted during reading from the underlying transport.
    ///
    /// This could be due to the peer using incorrect keys, random errors in
    /// the network, or active probing attacks.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal. Upon detection, the implementer should introduce
    /// a random delay before closing the connection, and continue reading
    /// from the underlying connection during that delay, so that tampering
    /// with the stream cannot deterministically change the endpoint's
    /// observable behavior. [`FramedStream`] does this automatically.
    ///
    /// [`FramedStream`]: crate::FramedStream
    BadDataReceived(BadDataReceived),

    /// The peer deviated from the protocol after frame authentication
    /// succeeded. This is typically caused by a peer that knows the session
    /// keys sending malformed packets.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal. The connection can be closed immediately without
    /// exposing endpoint behavior characteristics.
    PeerMisbehaved(PeerMisbehaved),

    /// The operation cannot complete yet. The parameter provides a hint.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is recoverable; retry once the hinted condition changes.
    Retryable(Retryable),

    /// A codec invariant was violated by the caller (invalid block sizes,
    /// undersized destination). Returned as a structured error at the codec
    /// boundary and treated as fatal by callers; the core never panics on
    /// argument misuse.
    Codec(CodecViolation),

    /// The outbound nonce counter would wrap. The protocol has no rekey
    /// mechanism; the session must abort before a nonce is ever reused.
    NonceCounterWrapped,

    /// A transport argument bundle could not be parsed.
    Arguments(ArgumentError),
}

/// All errors that require disguise measures before closing.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum BadDataReceived {
    /// A frame failed authentication, or a frame whose length prefix was
    /// out of range finished its randomized drain.
    FrameAuthFailed,

    /// An inner-layer block decoded to a value outside the reshaping
    /// table's image.
    InverseLookupFailed,

    /// The bootstrap confirmation code did not verify.
    BootstrapFailed,

    /// The bootstrap fingerprint was seen before within the replay TTL.
    ReusedFingerprint,
}

/// The connection cannot continue due to improper behavior by the peer.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum PeerMisbehaved {
    /// The claimed payload length of a packet exceeds the packet body.
    PacketPayloadLenInvalid {
        /// The received `payload_len` field of the packet.
        received: u16,
    },

    /// A `PrngSeed` packet did not carry exactly one seed.
    SeedPayloadLenInvalid {
        /// The received `payload_len` field of the packet.
        received: u16,
    },
}

/// The operation cannot complete yet. The parameter provides a hint.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Retryable {
    /// The receive buffer does not yet hold enough bytes to decode the next
    /// length field or frame. Read more from the underlying stream and try
    /// again.
    MoreDataNeeded,

    /// Cover traffic was requested before the session bootstrap completed.
    /// Dummy frames require the established encoder keys.
    NotEstablished,
}

/// A violation of the reshaping codec's invariants by its caller.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CodecViolation {
    /// The block-size pair is outside the supported menu.
    InvalidBlockSizes {
        /// Requested input block size in bits.
        input_bits: u32,
        /// Requested output block size in bits.
        output_bits: u32,
    },

    /// The destination buffer cannot hold the transformed output.
    DestinationTooSmall {
        /// Bytes the transform would produce.
        needed: usize,
        /// Bytes the destination can hold.
        capacity: usize,
    },

    /// A bit index addressed a position outside the block.
    BitIndexOutOfBounds {
        /// The offending bit index.
        index: u64,
        /// Number of bits in the block.
        bits: u64,
    },
}

/// A transport argument bundle could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ArgumentError {
    /// A required key was absent from the bundle.
    MissingArgument {
        /// Name of the missing key.
        name: &'static str,
    },

    /// A key was present but its value failed to parse.
    InvalidArgument {
        /// Name of the malformed key.
        name: &'static str,
    },

    /// The requested transport name is not registered.
    UnknownTransport,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadDataReceived(err) => write!(f, "BadDataReceived: {}", err),
            Error::PeerMisbehaved(err) => write!(f, "PeerMisbehaved: {}", err),
            Error::Retryable(err) => write!(f, "Retryable: {}", err),
            Error::Codec(err) => write!(f, "Codec: {}", err),
            Error::NonceCounterWrapped => write!(f, "NonceCounterWrapped"),
            Error::Arguments(err) => write!(f, "Arguments: {}", err),
        }
    }
}

impl Display for BadDataReceived {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BadDataReceived::FrameAuthFailed => write!(f, "FrameAuthFailed"),
            BadDataReceived::InverseLookupFailed => write!(f, "InverseLookupFailed"),
            BadDataReceived::BootstrapFailed => write!(f, "BootstrapFailed"),
            BadDataReceived::ReusedFingerprint => write!(f, "ReusedFingerprint"),
        }
    }
}

impl Display for PeerMisbehaved {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            PeerMisbehaved::PacketPayloadLenInvalid { received } => {
                write!(f, "PacketPayloadLenInvalid: received {}", received)
            }
            PeerMisbehaved::SeedPayloadLenInvalid { received } => {
                write!(f, "SeedPayloadLenInvalid: received {}", received)
            }
        }
    }
}

impl Display for Retryable {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Retryable::MoreDataNeeded => write!(f, "MoreDataNeeded"),
            Retryable::NotEstablished => write!(f, "NotEstablished"),
        }
    }
}

impl Display for CodecViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            CodecViolation::InvalidBlockSizes {
                input_bits,
                output_bits,
            } => write!(
                f,
                "InvalidBlockSizes: input {} bits, output {} bits",
                input_bits, output_bits
            ),
            CodecViolation::DestinationTooSmall { needed, capacity } => write!(
                f,
                "DestinationTooSmall: needed {}, capacity {}",
                needed, capacity
            ),
            CodecViolation::BitIndexOutOfBounds { index, bits } => {
                write!(f, "BitIndexOutOfBounds: index {} of {} bits", index, bits)
            }
        }
    }
}

impl Display for ArgumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ArgumentError::MissingArgument { name } => {
                write!(f, "MissingArgument: '{}'", name)
            }
            ArgumentError::InvalidArgument { name } => {
                write!(f, "InvalidArgument: '{}'", name)
            }
            ArgumentError::UnknownTransport => write!(f, "UnknownTransport"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::BadDataReceived(err) => Some(err),
            Error::PeerMisbehaved(err) => Some(err),
            Error::Retryable(err) => Some(err),
            Error::Codec(err) => Some(err),
            Error::NonceCounterWrapped => None,
            Error::Arguments(err) => Some(err),
        }
    }
}

impl error::Error for BadDataReceived {}

impl error::Error for PeerMisbehaved {}

impl error::Error for Retryable {}

impl error::Error for CodecViolation {}

impl error::Error for ArgumentError {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<BadDataReceived> for io::Error {
    fn from(e: BadDataReceived) -> Self {
        io::Error::new(ErrorKind::Other, Error::BadDataReceived(e))
    }
}

impl From<PeerMisbehaved> for io::Error {
    fn from(e: PeerMisbehaved) -> Self {
        io::Error::new(ErrorKind::Other, Error::PeerMisbehaved(e))
    }
}

impl From<Retryable> for io::Error {
    fn from(e: Retryable) -> Self {
        io::Error::new(ErrorKind::Other, Error::Retryable(e))
    }
}

impl From<CodecViolation> for io::Error {
    fn from(e: CodecViolation) -> Self {
        io::Error::new(ErrorKind::Other, Error::Codec(e))
    }
}

impl From<BadDataReceived> for Error {
    fn from(e: BadDataReceived) -> Self {
        Error::BadDataReceived(e)
    }
}

impl From<PeerMisbehaved> for Error {
    fn from(e: PeerMisbehaved) -> Self {
        Error::PeerMisbehaved(e)
    }
}

impl From<Retryable> for Error {
    fn from(e: Retryable) -> Self {
        Error::Retryable(e)
    }
}

impl From<CodecViolation> for Error {
    fn from(e: CodecViolation) -> Self {
        Error::Codec(e)
    }
}

impl From<ArgumentError> for Error {
    fn from(e: ArgumentError) -> Self {
        Error::Arguments(e)
    }
}
