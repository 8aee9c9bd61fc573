//! The error surface of the host.

/// Errors surfaced by the host and its collaborator traits.
///
/// None of these is fatal to the host process. Fan-out paths isolate
/// per-peer failures; only the local-submit path returns errors to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A local submit carried no signature and no signing key is configured.
    #[error("unsigned tx")]
    UnsignedTx,

    /// Malformed framing, signature mismatch or unknown message kind.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The dial target is the local node.
    #[error("peer is self")]
    PeerIsSelf,

    /// Transient network failure; always retryable.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport does not support the requested operation.
    #[error("unimplemented by transport")]
    Unimplemented,

    /// The state URI has no controller yet ("no initial state to deliver").
    #[error("no controller for state uri")]
    NoController,

    /// The requested state, tx or ref is absent.
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Key(#[from] weft_base::KeyError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Whether a caller should silently skip this transport.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Error::Unimplemented)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
