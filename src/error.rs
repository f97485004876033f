//! Error taxonomy for the bridge.
//!
//! Every per-message failure maps to a numeric protocol code that is sent to
//! the peer as `errorCode`. Only [`BridgeError::Bind`] is meant to escape to
//! the embedding host.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the broker, the Relay and the session crypto.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The socket endpoint is in use or cannot be created.
    #[error("cannot bind {}: {reason}", path.display())]
    Bind {
        /// Requested socket path.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// Malformed JSON or a message missing required fields.
    #[error("malformed message: {0}")]
    Parse(String),

    /// The action needs a session key and no handshake has completed.
    #[error("session not established")]
    SessionNotEstablished,

    /// The session exists but no client identity has been approved.
    #[error("client is not associated")]
    NotAssociated,

    /// The peer public key is malformed or yields a non-contributory exchange.
    #[error("invalid peer public key")]
    InvalidPeerKey,

    /// Ciphertext failed authentication under the session key.
    #[error("message authentication failed")]
    AuthenticationFailed,

    /// The nonce is not strictly greater than the last accepted one.
    #[error("nonce replay rejected")]
    ReplayRejected,

    /// The approver refused the association.
    #[error("association denied")]
    AssociationDenied,

    /// A frame or buffered message exceeded the maximum length.
    #[error("message too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared or buffered length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The action is unknown, or the encrypted payload names another action.
    #[error("incorrect action")]
    IncorrectAction,

    /// The credential store is locked.
    #[error("credential store is locked")]
    StoreLocked,

    /// `get-credentials` without a URL.
    #[error("no URL provided")]
    NoUrlProvided,

    /// The store has no credentials for the requested URL.
    #[error("no credentials found")]
    NoCredentialsFound,

    /// The credential store reported a failure.
    #[error("store error: {0}")]
    Store(String),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Numeric code sent to the peer as `errorCode`.
    pub fn code(&self) -> u16 {
        match self {
            Self::StoreLocked => 1,
            Self::SessionNotEstablished => 3,
            Self::AuthenticationFailed => 4,
            Self::AssociationDenied => 6,
            Self::NotAssociated => 8,
            Self::InvalidPeerKey => 9,
            Self::ReplayRejected => 10,
            Self::IncorrectAction => 12,
            Self::Parse(_) => 13,
            Self::NoUrlProvided => 14,
            Self::NoCredentialsFound => 15,
            Self::FrameTooLarge { .. } => 16,
            Self::Store(_) => 17,
            Self::Bind { .. } | Self::Io(_) => 0,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    ///
    /// A failed key exchange or authentication means the session can no
    /// longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidPeerKey
                | Self::AuthenticationFailed
                | Self::FrameTooLarge { .. }
                | Self::Io(_)
        )
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
