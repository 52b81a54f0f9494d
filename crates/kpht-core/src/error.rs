//! Error taxonomy shared by the protocol client and the credential model.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The handshake step an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// `change-public-keys`
    KeyExchange,
    /// `associate`
    Associate,
    /// `test-associate`
    TestAssociate,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::KeyExchange => write!(f, "key exchange"),
            HandshakeStep::Associate => write!(f, "associate"),
            HandshakeStep::TestAssociate => write!(f, "test-associate"),
        }
    }
}

/// Errors raised by the identity store when persisting an association.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Writing the association to the config file failed.
    #[error("failed to persist association: {0}")]
    Config(#[from] ConfigError),

    /// The store refuses to persist (e.g. a fixed, read-only identity).
    #[error("identity store is read-only")]
    ReadOnly,
}

/// Errors that can occur while talking to the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// The socket/pipe could not be located.
    #[error("keepassxc socket not found: {0}")]
    EndpointNotFound(String),

    /// Connecting to the located endpoint failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Transport {
        /// The endpoint that was dialed.
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a request or reading its response failed (includes timeouts).
    #[error("failed to send message: {0}")]
    SendFailed(#[source] std::io::Error),

    /// The daemon did not hand out its public key.
    #[error("key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// First-time association was rejected or answered incompletely.
    #[error("association failed: {0}")]
    AssociationFailed(String),

    /// The stored association is no longer accepted by the daemon.
    #[error("association test failed: {0}")]
    TestAssociationFailed(#[source] Box<Error>),

    /// A handshake step failed; wraps the underlying error with the step.
    #[error("{step} step failed: {source}")]
    Handshake {
        step: HandshakeStep,
        #[source]
        source: Box<Error>,
    },

    /// An encrypted exchange was attempted before the peer key was known.
    #[error("peer public key is not known yet")]
    InvalidPeerKey,

    /// Sealing a payload failed.
    #[error("failed to encrypt message: {0}")]
    EncryptionFailed(String),

    /// Opening a payload failed: wrong keys, or tampered nonce/ciphertext.
    #[error("failed to decrypt message")]
    DecryptionFailed,

    /// The daemon answered with an explicit error.
    #[error("keepassxc returned error {code}: {message}")]
    Protocol {
        /// The daemon's `errorCode` value.
        code: String,
        /// The daemon's `error` text.
        message: String,
    },

    /// The response was well-formed JSON but lacked expected fields.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Nothing matched the query and filters.
    #[error("no logins match the search criteria: {0}")]
    NoMatch(String),

    /// Several records matched and the user made no choice.
    #[error("no entry selected")]
    SelectionCancelled,

    /// A request was issued on a client that is not ready.
    #[error("client is not ready (state: {0})")]
    NotReady(String),

    /// The identity store could not persist the association.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl Error {
    /// Attach handshake step context.
    pub(crate) fn in_step(self, step: HandshakeStep) -> Self {
        Error::Handshake {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through handshake step context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Handshake { source, .. } => source.root(),
            other => other,
        }
    }

    /// The handshake step this error was raised in, if any.
    pub fn step(&self) -> Option<HandshakeStep> {
        match self {
            Error::Handshake { step, .. } => Some(*step),
            _ => None,
        }
    }
}
