//! Session error kinds

use q2cloud_crypto::CryptoError;
use q2cloud_protocol::ProtocolError;
use thiserror::Error;

use crate::registry::RegistryError;

/// Everything that can fault a single frontend session.
///
/// None of these are fatal to the daemon; at worst the session closes.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("Bad greeting: {0}")]
    BadGreeting(String),

    #[error("Unknown frontend {0:?}")]
    UnknownFrontend(String),

    #[error("Frontend version {version} below required {required}")]
    VersionTooOld { version: u32, required: u32 },

    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Unable to decrypt packet with current or previous IV")]
    DecryptFail,

    #[error("Short read: {0}")]
    ShortRead(ProtocolError),

    #[error("Invalid client id {0}")]
    InvalidClient(u8),

    #[error("Chat line has no known speaker")]
    NoSpeaker,

    #[error("No player in slot {0}")]
    NameNotInPlayer(u8),

    #[error("Unexpected {0} frame")]
    Unexpected(&'static str),

    #[error("Connection closed by peer")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::BadMagic(m) => Self::BadMagic(m),
            other => Self::ShortRead(other),
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownFrontend(id) => Self::UnknownFrontend(id),
            other => Self::Io(std::io::Error::other(other.to_string())),
        }
    }
}

impl SessionError {
    /// Errors that only affect one frame; the session keeps running
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidClient(_) | Self::NoSpeaker | Self::NameNotInPlayer(_) | Self::Unexpected(_)
        )
    }
}
