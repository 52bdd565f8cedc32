use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// The enum is `Clone` so a single in-flight operation (e.g. the media
/// connection refresh) can hand the same failure to every caller joined
/// onto it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("element missing: {0}")]
    ElementMissing(String),

    #[error("media retry failed with status {code}")]
    MediaRetryFailed { code: u16 },

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid JID: {0}")]
    InvalidJid(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Serialization(format!("protobuf decode: {}", err))
    }
}

impl From<prost::EncodeError> for Error {
    fn from(err: prost::EncodeError) -> Self {
        Error::Serialization(format!("protobuf encode: {}", err))
    }
}
