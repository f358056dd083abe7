// knhk-registry: Error types

use thiserror::Error;

/// Registry result type
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised by the frame codec
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("illegal frame magic")]
    IllegalMagic,

    #[error("illegal sign byte: {0}")]
    IllegalSign(u8),

    #[error("body decode failed: {0}")]
    Decode(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by `ChannelGroup::next`
#[derive(Debug, Error)]
pub enum ChannelGroupError {
    #[error("no channel available for {0}")]
    NoChannelAvailable(String),
}

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("channel group error: {0}")]
    ChannelGroup(#[from] ChannelGroupError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Check if an error is one that must fail the connection outright (illegal
/// magic/sign, malformed body): these are expected to be handled at the
/// connection boundary and never surface to registry logic.
pub fn is_connection_fatal(err: &RegistryError) -> bool {
    matches!(
        err,
        RegistryError::Codec(CodecError::IllegalMagic)
            | RegistryError::Codec(CodecError::IllegalSign(_))
            | RegistryError::Codec(CodecError::Decode(_))
    )
}
