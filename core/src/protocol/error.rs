//! Dispersy errors

use crate::data::StartError;
use crate::message::MetaMessageError;
use crate::network::bloom::BloomError;
use crate::network::conversion::ConversionError;

/// Errors returned by the public `Dispersy` and `Session` API
#[derive(Debug)]
pub enum DispersyError {
    /// Database error
    Database(String),
    /// Failed to open the database
    StartFailed(String),
    /// Socket or file error
    Io(String),
    /// No loaded community with this cid
    UnknownCommunity(String),
    /// The community is already loaded or persisted
    CommunityExists(String),
    /// No meta message with this name in the community
    UnknownMeta(String),
    /// Meta message definitions or wire ids are invalid
    InvalidMetaMessage(MetaMessageError),
    /// Message could not be encoded
    Conversion(ConversionError),
    /// Bloom filter configuration is invalid
    Bloom(BloomError),
    /// My member lacks the permission to create this message
    NotPermitted(String),
    /// The community was destroyed
    Destroyed,
    /// The community clock cannot advance any further
    GlobalTimeExhausted,
    /// Invalid input provided
    InvalidInput(String),
    /// The session event loop is not running
    NotRunning,
}

impl std::fmt::Display for DispersyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispersyError::Database(e) => write!(f, "database error: {}", e),
            DispersyError::StartFailed(e) => write!(f, "failed to start: {}", e),
            DispersyError::Io(e) => write!(f, "io error: {}", e),
            DispersyError::UnknownCommunity(cid) => write!(f, "unknown community {}", cid),
            DispersyError::CommunityExists(cid) => write!(f, "community {} already exists", cid),
            DispersyError::UnknownMeta(name) => write!(f, "unknown meta message {}", name),
            DispersyError::InvalidMetaMessage(e) => write!(f, "invalid meta message: {}", e),
            DispersyError::Conversion(e) => write!(f, "conversion error: {}", e),
            DispersyError::Bloom(e) => write!(f, "bloom filter error: {}", e),
            DispersyError::NotPermitted(e) => write!(f, "not permitted: {}", e),
            DispersyError::Destroyed => write!(f, "community is destroyed"),
            DispersyError::GlobalTimeExhausted => write!(f, "global time exhausted"),
            DispersyError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            DispersyError::NotRunning => write!(f, "dispersy is not running"),
        }
    }
}

impl std::error::Error for DispersyError {}

impl From<rusqlite::Error> for DispersyError {
    fn from(e: rusqlite::Error) -> Self {
        DispersyError::Database(e.to_string())
    }
}

impl From<StartError> for DispersyError {
    fn from(e: StartError) -> Self {
        DispersyError::StartFailed(e.to_string())
    }
}

impl From<std::io::Error> for DispersyError {
    fn from(e: std::io::Error) -> Self {
        DispersyError::Io(e.to_string())
    }
}

impl From<MetaMessageError> for DispersyError {
    fn from(e: MetaMessageError) -> Self {
        DispersyError::InvalidMetaMessage(e)
    }
}

impl From<ConversionError> for DispersyError {
    fn from(e: ConversionError) -> Self {
        DispersyError::Conversion(e)
    }
}

impl From<BloomError> for DispersyError {
    fn from(e: BloomError) -> Self {
        DispersyError::Bloom(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispersy_error_display() {
        assert_eq!(DispersyError::Destroyed.to_string(), "community is destroyed");
        assert_eq!(DispersyError::NotRunning.to_string(), "dispersy is not running");
        assert_eq!(
            DispersyError::UnknownMeta("text".to_string()).to_string(),
            "unknown meta message text"
        );
        let err: DispersyError = MetaMessageError::ForbiddenWireId.into();
        assert_eq!(err.to_string(), "invalid meta message: wire id 255 is forbidden");
    }

    #[test]
    fn test_dispersy_error_is_error_trait() {
        let err: Box<dyn std::error::Error> = Box::new(DispersyError::Database("locked".to_string()));
        assert_eq!(err.to_string(), "database error: locked");
    }
}
