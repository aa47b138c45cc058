//! Error types for the acquisition pipeline

use rt_client::ClientError;
use rt_types::{ChannelKey, ChannelKind, SensorError};
use thiserror::Error;

/// Pipeline-specific error types
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Connecting to, or talking with, the acquisition server failed. Recoverable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server sent something malformed. The offending frame is dropped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Block shape {actual:?} does not match ring buffer shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Channel {key} already exists")]
    DuplicateChannel { key: ChannelKey },

    #[error("Channel {key} does not exist")]
    UnknownChannel { key: ChannelKey },

    #[error("Cannot publish a {actual} value on channel {key}")]
    KindMismatch { key: ChannelKey, actual: ChannelKind },

    #[error("Invalid value for channel {key}: {message}")]
    InvalidValue { key: ChannelKey, message: String },

    #[error("Not connected to the acquisition server")]
    NotConnected,

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Acquisition is already running")]
    AlreadyRunning,

    #[error("Operation not allowed while acquisition is running")]
    Busy,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Whether retrying after reconnecting may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::Connection(_) | PipelineError::NotConnected)
    }
}

impl From<ClientError> for PipelineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connection(message) => PipelineError::Connection(message),
            ClientError::NotConnected => PipelineError::NotConnected,
            ClientError::Protocol(message) => PipelineError::Protocol(message),
            ClientError::UnsupportedCommand(command) => {
                PipelineError::Protocol(format!("server does not support '{}'", command))
            }
            ClientError::Rejected { command, message } => {
                PipelineError::invalid_configuration(format!("'{}' rejected: {}", command, message))
            }
            ClientError::InvalidArgument(message) => PipelineError::invalid_configuration(message),
            ClientError::Io(e) => PipelineError::Connection(e.to_string()),
        }
    }
}

impl From<SensorError> for PipelineError {
    fn from(err: SensorError) -> Self {
        match err {
            SensorError::InvalidDeviceInfo(message) => PipelineError::Protocol(message),
            other => PipelineError::invalid_configuration(other.to_string()),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_classes() {
        assert!(PipelineError::from(ClientError::Connection("refused".into())).is_recoverable());
        assert!(matches!(
            PipelineError::from(ClientError::NotConnected),
            PipelineError::NotConnected
        ));
        assert!(matches!(
            PipelineError::from(ClientError::InvalidArgument("bufsize 0".into())),
            PipelineError::InvalidConfiguration { .. }
        ));
        assert!(matches!(
            PipelineError::from(ClientError::Protocol("bad frame".into())),
            PipelineError::Protocol(_)
        ));
    }
}
