//! Caller-facing extraction errors.

use crate::bridge::session::{ExtractOutcome, TransferError};

/// Coarse classification for the boundary layer (e.g. 404 vs 500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("video file not found")]
    FileNotFound,
    #[error("requested time is past the end of the video")]
    TimeNotFound,
    #[error("worker reported extraction failure (code {code})")]
    Worker { code: i64 },
    #[error("worker channel failed: {0}")]
    Transport(String),
    #[error("worker process failed: {0}")]
    Process(String),
    #[error("worker protocol violation: {0}")]
    Protocol(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ExtractError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::FileNotFound | Self::TimeNotFound => ErrorClass::NotFound,
            _ => ErrorClass::Internal,
        }
    }
}

impl From<TransferError> for ExtractError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Protocol { .. } => Self::Protocol(err.to_string()),
            TransferError::Closed { .. } | TransferError::Io { .. } => {
                Self::Transport(err.to_string())
            }
        }
    }
}

impl ExtractOutcome {
    pub fn into_result(self) -> Result<bytes::Bytes, ExtractError> {
        match self {
            Self::Thumbnail(bytes) => Ok(bytes),
            Self::FileNotFound => Err(ExtractError::FileNotFound),
            Self::TimeNotFound => Err(ExtractError::TimeNotFound),
            Self::Failed { code } => Err(ExtractError::Worker { code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::session::TransferStep;

    #[test]
    fn not_found_outcomes_classify_as_not_found() {
        assert_eq!(ExtractError::FileNotFound.class(), ErrorClass::NotFound);
        assert_eq!(ExtractError::TimeNotFound.class(), ErrorClass::NotFound);
        assert_eq!(ExtractError::Worker { code: -1 }.class(), ErrorClass::Internal);
        assert_eq!(ExtractError::Cancelled.class(), ErrorClass::Internal);
    }

    #[test]
    fn eof_becomes_transport_error() {
        let err = ExtractError::from(TransferError::Closed {
            step: TransferStep::PayloadLen,
        });
        insta::assert_snapshot!(err.to_string(), @"worker channel failed: channel closed during payload_len");
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn outcomes_map_to_results() {
        assert_eq!(
            ExtractOutcome::Thumbnail(bytes::Bytes::from_static(b"jpg")).into_result(),
            Ok(bytes::Bytes::from_static(b"jpg"))
        );
        assert_eq!(
            ExtractOutcome::Failed { code: -4 }.into_result(),
            Err(ExtractError::Worker { code: -4 })
        );
    }
}
