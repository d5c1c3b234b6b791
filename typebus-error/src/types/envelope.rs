use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки кодирования конверта. Это ошибка вызывающей стороны, сообщается
/// синхронно.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("too many headers: {count} (max {max})")]
    TooManyHeaders { count: usize, max: usize },

    #[error("header '{key}' is too large: {len} bytes")]
    HeaderTooLarge { key: String, len: usize },

    #[error("body is too large: {len} bytes (max {max})")]
    BodyTooLarge { len: usize, max: usize },
}

/// Ошибки декодирования конверта (повреждённая запись).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("envelope truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("bad envelope magic")]
    BadMagic,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{what} exceeds limit: {value} > {max}")]
    LimitExceeded {
        what: &'static str,
        value: usize,
        max: usize,
    },

    #[error("duplicate header '{key}'")]
    DuplicateHeader { key: String },

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}

impl ErrorExt for EncodeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::TooManyHeaders { .. } | Self::HeaderTooLarge { .. } | Self::BodyTooLarge { .. } => {
                StatusCode::SizeLimit
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ErrorExt for DecodeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ChecksumMismatch { .. } => StatusCode::ChecksumMismatch,
            Self::UnsupportedVersion(_) => StatusCode::UnsupportedVersion,
            Self::InvalidUtf8 { .. } => StatusCode::InvalidUtf8,
            Self::LimitExceeded { .. } => StatusCode::SizeLimit,
            _ => StatusCode::DecodingError,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        "Malformed envelope".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_error_codes() {
        assert_eq!(
            EncodeError::TooManyHeaders { count: 3, max: 2 }.status_code(),
            StatusCode::SizeLimit
        );
        assert_eq!(
            EncodeError::BodyTooLarge { len: 10, max: 5 }.status_code(),
            StatusCode::SizeLimit
        );
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0x0000_0001,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0xdeadbeef, got 0x00000001"
        );
        assert!(err.status_code().is_protocol_error());
        assert_eq!(err.client_message(), "Malformed envelope");
    }
}
