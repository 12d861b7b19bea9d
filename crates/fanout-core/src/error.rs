//! Error types and result aliases for fanout primitives.
//!
//! Errors raised here are contract violations on the compact encodings or
//! malformed encoded input. None of them are expected in correct operation.

/// The result type used throughout fanout-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fanout-core operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An index was outside the bounds of a compact structure.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// The index that was accessed.
        index: usize,
        /// The length of the structure.
        len: usize,
    },

    /// A bit width cannot represent the requested values.
    #[error("invalid bit width {bit_width}: {reason}")]
    InvalidWidth {
        /// The bit width that was rejected.
        bit_width: u8,
        /// Why the width was rejected.
        reason: String,
    },

    /// Encoded bytes could not be decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new invalid-width error.
    #[must_use]
    pub fn invalid_width(bit_width: u8, reason: impl Into<String>) -> Self {
        Self::InvalidWidth {
            bit_width,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_out_of_range_display() {
        let err = Error::IndexOutOfRange { index: 7, len: 5 };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('5'));
    }

    #[test]
    fn invalid_width_display() {
        let err = Error::invalid_width(0, "must be between 1 and 64");
        assert!(err.to_string().contains("invalid bit width 0"));
    }
}
