//! Loader error types.

use thiserror::Error;

/// Errors reported by the loader.
///
/// The first three variants are the loader's own protocol failures and carry a numeric code
/// (see [`LoaderError::code`]). They are only reported once every allowed attempt has been
/// used. `Transport` passes an OS-level socket error through unchanged and is never retried.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The board did not answer the reset/handshake on any attempt.
    #[error("No response to reset/handshake")]
    NoResponseToReset,

    /// The handshake succeeded but the board went silent during transfer or verification.
    #[error("No response from device after handshake")]
    NoResponseAfterHandshake,

    /// The board answered but its checksum did not match the image.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Socket or OS failure.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A load is already running for this device.
    #[error("Device is busy")]
    DeviceBusy,

    /// The load request itself was unusable.
    #[error("Invalid load request: {0}")]
    InvalidRequest(String),
}

impl LoaderError {
    /// Loader-domain error code: 1 no response to reset, 2 no response after handshake,
    /// 3 checksum mismatch. `None` for every other error.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::NoResponseToReset => Some(1),
            Self::NoResponseAfterHandshake => Some(2),
            Self::ChecksumMismatch => Some(3),
            _ => None,
        }
    }

    /// Whether another full reset cycle may cure this error.
    pub fn is_retryable(&self) -> bool {
        self.code().is_some()
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;
