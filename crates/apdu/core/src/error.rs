//! Error types for APDU operations

use thiserror::Error;

/// Transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection error
    #[error("Failed to connect to device")]
    Connection,

    /// No card present in the reader
    #[error("No card present")]
    NoCard,

    /// Card was removed or reset during an exchange
    #[error("Card removed")]
    CardRemoved,

    /// Transmission error
    #[error("Failed to transmit data")]
    Transmission,

    /// Status word not in the caller's expected set
    #[error("Status word error: {0:#06X}")]
    StatusWord(u16),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Malformed response
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Device specific error with message
    #[error("Device error: {0}")]
    Device(String),
}

impl TransportError {
    /// Create a new status word error from individual bytes
    pub const fn status_word_bytes(sw1: u8, sw2: u8) -> Self {
        Self::StatusWord(((sw1 as u16) << 8) | (sw2 as u16))
    }

    /// Get the status word if this is a status word error
    pub const fn get_status_word(&self) -> Option<u16> {
        match self {
            Self::StatusWord(sw) => Some(*sw),
            _ => None,
        }
    }

    /// Whether the error means the card is gone rather than misbehaving
    pub const fn is_card_gone(&self) -> bool {
        matches!(self, Self::NoCard | Self::CardRemoved)
    }

    /// Create a device error
    pub fn device<S: Into<String>>(message: S) -> Self {
        Self::Device(message.into())
    }
}

/// Error for APDU response processing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponseError {
    /// Incomplete response (less than 2 bytes)
    #[error("Incomplete response of {0} bytes")]
    Incomplete(usize),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(&'static str),
}

/// Error for APDU command parsing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The byte string is not a well formed short APDU
    #[error("Invalid command length: {0}")]
    InvalidLength(usize),
}
