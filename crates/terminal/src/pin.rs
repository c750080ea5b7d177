//! Operator PIN handling

use std::fmt;

use thiserror::Error;
use zeroize::Zeroizing;

/// PIN bytes entered by the operator
///
/// The buffer is wiped on drop and never printed. An empty PIN means no PIN
/// was entered and verification is skipped.
#[derive(Clone, Default)]
pub struct Pin(Zeroizing<Vec<u8>>);

impl Pin {
    /// Longest PIN a card accepts
    pub const MAX_LENGTH: usize = 16;

    /// Wrap PIN bytes
    pub fn new(pin: Vec<u8>) -> Result<Self, PinError> {
        let pin = Zeroizing::new(pin);
        if pin.len() > Self::MAX_LENGTH {
            return Err(PinError::TooLong);
        }
        Ok(Self(pin))
    }

    /// The empty PIN
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether no PIN was entered
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of PIN bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for Pin {
    type Error = PinError;

    fn try_from(pin: &str) -> Result<Self, Self::Error> {
        Self::new(pin.as_bytes().to_vec())
    }
}

impl TryFrom<String> for Pin {
    type Error = PinError;

    fn try_from(pin: String) -> Result<Self, Self::Error> {
        Self::new(pin.into_bytes())
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin([REDACTED])")
    }
}

/// Invalid PIN input
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// PIN longer than any card accepts
    #[error("PIN must be at most {max} characters", max = Pin::MAX_LENGTH)]
    TooLong,
}

/// Source of the PIN for one evaluation
pub trait PinSource: Send + fmt::Debug {
    /// Obtain the PIN, possibly empty; `None` when entry was abandoned
    fn get_pin(&mut self) -> Option<Pin>;
}

/// Never asks for a PIN
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPin;

impl PinSource for NoPin {
    fn get_pin(&mut self) -> Option<Pin> {
        Some(Pin::empty())
    }
}

/// Uses the same configured PIN for every card
#[derive(Debug, Clone)]
pub struct FixedPin(Pin);

impl FixedPin {
    /// Create a source that always yields `pin`
    pub const fn new(pin: Pin) -> Self {
        Self(pin)
    }
}

impl PinSource for FixedPin {
    fn get_pin(&mut self) -> Option<Pin> {
        Some(self.0.clone())
    }
}
