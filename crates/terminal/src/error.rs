//! Error taxonomy for access evaluation
//!
//! Every variant is fatal to the evaluation it occurs in and resolves to a
//! denial. The variants exist for diagnostics only.

use derive_more::Display;
use portier_apdu::{StatusWord, TransportError};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while evaluating a presented card
#[derive(Debug, Error)]
pub enum Error {
    /// No card in the reader; drives the presence retry, never a denial
    #[error("No card present")]
    CardAbsent,

    /// I/O with the card failed outside any protocol step
    #[error(transparent)]
    Transport(TransportError),

    /// The credential object could not be read or parsed
    #[error("Credential read failed: {0}")]
    ChainRead(ChainReadError),

    /// The credential chain does not lead to the trust anchor
    #[error("Credential validation failed: {0}")]
    ChainValidation(#[from] ChainValidationError),

    /// The secure channel could not be established
    #[error("Secure channel handshake failed: {0}")]
    Handshake(HandshakeError),

    /// The card rejected the PIN over an authenticated channel
    #[error("PIN rejected by card{}", retries_suffix(.retries))]
    PinMismatch {
        /// Remaining attempts, when the card reports them
        retries: Option<u8>,
    },

    /// The PIN source gave up before a PIN was entered
    #[error("PIN entry aborted")]
    PinEntryAborted,

    /// A response could not be authenticated
    #[error("Secure channel failure: {0}")]
    Channel(#[from] ChannelError),
}

impl Error {
    /// Coarse, non-sensitive category of the error
    pub const fn cause(&self) -> DenialCause {
        match self {
            Self::CardAbsent | Self::Transport(_) => DenialCause::Transport,
            Self::ChainRead(_) => DenialCause::ChainRead,
            Self::ChainValidation(_) => DenialCause::ChainValidation,
            Self::Handshake(_) => DenialCause::Handshake,
            Self::PinMismatch { .. } => DenialCause::PinMismatch,
            Self::PinEntryAborted => DenialCause::PinEntry,
            Self::Channel(_) => DenialCause::Channel,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => Self::Channel(ChannelError::Timeout),
            TransportError::NoCard => Self::CardAbsent,
            other => Self::Transport(other),
        }
    }
}

// Exchange timeouts count as channel failures whichever step they hit.
impl From<ChainReadError> for Error {
    fn from(error: ChainReadError) -> Self {
        match error {
            ChainReadError::Transport(TransportError::Timeout) => {
                Self::Channel(ChannelError::Timeout)
            }
            other => Self::ChainRead(other),
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(error: HandshakeError) -> Self {
        match error {
            HandshakeError::Transport(TransportError::Timeout)
            | HandshakeError::Channel(ChannelError::Timeout) => {
                Self::Channel(ChannelError::Timeout)
            }
            other => Self::Handshake(other),
        }
    }
}

fn retries_suffix(retries: &Option<u8>) -> String {
    retries.map(|n| format!(" ({n} tries left)")).unwrap_or_default()
}

/// Category of a denial, safe to log and to assert on
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialCause {
    /// Transport failure outside a protocol step
    #[display("transport")]
    Transport,
    /// Credential object unreadable or malformed
    #[display("chain-read")]
    ChainRead,
    /// Credential chain not trusted
    #[display("chain-validation")]
    ChainValidation,
    /// Secure channel establishment failed
    #[display("handshake")]
    Handshake,
    /// Card rejected the PIN
    #[display("pin-mismatch")]
    PinMismatch,
    /// No PIN was entered
    #[display("pin-entry")]
    PinEntry,
    /// Response authentication or exchange timeout
    #[display("channel")]
    Channel,
}

/// Errors reading the credential object from the card
#[derive(Debug, Error)]
pub enum ChainReadError {
    /// The credential application could not be selected
    #[error("Application selection rejected with {0}")]
    SelectRejected(StatusWord),

    /// A read returned a status other than more data or end of file
    #[error("Unexpected status {status} at offset {offset}")]
    UnexpectedStatus {
        /// Status word returned by the card
        status: StatusWord,
        /// Offset of the failed read
        offset: usize,
    },

    /// The object grew past the configured limit
    #[error("Credential object exceeds {limit} bytes")]
    TooLarge {
        /// Configured size limit
        limit: usize,
    },

    /// The card returned no data at all
    #[error("Credential object is empty")]
    Empty,

    /// The object is not a sequence of certificates
    #[error("Malformed certificate chain: {0}")]
    Malformed(&'static str),

    /// Transport failure during the read
    #[error(transparent)]
    Transport(TransportError),
}

/// Errors validating a certificate chain against the trust anchor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainValidationError {
    /// The chain contains no certificates
    #[error("Certificate chain is empty")]
    EmptyChain,

    /// A certificate could not be decoded
    #[error("Certificate {index} is malformed: {reason}")]
    Malformed {
        /// Position in the chain, leaf first
        index: usize,
        /// What was wrong
        reason: &'static str,
    },

    /// A certificate names an authority other than its issuer
    #[error("Certificate {holder} names authority {found}, expected {expected}")]
    UnknownAuthority {
        /// Holder of the offending certificate
        holder: String,
        /// Expected authority reference
        expected: String,
        /// Authority reference found in the certificate
        found: String,
    },

    /// The public key algorithm is not supported
    #[error("Certificate {holder} uses an unsupported algorithm")]
    UnsupportedAlgorithm {
        /// Holder of the offending certificate
        holder: String,
    },

    /// The certified public key is not a valid curve point
    #[error("Certificate {holder} carries an invalid public key")]
    InvalidKey {
        /// Holder of the offending certificate
        holder: String,
    },

    /// The issuer signature does not verify
    #[error("Signature on certificate {holder} does not verify")]
    BadSignature {
        /// Holder of the offending certificate
        holder: String,
    },
}

/// Errors establishing the secure channel
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The card refused a handshake step
    #[error("Card rejected handshake with {0}")]
    Rejected(StatusWord),

    /// A handshake response had the wrong shape
    #[error("Malformed handshake response: {0}")]
    MalformedResponse(&'static str),

    /// The card's proof of key possession was wrong
    #[error("Card cryptogram mismatch")]
    CryptogramMismatch,

    /// The authentication response could not be authenticated
    #[error(transparent)]
    Channel(ChannelError),

    /// Transport failure during the handshake
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for HandshakeError {
    fn from(error: TransportError) -> Self {
        match error.get_status_word() {
            Some(sw) => Self::Rejected(StatusWord::from_u16(sw)),
            None => Self::Transport(error),
        }
    }
}

/// Errors authenticating secure channel traffic
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The response carries no or a truncated MAC
    #[error("Response MAC missing")]
    MissingMac,

    /// The protected data is not block aligned
    #[error("Protected data is not block aligned")]
    Misaligned,

    /// The MAC does not match
    #[error("Response MAC mismatch")]
    MacMismatch,

    /// Decryption produced invalid padding
    #[error("Invalid padding in protected data")]
    Padding,

    /// The exchange did not complete in time
    #[error("Card exchange timed out")]
    Timeout,

    /// Transport failure on a protected exchange
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ChannelError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => Self::Timeout,
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_channel_errors() {
        let read = Error::from(ChainReadError::Transport(TransportError::Timeout));
        assert_eq!(read.cause(), DenialCause::Channel);

        let handshake = Error::from(HandshakeError::Transport(TransportError::Timeout));
        assert_eq!(handshake.cause(), DenialCause::Channel);

        let plain = Error::from(TransportError::Timeout);
        assert!(matches!(plain, Error::Channel(ChannelError::Timeout)));
    }

    #[test]
    fn test_other_errors_keep_their_category() {
        let read = Error::from(ChainReadError::Transport(TransportError::CardRemoved));
        assert_eq!(read.cause(), DenialCause::ChainRead);

        let handshake = Error::from(HandshakeError::from(TransportError::StatusWord(0x6985)));
        assert!(matches!(
            handshake,
            Error::Handshake(HandshakeError::Rejected(sw)) if sw.to_u16() == 0x6985
        ));
        assert_eq!(Error::from(TransportError::NoCard).cause(), DenialCause::Transport);
    }

    #[test]
    fn test_pin_mismatch_display() {
        let error = Error::PinMismatch { retries: Some(2) };
        assert_eq!(error.to_string(), "PIN rejected by card (2 tries left)");
        assert_eq!(Error::PinMismatch { retries: None }.to_string(), "PIN rejected by card");
        assert_eq!(error.cause().to_string(), "pin-mismatch");
    }
}
