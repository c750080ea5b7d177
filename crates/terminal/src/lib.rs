//! Smart card access decisions
//!
//! This crate turns a card presented to a reader into an access decision:
//!
//! 1. read the device certificate chain and validate it against a trust anchor
//! 2. open a secure channel bound to the validated key
//! 3. optionally verify the operator's PIN through that channel
//! 4. signal the outcome on an [`Indicator`]
//!
//! Cards must run the matching access applet under the configured application
//! identifier: secp256k1 CV certificates in the device certificate file and
//! the proprietary secure channel (`80 86` key agreement, `80 11` mutual
//! authentication). A stock SmartCard-HSM answers the file commands but not
//! the channel, so it is denied with [`DenialCause::Handshake`].
//!
//! Every failure is a denial. [`Terminal`] runs the engine in a loop over a
//! [`CardReader`](portier_apdu::CardReader), and [`emulator`] provides a
//! virtual card to run it against.
//!
//! ## Example
//!
//! ```no_run
//! use portier_terminal::{
//!     emulator::{VirtualPki, VirtualReader},
//!     prelude::*,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pki = VirtualPki::generate()?;
//! let reader = VirtualReader::new("virtual").with_eject_after_use();
//! reader.insert(pki.issue_card("PTDEV00001")?);
//!
//! let engine = AccessEngine::new(pki.anchor(), LogIndicator);
//! let mut terminal = Terminal::new(reader, engine);
//! assert_eq!(terminal.run_once(), Some(AccessDecision::Granted));
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod card;
pub mod config;
pub mod credential;
pub mod emulator;
pub mod engine;
pub mod error;
pub mod indicator;
pub mod pin;
pub mod session;
pub mod terminal;

pub use card::CardHandle;
pub use config::TerminalConfig;
pub use credential::{
    CertificateChain, ChainVerifier, CredentialReader, CvcVerifier, TrustAnchor, VerifiedIdentity,
};
pub use engine::{AccessDecision, AccessEngine, Assessment, Stage};
pub use error::{
    ChainReadError, ChainValidationError, ChannelError, DenialCause, Error, HandshakeError, Result,
};
pub use indicator::{Indicator, IndicatorState, LogIndicator, RecordingIndicator};
pub use pin::{FixedPin, NoPin, Pin, PinSource};
pub use session::SecureSession;
pub use terminal::{RunSummary, StopHandle, Terminal, TerminalState};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        AccessDecision, AccessEngine, Assessment, CardHandle, ChainVerifier, CredentialReader,
        CvcVerifier, DenialCause, Error, Indicator, IndicatorState, LogIndicator, Pin, PinSource,
        Result, RunSummary, StopHandle, Terminal, TerminalConfig, TrustAnchor,
    };
}
