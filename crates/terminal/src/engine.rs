//! Access decision engine
//!
//! One evaluation walks `start → chain-read → chain-valid → channel-open →
//! pin-check → granted`. Any failure jumps straight to `denied`; nothing is
//! retried within an evaluation.

use std::{
    thread,
    time::{Duration, Instant},
};

use derive_more::Display;
use tracing::{debug, info, instrument, warn};

use crate::{
    card::CardHandle,
    credential::{ChainVerifier, CredentialReader, CvcVerifier, TrustAnchor},
    error::{DenialCause, Error, Result},
    indicator::{Indicator, IndicatorState},
    pin::{NoPin, PinSource},
    session::SecureSession,
};

/// Pause after each step of the denial blink
pub const DEFAULT_BLINK_INTERVAL: Duration = Duration::from_millis(200);

const DENIED_PATTERN: [IndicatorState; 4] = [
    IndicatorState::Off,
    IndicatorState::Red,
    IndicatorState::Off,
    IndicatorState::Red,
];

/// Outcome of one evaluation
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessDecision {
    /// Door opens
    #[display("granted")]
    Granted,
    /// Door stays shut
    #[display("denied")]
    Denied,
}

impl AccessDecision {
    /// Whether access was granted
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Progress of an evaluation
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Nothing done yet
    #[display("start")]
    Start,
    /// Credential object read and parsed
    #[display("chain-read")]
    ChainRead,
    /// Chain validated against the trust anchor
    #[display("chain-valid")]
    ChainValid,
    /// Secure channel established
    #[display("channel-open")]
    ChannelOpen,
    /// PIN verified by the card
    #[display("pin-check")]
    PinCheck,
    /// Access granted
    #[display("granted")]
    Granted,
    /// Access denied
    #[display("denied")]
    Denied,
}

/// Diagnostic record of one evaluation
///
/// Externally every denial looks the same; this record is for logs and
/// tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// The decision
    pub decision: AccessDecision,
    /// Why access was denied
    pub cause: Option<DenialCause>,
    /// Last stage completed before the decision
    pub reached: Stage,
    /// Identity path of a validated chain
    pub identity_path: Option<String>,
    /// Time spent evaluating, excluding the indicator signal
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Progress {
    reached: Stage,
    identity_path: Option<String>,
}

impl Progress {
    const fn new() -> Self {
        Self {
            reached: Stage::Start,
            identity_path: None,
        }
    }

    fn advance(&mut self, stage: Stage) {
        debug!(%stage, "Evaluation stage");
        self.reached = stage;
    }
}

/// Turns a presented card into an access decision
#[derive(Debug)]
pub struct AccessEngine {
    credentials: CredentialReader,
    verifier: Box<dyn ChainVerifier>,
    anchor: TrustAnchor,
    pins: Box<dyn PinSource>,
    indicator: Box<dyn Indicator>,
    blink_interval: Duration,
}

impl AccessEngine {
    /// Engine trusting `anchor`, with no PIN and CV certificate chains
    pub fn new(anchor: TrustAnchor, indicator: impl Indicator + 'static) -> Self {
        Self {
            credentials: CredentialReader::default(),
            verifier: Box::new(CvcVerifier),
            anchor,
            pins: Box::new(NoPin),
            indicator: Box::new(indicator),
            blink_interval: DEFAULT_BLINK_INTERVAL,
        }
    }

    /// Read credentials with `reader`
    pub fn with_credential_reader(mut self, reader: CredentialReader) -> Self {
        self.credentials = reader;
        self
    }

    /// Validate chains with `verifier`
    pub fn with_verifier(mut self, verifier: impl ChainVerifier + 'static) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    /// Ask `pins` for a PIN once the channel is open
    pub fn with_pin_source(mut self, pins: impl PinSource + 'static) -> Self {
        self.pins = Box::new(pins);
        self
    }

    /// Pause between denial blink steps
    pub const fn with_blink_interval(mut self, interval: Duration) -> Self {
        self.blink_interval = interval;
        self
    }

    /// The configured trust anchor
    pub const fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    /// Evaluate the card, signal the result and return the decision
    ///
    /// Never fails: every error is a denial.
    pub fn evaluate(&mut self, card: &mut CardHandle) -> AccessDecision {
        self.assess(card).decision
    }

    /// Evaluate the card and return the full diagnostic record
    #[instrument(level = "debug", skip_all, fields(reader = card.reader_name()))]
    pub fn assess(&mut self, card: &mut CardHandle) -> Assessment {
        info!("Evaluation started");
        let started = Instant::now();
        let mut progress = Progress::new();

        let outcome = self.run(card, &mut progress);
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                info!(
                    path = progress.identity_path.as_deref().unwrap_or_default(),
                    ?elapsed,
                    "Access granted"
                );
                self.signal_granted();
                Assessment {
                    decision: AccessDecision::Granted,
                    cause: None,
                    reached: progress.reached,
                    identity_path: progress.identity_path,
                    elapsed,
                }
            }
            Err(error) => {
                let cause = error.cause();
                warn!(%cause, %error, stage = %progress.reached, ?elapsed, "Access denied");
                self.signal_denied();
                Assessment {
                    decision: AccessDecision::Denied,
                    cause: Some(cause),
                    reached: progress.reached,
                    identity_path: progress.identity_path,
                    elapsed,
                }
            }
        }
    }

    fn run(&mut self, card: &mut CardHandle, progress: &mut Progress) -> Result<()> {
        let chain = self.credentials.read(card)?;
        progress.advance(Stage::ChainRead);

        let identity = self.verifier.validate(&self.anchor, &chain)?;
        progress.advance(Stage::ChainValid);
        progress.identity_path = Some(identity.path().to_owned());

        let mut session = SecureSession::open(card, identity.public_key())?;
        progress.advance(Stage::ChannelOpen);

        let pin = self.pins.get_pin().ok_or(Error::PinEntryAborted)?;
        if pin.is_empty() {
            debug!("No PIN entered, skipping verification");
        } else {
            session.verify_pin(&pin)?;
            progress.advance(Stage::PinCheck);
        }

        Ok(())
    }

    /// Show the idle state
    pub fn signal_idle(&mut self) {
        self.indicator.red();
    }

    /// Show access granted
    pub fn signal_granted(&mut self) {
        debug!(stage = %Stage::Granted, "Evaluation stage");
        self.indicator.green();
    }

    /// Blink the denial pattern, ending on red
    pub fn signal_denied(&mut self) {
        debug!(stage = %Stage::Denied, "Evaluation stage");
        for state in DENIED_PATTERN {
            self.indicator.set(state);
            thread::sleep(self.blink_interval);
        }
    }
}
