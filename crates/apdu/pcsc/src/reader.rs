//! Reader representation for PC/SC devices

use std::{ffi::CString, fmt, time::Duration};

use pcsc::{Context, ReaderState, Scope, State};
use portier_apdu::prelude::*;
use tracing::{debug, trace};

use crate::{config::PcscConfig, error::PcscError, transport::PcscTransport};

/// Snapshot of a PC/SC card reader
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    /// Name of the reader
    name: String,

    /// Whether a card is present
    has_card: bool,

    /// Answer To Reset of the card (if present)
    atr: Option<Vec<u8>>,
}

impl ReaderInfo {
    /// Create a new reader snapshot
    pub const fn new(name: String, has_card: bool, atr: Option<Vec<u8>>) -> Self {
        Self {
            name,
            has_card,
            atr,
        }
    }

    /// Get the reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if a card is present in the reader
    pub const fn has_card(&self) -> bool {
        self.has_card
    }

    /// Get the ATR of the card if present
    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }

    /// Create a reader from a reader state
    pub(crate) fn from_reader_state(reader_state: &ReaderState) -> Self {
        let has_card = reader_state.event_state().contains(State::PRESENT)
            && !reader_state.event_state().contains(State::EMPTY);

        let atr = has_card.then(|| reader_state.atr().to_vec());

        Self {
            name: reader_state.name().to_string_lossy().into_owned(),
            has_card,
            atr,
        }
    }
}

/// List all readers known to the PC/SC service along with card presence
pub fn list_readers() -> Result<Vec<ReaderInfo>, PcscError> {
    let context = Context::establish(Scope::User)?;
    let readers = context.list_readers_owned()?;
    if readers.is_empty() {
        return Err(PcscError::NoReadersAvailable);
    }

    let mut states: Vec<_> = readers
        .into_iter()
        .map(|name| ReaderState::new(name, State::UNAWARE))
        .collect();
    context.get_status_change(Duration::ZERO, &mut states)?;

    Ok(states.iter().map(ReaderInfo::from_reader_state).collect())
}

/// A single PC/SC reader slot
///
/// Implements [`CardReader`] so the terminal can wait for card presentation
/// through `SCardGetStatusChange` instead of blind polling.
pub struct PcscReader {
    context: Context,
    name: CString,
    display_name: String,
    config: PcscConfig,
    /// Last state reported by the service, fed back to block on changes
    known_state: State,
}

impl fmt::Debug for PcscReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscReader")
            .field("name", &self.display_name)
            .field("config", &self.config)
            .finish()
    }
}

impl PcscReader {
    /// Open the reader named in `config`, or the first reader found
    pub fn open(config: PcscConfig) -> Result<Self, PcscError> {
        let context = Context::establish(Scope::User)?;
        let readers = context.list_readers_owned()?;

        let name = match &config.reader {
            Some(wanted) => readers
                .into_iter()
                .find(|r| r.to_string_lossy() == wanted.as_str())
                .ok_or_else(|| PcscError::ReaderNotFound(wanted.clone()))?,
            None => readers
                .into_iter()
                .next()
                .ok_or(PcscError::NoReadersAvailable)?,
        };
        let display_name = name.to_string_lossy().into_owned();
        debug!(reader = %display_name, "Opened PC/SC reader");

        Ok(Self {
            context,
            name,
            display_name,
            config,
            known_state: State::UNAWARE,
        })
    }
}

impl CardReader for PcscReader {
    type Transport = PcscTransport;

    fn name(&self) -> &str {
        &self.display_name
    }

    fn connect(&mut self) -> Result<PcscTransport, TransportError> {
        let transport = PcscTransport::connect(&self.context, &self.name, self.config.clone())?;
        if let Ok(atr) = transport.atr() {
            debug!(reader = transport.reader_name(), atr_len = atr.len(), "Card connected");
        }
        Ok(transport)
    }

    fn wait_for_change(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let mut states = [ReaderState::new(self.name.clone(), self.known_state)];
        match self.context.get_status_change(timeout, &mut states) {
            Ok(()) => {
                states[0].sync_current_state();
                self.known_state = states[0].current_state();
                trace!(
                    reader = %self.display_name,
                    state = ?self.known_state,
                    "Reader state changed"
                );
                Ok(())
            }
            Err(pcsc::Error::Timeout) => Ok(()),
            Err(e) => Err(PcscError::from(e).into()),
        }
    }
}
