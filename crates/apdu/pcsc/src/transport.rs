//! PC/SC transport implementation

use std::{ffi::CString, fmt};

use bytes::Bytes;
use pcsc::{Card, Context, Disposition};
use portier_apdu::prelude::*;
use tracing::debug;

use crate::{config::PcscConfig, error::PcscError};

/// Transport bound to the card present in one PC/SC reader
pub struct PcscTransport {
    /// Card connection, if established
    card: Option<Card>,
    /// Reader name
    reader_name: String,
    /// Configuration
    config: PcscConfig,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport")
            .field("reader_name", &self.reader_name)
            .field("has_card", &self.card.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl PcscTransport {
    /// Connect to the card in `reader`
    ///
    /// Fails with [`PcscError::NoCard`] when the reader is empty.
    pub(crate) fn connect(
        context: &Context,
        reader: &CString,
        config: PcscConfig,
    ) -> Result<Self, PcscError> {
        let reader_name = reader.to_string_lossy().into_owned();
        let card = match context.connect(reader, config.share_mode.into(), config.protocols) {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard) => {
                return Err(PcscError::NoCard(reader_name));
            }
            Err(pcsc::Error::UnknownReader) => return Err(PcscError::ReaderNotFound(reader_name)),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            card: Some(card),
            reader_name,
            config,
        })
    }

    /// Get the ATR of the current card
    pub fn atr(&self) -> Result<Vec<u8>, PcscError> {
        self.card.as_ref().map_or_else(
            || Err(PcscError::NoCard(self.reader_name.clone())),
            |card| {
                card.get_attribute_owned(pcsc::Attribute::AtrString)
                    .map_err(Into::into)
            },
        )
    }

    /// Get the reader name
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Transmit a command to the card
    fn transmit_command(&mut self, command: &[u8]) -> Result<Bytes, PcscError> {
        let Some(card) = &mut self.card else {
            return Err(PcscError::CardRemoved);
        };

        let mut response_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];

        match card.transmit(command, &mut response_buffer) {
            Ok(response) => Ok(Bytes::copy_from_slice(response)),
            Err(pcsc::Error::ResetCard | pcsc::Error::RemovedCard) => {
                // The card is gone; this transport is done
                self.card = None;
                Err(PcscError::CardRemoved)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl CardTransport for PcscTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.transmit_command(command).map_err(TransportError::from)
    }

    fn is_connected(&self) -> bool {
        self.card.is_some()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let Some(card) = &mut self.card else {
            return Err(TransportError::CardRemoved);
        };
        card.reconnect(
            self.config.share_mode.into(),
            self.config.protocols,
            Disposition::ResetCard,
        )
        .map_err(|e| TransportError::from(PcscError::from(e)))
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                debug!(reader = %self.reader_name, error = %e, "Disconnect failed");
            }
        }
    }
}
