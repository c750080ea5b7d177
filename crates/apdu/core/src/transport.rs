//! Transport traits for APDU communication with cards
//!
//! A [`CardReader`] represents a slot a card can be presented to. Connecting
//! to it yields a [`CardTransport`] bound to the card currently present.

use std::{fmt, thread, time::Duration};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Trait for basic card transports
///
/// A transport is responsible for sending and receiving raw APDU bytes.
/// It has no knowledge of command structure or secure messaging.
pub trait CardTransport: Send + fmt::Debug {
    /// Send raw APDU bytes to card and return response bytes
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = %hex::encode(command), "Transmitting raw command");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                trace!(response = %hex::encode(response), "Received raw response");
            }
            Err(e) => {
                debug!(error = %e, "Transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of transmit_raw
    /// This is the method that concrete implementations should override
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Check if the transport is connected to a physical card
    fn is_connected(&self) -> bool;

    /// Reset the transport connection
    fn reset(&mut self) -> Result<(), TransportError>;
}

impl<T: CardTransport + ?Sized> CardTransport for Box<T> {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).transmit_raw(command)
    }

    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).do_transmit_raw(command)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }
}

/// A reader slot cards are presented to
pub trait CardReader: fmt::Debug {
    /// Transport produced for a connected card
    type Transport: CardTransport + 'static;

    /// Human readable reader name
    fn name(&self) -> &str;

    /// Connect to the card currently present
    ///
    /// Fails with [`TransportError::NoCard`] when the slot is empty.
    fn connect(&mut self) -> Result<Self::Transport, TransportError>;

    /// Block until the slot state may have changed or `timeout` elapses
    ///
    /// Readers without change notification just sleep.
    fn wait_for_change(&mut self, timeout: Duration) -> Result<(), TransportError> {
        thread::sleep(timeout);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use mock::MockTransport;
