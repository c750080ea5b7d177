//! Exclusive session with one presented card
//!
//! The transport lives on a dedicated I/O thread so every exchange can be
//! bounded by a timeout even when the underlying driver call blocks.

use std::{
    fmt,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use portier_apdu::prelude::*;
use tracing::{Level, debug, info, trace, warn};

type Reply = Result<Response, TransportError>;

/// Default bound on a single command/response exchange
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle on the card currently presented to the reader
///
/// Owned by one terminal cycle from detection until [`CardHandle::close`].
/// After an exchange times out the handle is poisoned and refuses further
/// commands, since a late reply could otherwise be paired with the wrong
/// request.
pub struct CardHandle {
    reader: String,
    requests: Option<Sender<Command>>,
    replies: Receiver<Reply>,
    worker: Option<JoinHandle<()>>,
    timeout: Duration,
    poisoned: bool,
}

impl fmt::Debug for CardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardHandle")
            .field("reader", &self.reader)
            .field("timeout", &self.timeout)
            .field("poisoned", &self.poisoned)
            .field("open", &self.requests.is_some())
            .finish()
    }
}

impl CardHandle {
    /// Take ownership of a connected transport
    pub fn open<T>(
        reader: impl Into<String>,
        mut transport: T,
        timeout: Duration,
    ) -> Result<Self, TransportError>
    where
        T: CardTransport + 'static,
    {
        let reader = reader.into();
        let (request_tx, request_rx) = bounded::<Command>(1);
        let (reply_tx, reply_rx) = bounded::<Reply>(1);
        let processor = GetResponseProcessor::default();

        let worker = thread::Builder::new()
            .name("portier-card-io".into())
            .spawn(move || {
                for command in request_rx {
                    let reply = processor.process(&command, &mut transport);
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                trace!("Card I/O worker exiting");
            })
            .map_err(|e| TransportError::device(format!("failed to spawn card worker: {e}")))?;

        debug!(%reader, "Card session opened");

        Ok(Self {
            reader,
            requests: Some(request_tx),
            replies: reply_rx,
            worker: Some(worker),
            timeout,
            poisoned: false,
        })
    }

    /// Name of the reader the card sits in
    pub fn reader_name(&self) -> &str {
        &self.reader
    }

    /// Per exchange timeout
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a command and return the response whatever its status word
    pub fn transmit(&mut self, command: &Command) -> Result<Response, TransportError> {
        if self.poisoned {
            return Err(TransportError::Timeout);
        }
        let requests = self.requests.as_ref().ok_or(TransportError::CardRemoved)?;

        trace!(%command, "Sending command");
        requests
            .send(command.clone())
            .map_err(|_| TransportError::CardRemoved)?;

        match self.replies.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                warn!(%command, timeout = ?self.timeout, "Card exchange timed out");
                self.poisoned = true;
                Err(TransportError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::CardRemoved),
        }
    }

    /// Send a command, failing unless the status word is one of `expected`
    pub fn send(
        &mut self,
        command: &Command,
        expected: &[StatusWord],
    ) -> Result<Response, TransportError> {
        let response = self.transmit(command)?;
        let status = response.status();
        if expected.contains(&status) {
            Ok(response)
        } else {
            let level = status.tracing_level();
            let description = status.description();
            if level == Level::WARN {
                warn!(%command, %status, description, "Unexpected status word");
            } else if level == Level::INFO {
                info!(%command, %status, description, "Unexpected status word");
            } else {
                debug!(%command, %status, description, "Unexpected status word");
            }
            Err(TransportError::status_word_bytes(status.sw1, status.sw2))
        }
    }

    /// End the session and release the card
    pub fn close(self) {}

    fn shutdown(&mut self) {
        // Dropping the sender ends the worker loop, which drops the transport
        if self.requests.take().is_none() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if self.poisoned {
                // The worker may still be stuck in the driver; leave it behind
                debug!(reader = %self.reader, "Detaching stalled card worker");
            } else if worker.join().is_err() {
                warn!(reader = %self.reader, "Card worker panicked");
            }
        }
        debug!(reader = %self.reader, "Card session closed");
    }
}

impl Drop for CardHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
