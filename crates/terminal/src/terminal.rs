//! Terminal control loop
//!
//! ```text
//! Idle (red) → WaitInsert → Evaluating → WaitRemove → Idle
//! ```
//!
//! The running flag is checked at the top of each cycle and inside both wait
//! states. An evaluation in progress always runs to completion.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use derive_more::Display;
use portier_apdu::CardReader;
use tracing::{debug, info, trace, warn};

use crate::{
    card::{CardHandle, DEFAULT_EXCHANGE_TIMEOUT},
    engine::{AccessDecision, AccessEngine},
};

/// Pause between presence probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cloneable handle that stops a running terminal from any thread
///
/// A stop is final: once stopped, the terminal never runs another cycle.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    fn running() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Ask the terminal to stop at its next check
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether the terminal is meant to keep running
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Loop state
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    /// Showing red, no card
    #[display("idle")]
    Idle,
    /// Waiting for a card
    #[display("wait-insert")]
    WaitInsert,
    /// Evaluating the presented card
    #[display("evaluating")]
    Evaluating,
    /// Waiting for the card to be taken away
    #[display("wait-remove")]
    WaitRemove,
}

/// Counters returned when the loop stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Completed evaluation cycles
    pub cycles: u64,
    /// Granted evaluations
    pub granted: u64,
    /// Denied evaluations
    pub denied: u64,
}

impl RunSummary {
    fn record(&mut self, decision: AccessDecision) {
        self.cycles += 1;
        match decision {
            AccessDecision::Granted => self.granted += 1,
            AccessDecision::Denied => self.denied += 1,
        }
    }
}

/// Access terminal driving one reader
#[derive(Debug)]
pub struct Terminal<R: CardReader> {
    reader: R,
    engine: AccessEngine,
    poll_interval: Duration,
    exchange_timeout: Duration,
    running: StopHandle,
    state: TerminalState,
}

impl<R: CardReader> Terminal<R> {
    /// Terminal watching `reader` and deciding with `engine`
    pub fn new(reader: R, engine: AccessEngine) -> Self {
        Self {
            reader,
            engine,
            poll_interval: DEFAULT_POLL_INTERVAL,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            running: StopHandle::running(),
            state: TerminalState::Idle,
        }
    }

    /// Pause between presence probes
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound on a single card exchange
    pub const fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Handle for stopping the loop from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.running.clone()
    }

    /// Stop the loop at its next check
    pub fn stop(&self) {
        self.running.stop();
    }

    /// Current loop state
    pub const fn state(&self) -> TerminalState {
        self.state
    }

    /// The watched reader
    pub const fn reader(&self) -> &R {
        &self.reader
    }

    /// Run cycles until stopped
    ///
    /// Returns at once when the terminal was stopped before the call.
    pub fn start(&mut self) -> RunSummary {
        info!(reader = self.reader.name(), "Terminal started");

        let mut summary = RunSummary::default();
        while self.running.is_running() {
            match self.run_cycle() {
                Some(decision) => summary.record(decision),
                None => break,
            }
        }

        self.transition(TerminalState::Idle);
        info!(
            cycles = summary.cycles,
            granted = summary.granted,
            denied = summary.denied,
            "Terminal stopped"
        );
        summary
    }

    /// Run exactly one cycle
    ///
    /// Returns `None` when stopped before a card was presented.
    pub fn run_once(&mut self) -> Option<AccessDecision> {
        let decision = self.run_cycle();
        self.transition(TerminalState::Idle);
        decision
    }

    fn run_cycle(&mut self) -> Option<AccessDecision> {
        self.transition(TerminalState::Idle);
        self.engine.signal_idle();

        self.transition(TerminalState::WaitInsert);
        let transport = self.wait_for_insert()?;

        self.transition(TerminalState::Evaluating);
        let decision = self.evaluate(transport);

        self.transition(TerminalState::WaitRemove);
        self.wait_for_removal();

        Some(decision)
    }

    fn transition(&mut self, state: TerminalState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Terminal state");
            self.state = state;
        }
    }

    fn wait_for_insert(&mut self) -> Option<R::Transport> {
        loop {
            if !self.running.is_running() {
                return None;
            }
            match self.reader.connect() {
                Ok(transport) => {
                    debug!(reader = self.reader.name(), "Card presented");
                    return Some(transport);
                }
                Err(error) if error.is_card_gone() => trace!("No card yet"),
                Err(error) => debug!(%error, "Reader connect failed, retrying"),
            }
            self.pause();
        }
    }

    fn evaluate(&mut self, transport: R::Transport) -> AccessDecision {
        match CardHandle::open(self.reader.name(), transport, self.exchange_timeout) {
            Ok(mut card) => {
                let decision = self.engine.evaluate(&mut card);
                card.close();
                decision
            }
            Err(error) => {
                warn!(%error, "Could not open card session");
                self.engine.signal_denied();
                AccessDecision::Denied
            }
        }
    }

    fn wait_for_removal(&mut self) {
        loop {
            if !self.running.is_running() {
                return;
            }
            match self.reader.connect() {
                Ok(transport) => {
                    drop(transport);
                    self.pause();
                }
                Err(error) => {
                    if error.is_card_gone() {
                        debug!("Card removed");
                    } else {
                        debug!(%error, "Removal check failed, treating card as removed");
                    }
                    return;
                }
            }
        }
    }

    fn pause(&mut self) {
        if let Err(error) = self.reader.wait_for_change(self.poll_interval) {
            trace!(%error, "Reader wait failed");
            thread::sleep(self.poll_interval);
        }
    }
}
