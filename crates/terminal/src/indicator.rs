//! Visual access indicator

use std::{fmt, sync::Arc};

use derive_more::Display;
use parking_lot::Mutex;
use tracing::info;

/// State shown by the indicator
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorState {
    /// Idle or denied
    #[display("red")]
    Red,
    /// Access granted
    #[display("green")]
    Green,
    /// Dark, used between denial blinks
    #[display("off")]
    Off,
}

/// Driver for the terminal's indicator light
///
/// Updates are fire and forget; the last write wins.
pub trait Indicator: Send + fmt::Debug {
    /// Show `state`
    fn set(&mut self, state: IndicatorState);

    /// Show red
    fn red(&mut self) {
        self.set(IndicatorState::Red);
    }

    /// Show green
    fn green(&mut self) {
        self.set(IndicatorState::Green);
    }

    /// Turn the light off
    fn off(&mut self) {
        self.set(IndicatorState::Off);
    }
}

/// Indicator that only logs state changes
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, state: IndicatorState) {
        info!(%state, "Indicator");
    }
}

/// Indicator that records every state it is asked to show
///
/// Clones share the same history, so a test can keep one handle while the
/// engine owns another.
#[derive(Debug, Default, Clone)]
pub struct RecordingIndicator {
    history: Arc<Mutex<Vec<IndicatorState>>>,
}

impl RecordingIndicator {
    /// Create an indicator with an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// All states shown so far, oldest first
    pub fn history(&self) -> Vec<IndicatorState> {
        self.history.lock().clone()
    }

    /// The state currently shown
    pub fn current(&self) -> Option<IndicatorState> {
        self.history.lock().last().copied()
    }

    /// Forget the recorded history
    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl Indicator for RecordingIndicator {
    fn set(&mut self, state: IndicatorState) {
        self.history.lock().push(state);
    }
}
