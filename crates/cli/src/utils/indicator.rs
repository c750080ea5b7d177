//! Indicator rendered on the console

use std::io::{self, Write};

use colored::Colorize;
use portier_terminal::{Indicator, IndicatorState};

/// Shows the indicator as a colored lamp on stdout
#[derive(Debug, Default)]
pub(crate) struct ConsoleIndicator {
    shown: Option<IndicatorState>,
}

impl ConsoleIndicator {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

fn lamp(state: IndicatorState) -> String {
    match state {
        IndicatorState::Red => format!("{} {}", "●".red().bold(), "locked".red()),
        IndicatorState::Green => format!("{} {}", "●".green().bold(), "open".green()),
        IndicatorState::Off => format!("{} {}", "○".dimmed(), "-".dimmed()),
    }
}

impl Indicator for ConsoleIndicator {
    fn set(&mut self, state: IndicatorState) {
        // Idle re-signals red every cycle
        if self.shown == Some(state) {
            return;
        }
        self.shown = Some(state);

        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", lamp(state));
        let _ = stdout.flush();
    }
}
