//! Subcommand handlers

mod readers;
mod simulate;
mod terminal;

pub(crate) use readers::list_command;
pub(crate) use simulate::{SimulateArgs, simulate_command};
pub(crate) use terminal::{check_command, run_command};
