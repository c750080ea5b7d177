//! Console helpers for the portier CLI

mod indicator;
mod pin_pad;

pub(crate) use indicator::ConsoleIndicator;
pub(crate) use pin_pad::PinPad;
