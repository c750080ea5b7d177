//! PC/SC transport implementation for portier
//!
//! This crate implements the [`CardReader`](portier_apdu::CardReader) and
//! [`CardTransport`](portier_apdu::CardTransport) traits from `portier-apdu`
//! using the PC/SC API.
//!
//! # Examples
//!
//! ```no_run
//! use portier_apdu::prelude::*;
//! use portier_transport_pcsc::{PcscConfig, PcscReader, list_readers};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! for reader in list_readers()? {
//!     println!("{} (card: {})", reader.name(), reader.has_card());
//! }
//!
//! let mut reader = PcscReader::open(PcscConfig::default())?;
//! let mut transport = reader.connect()?;
//! let select = Command::new_with_data(0x00, 0xA4, 0x04, 0x00, vec![0xA0, 0x00, 0x00, 0x03]);
//! let response = transport.transmit_raw(&select.to_bytes())?;
//! println!("{}", Response::from_bytes(&response)?.status());
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod reader;
mod transport;

pub use config::{PcscConfig, ShareMode};
pub use error::PcscError;
pub use reader::{PcscReader, ReaderInfo, list_readers};
pub use transport::PcscTransport;

// Re-export some pcsc types for convenience
pub use pcsc::{Protocol, Protocols};
