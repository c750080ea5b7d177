//! Core traits and types for APDU (Application Protocol Data Unit) operations
//!
//! This crate provides the foundational types and traits for working with smart card
//! APDU commands and responses according to ISO/IEC 7816-4.
//!
//! ## Overview
//!
//! - [`Command`] and [`Response`] model the wire format
//! - [`CardTransport`] moves raw bytes to and from a connected card
//! - [`CardReader`] hands out transports for whatever card is currently presented
//! - [`GetResponseProcessor`] hides `61 XX` response chaining
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod error;
pub mod processor;
pub mod response;
pub mod transport;

pub use command::{Command, ExpectedLength};
pub use error::{CommandError, ResponseError, TransportError};
pub use processor::GetResponseProcessor;
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{CardReader, CardTransport};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut};

    // Command related
    pub use crate::{Command, CommandError, ExpectedLength};

    // Response related
    pub use crate::response::status::{StatusWord, common as status};
    pub use crate::{Response, ResponseError};

    // Transport layer
    pub use crate::{CardReader, CardTransport, GetResponseProcessor, TransportError};
}
