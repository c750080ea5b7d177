//! Command processors layered over a raw transport

use std::fmt;

use bytes::BytesMut;
use tracing::trace;

use crate::{Command, Response, error::TransportError, transport::CardTransport};

/// Processor that handles GET RESPONSE chaining (61 XX)
#[derive(Clone, Copy)]
pub struct GetResponseProcessor {
    /// Maximum number of chained responses to handle
    pub max_chain: usize,
    /// Class byte for GET RESPONSE command
    pub cla: u8,
}

impl Default for GetResponseProcessor {
    fn default() -> Self {
        Self {
            max_chain: 10,
            cla: 0x00,
        }
    }
}

impl fmt::Debug for GetResponseProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetResponseProcessor")
            .field("max_chain", &self.max_chain)
            .field("cla", &format!("{:#04x}", self.cla))
            .finish()
    }
}

impl GetResponseProcessor {
    /// Send `command` and collect any chained response data
    pub fn process(
        &self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, TransportError> {
        let response_bytes = transport.transmit_raw(&command.to_bytes())?;
        let mut response = Response::from_bytes(&response_bytes)?;

        let mut chain_count = 0;
        let mut buffer = BytesMut::new();

        while let Some(le) = response.status().remaining_bytes() {
            if chain_count >= self.max_chain {
                return Err(TransportError::status_word_bytes(0x61, le));
            }
            buffer.extend_from_slice(response.payload());

            trace!(le, chain_count, "Sending GET RESPONSE");
            let get_response = Command::new_with_le(self.cla, 0xC0, 0x00, 0x00, le);
            let response_bytes = transport.transmit_raw(&get_response.to_bytes())?;
            response = Response::from_bytes(&response_bytes)?;
            chain_count += 1;
        }

        if chain_count == 0 {
            return Ok(response);
        }

        buffer.extend_from_slice(response.payload());
        Ok(Response::new(buffer.freeze(), response.status()))
    }
}
