//! APDU command definitions
//!
//! This module provides the command type used on the wire according to
//! ISO/IEC 7816-4. Only the short and extended Lc encodings needed by the
//! terminal are supported.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CommandError;

/// Expected length type for APDU commands
pub type ExpectedLength = u8;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional)
    pub le: Option<ExpectedLength>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: ExpectedLength) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: Some(le),
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Create a new command with both data and expected length
    pub fn new_with_data_and_le<T: Into<Bytes>>(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: T,
        le: ExpectedLength,
    ) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data).with_le(le)
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Command payload data, empty when absent
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// The four header bytes (CLA, INS, P1, P2)
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        let data_len = self.data().len();
        let lc_len = match data_len {
            0 => 0,
            1..=255 => 1,
            _ => 3,
        };
        4 + lc_len + data_len + usize::from(self.le.is_some())
    }

    /// Convert to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.command_length());
        buffer.put_slice(&self.header());

        let data = self.data();
        if !data.is_empty() {
            match u8::try_from(data.len()) {
                Ok(lc) => buffer.put_u8(lc),
                Err(_) => {
                    // Extended Lc: 00 followed by a two byte length
                    buffer.put_u8(0x00);
                    buffer.put_u16(data.len() as u16);
                }
            }
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            buffer.put_u8(le);
        }

        buffer.freeze()
    }

    /// Parse a short command from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, CommandError> {
        let [cla, ins, p1, p2, body @ ..] = data else {
            return Err(CommandError::InvalidLength(data.len()));
        };

        let mut command = Self::new(*cla, *ins, *p1, *p2);

        match body {
            [] => {}
            [le] => command.le = Some(*le),
            [lc, rest @ ..] => {
                let lc = usize::from(*lc);
                if rest.len() < lc {
                    return Err(CommandError::InvalidLength(data.len()));
                }
                let (payload, tail) = rest.split_at(lc);
                command.data = Some(Bytes::copy_from_slice(payload));
                match tail {
                    [] => {}
                    [le] => command.le = Some(*le),
                    _ => return Err(CommandError::InvalidLength(data.len())),
                }
            }
        }

        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X} {:02X}",
            self.cla, self.ins, self.p1, self.p2
        )?;
        if let Some(data) = &self.data {
            write!(f, " Lc={}", data.len())?;
        }
        if let Some(le) = self.le {
            write!(f, " Le={le}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let data = Bytes::from_static(&[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00]);
        let cmd = Command::new_with_data_and_le(0x00, 0xA4, 0x04, 0x00, data, 0);
        let bytes = cmd.to_bytes();

        assert_eq!(&bytes[..4], &[0x00, 0xA4, 0x04, 0x00]);
        assert_eq!(bytes[4], 0x06); // Lc
        assert_eq!(&bytes[5..11], &[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00]);
        assert_eq!(bytes[11], 0x00); // Le
        assert_eq!(bytes.len(), cmd.command_length());
    }

    #[test]
    fn test_command_length() {
        assert_eq!(Command::new(0x00, 0xB0, 0x00, 0x00).command_length(), 4);
        assert_eq!(
            Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 0xFF).command_length(),
            5
        );

        let data = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let cmd = Command::new_with_data(0x00, 0xD6, 0x00, 0x00, data.clone());
        assert_eq!(cmd.command_length(), 8);

        let cmd = Command::new_with_data_and_le(0x00, 0xD6, 0x00, 0x00, data, 0xFF);
        assert_eq!(cmd.command_length(), 9);
    }

    #[test]
    fn test_extended_lc() {
        let cmd = Command::new_with_data(0x80, 0xE2, 0x00, 0x00, vec![0x55; 300]);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[4..7], &[0x00, 0x01, 0x2C]);
        assert_eq!(bytes.len(), 4 + 3 + 300);
    }

    #[test]
    fn test_command_from_bytes() {
        let cmd = Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(cmd.header(), [0x00, 0xA4, 0x04, 0x00]);
        assert!(cmd.data.is_none());
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00, 0x03, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(cmd.data(), &[0x01, 0x02, 0x03]);
        assert!(cmd.le.is_none());

        let cmd =
            Command::from_bytes(&[0x00, 0xB1, 0x2F, 0x02, 0x04, 0x54, 0x02, 0x00, 0xC8, 0xC8])
                .unwrap();
        assert_eq!(cmd.data(), &[0x54, 0x02, 0x00, 0xC8]);
        assert_eq!(cmd.le, Some(0xC8));

        let cmd = Command::from_bytes(&[0x00, 0xB0, 0x00, 0x00, 0xFF]).unwrap();
        assert!(cmd.data.is_none());
        assert_eq!(cmd.le, Some(0xFF));
    }

    #[test]
    fn test_command_from_bytes_rejects_bad_lengths() {
        assert!(Command::from_bytes(&[0x00, 0xA4, 0x04]).is_err());
        // Lc claims more data than present
        assert!(Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00, 0x05, 0x01]).is_err());
        // Trailing bytes after Le
        assert!(Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00, 0x01, 0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_display() {
        let cmd =
            Command::new_with_data_and_le(0x00, 0xB1, 0x2F, 0x02, vec![0x54, 0x02, 0, 0], 200);
        assert_eq!(cmd.to_string(), "00 B1 2F 02 Lc=4 Le=200");
    }
}
