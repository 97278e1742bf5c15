//! NOM-1 wire format: the two-byte command header on every datagram.
//!
//! ```text
//! byte 0: [version:4][flags:4]        version = 0x1
//! byte 1: [command:4][sequence:4]
//! byte 2..: payload (command-specific)
//! ```
//!
//! A NOM body is one whole serialized message (wire frames back to back);
//! OHAI and OHAI-OK carry the textual address the initiator used to reach
//! the responder; ROTFL carries a human-readable reason; HUGZ and HUGZ-OK
//! are empty.

use crate::error::VtxError;

pub const VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 2;

/// The sender is retransmitting a previously sent NOM.
pub const FLAG_RESEND: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Reject: peer refuses further interaction.
    Rotfl = 0x0,
    /// Request peering.
    Ohai = 0x1,
    /// Accept peering.
    OhaiOk = 0x2,
    /// Keep-alive probe.
    Hugz = 0x3,
    /// Keep-alive ack.
    HugzOk = 0x4,
    /// Application payload.
    Nom = 0x5,
}

impl Command {
    fn from_nibble(nibble: u8) -> Option<Command> {
        match nibble {
            0x0 => Some(Command::Rotfl),
            0x1 => Some(Command::Ohai),
            0x2 => Some(Command::OhaiOk),
            0x3 => Some(Command::Hugz),
            0x4 => Some(Command::HugzOk),
            0x5 => Some(Command::Nom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub flags: u8,
    pub command: Command,
    /// Per-peering 4-bit request sequence.
    pub sequence: u8,
}

/// Build a datagram: header plus body.
pub fn encode(header: Header, body: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_SIZE + body.len());
    datagram.push((VERSION << 4) | (header.flags & 0x0F));
    datagram.push(((header.command as u8) << 4) | (header.sequence & 0x0F));
    datagram.extend_from_slice(body);
    datagram
}

/// Split a datagram into header and body. Bad version or undefined
/// command is `Corrupt`; the caller drops and counts.
pub fn decode(datagram: &[u8]) -> Result<(Header, &[u8]), VtxError> {
    if datagram.len() < HEADER_SIZE {
        return Err(VtxError::Corrupt);
    }
    if datagram[0] >> 4 != VERSION {
        return Err(VtxError::Corrupt);
    }
    let command = Command::from_nibble(datagram[1] >> 4).ok_or(VtxError::Corrupt)?;
    Ok((
        Header {
            flags: datagram[0] & 0x0F,
            command,
            sequence: datagram[1] & 0x0F,
        },
        &datagram[HEADER_SIZE..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let datagram = encode(
            Header {
                flags: FLAG_RESEND,
                command: Command::Nom,
                sequence: 9,
            },
            b"payload",
        );
        let (header, body) = decode(&datagram).unwrap();
        assert_eq!(header.flags, FLAG_RESEND);
        assert_eq!(header.command, Command::Nom);
        assert_eq!(header.sequence, 9);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn test_empty_body_commands() {
        let datagram = encode(
            Header {
                flags: 0,
                command: Command::Hugz,
                sequence: 0,
            },
            &[],
        );
        assert_eq!(datagram.len(), HEADER_SIZE);
        let (header, body) = decode(&datagram).unwrap();
        assert_eq!(header.command, Command::Hugz);
        assert!(body.is_empty());
    }

    #[test]
    fn test_bad_version_is_corrupt() {
        let mut datagram = encode(
            Header {
                flags: 0,
                command: Command::Ohai,
                sequence: 0,
            },
            b"x",
        );
        datagram[0] = 0x20; // version 2
        assert!(decode(&datagram).is_err());
    }

    #[test]
    fn test_undefined_command_is_corrupt() {
        // Command nibble 0x9 is past the defined set
        assert!(decode(&[0x10, 0x90]).is_err());
    }

    #[test]
    fn test_truncated_datagram_is_corrupt() {
        assert!(decode(&[0x10]).is_err());
    }

    #[test]
    fn test_sequence_is_masked_to_four_bits() {
        let datagram = encode(
            Header {
                flags: 0,
                command: Command::Nom,
                sequence: 0xFF,
            },
            &[],
        );
        let (header, _) = decode(&datagram).unwrap();
        assert_eq!(header.sequence, 0x0F);
    }
}
