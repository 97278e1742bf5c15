//! Message frames and the wire-level frame header.
//!
//! A frame is a byte payload plus a continuation flag; a message is one or
//! more frames, the last one with `more == false`. The header encoding folds
//! the more-octet into the stored length, so an empty final frame still
//! occupies a nonzero length field:
//!
//! - payload <= 253 bytes: `[len+1][more]`, 2 bytes
//! - larger: `[0xFF][len+1 as big-endian u64][more]`, 10 bytes

use crate::error::VtxError;

/// Largest payload the short two-byte header can carry.
pub const SHORT_MAX: usize = 253;

/// One message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    /// More frames follow in the same message.
    pub more: bool,
}

impl Frame {
    pub fn new(data: impl Into<Vec<u8>>, more: bool) -> Self {
        Frame {
            data: data.into(),
            more,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of this frame on the wire, header included.
    pub fn wire_size(&self) -> usize {
        header_size(self.data.len()) + self.data.len()
    }
}

/// A whole message: one or more frames.
pub type Message = Vec<Frame>;

/// Build a single-frame message.
pub fn message(data: impl Into<Vec<u8>>) -> Message {
    vec![Frame::new(data, false)]
}

/// Header size for a payload of `len` bytes.
pub fn header_size(len: usize) -> usize {
    if len <= SHORT_MAX { 2 } else { 10 }
}

/// Append the frame header for a payload of `len` bytes to `out`.
pub fn put_header(len: usize, more: bool, out: &mut Vec<u8>) {
    let stored = (len + 1) as u64;
    if len <= SHORT_MAX {
        out.push(stored as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&stored.to_be_bytes());
    }
    out.push(u8::from(more));
}

/// Encode the frame header for a payload of `len` bytes into a fixed
/// scratch buffer, returning the number of header bytes written.
pub fn write_header(len: usize, more: bool, out: &mut [u8; 10]) -> usize {
    let stored = (len + 1) as u64;
    if len <= SHORT_MAX {
        out[0] = stored as u8;
        out[1] = u8::from(more);
        2
    } else {
        out[0] = 0xFF;
        out[1..9].copy_from_slice(&stored.to_be_bytes());
        out[9] = u8::from(more);
        10
    }
}

/// Parse a frame header from the start of `data`.
///
/// Returns `Ok(Some((payload_len, more, header_len)))` on a complete header,
/// `Ok(None)` when more bytes are needed, and `Corrupt` on a zero length
/// field (no valid encoding stores zero, since the more-octet is folded in).
pub fn parse_header(data: &[u8]) -> Result<Option<(usize, bool, usize)>, VtxError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] == 0 {
        return Err(VtxError::Corrupt);
    }
    if data[0] < 0xFF {
        if data.len() < 2 {
            return Ok(None);
        }
        Ok(Some((data[0] as usize - 1, data[1] == 1, 2)))
    } else {
        if data.len() < 10 {
            return Ok(None);
        }
        let stored = u64::from_be_bytes(data[1..9].try_into().unwrap());
        if stored == 0 {
            return Err(VtxError::Corrupt);
        }
        Ok(Some((stored as usize - 1, data[9] == 1, 10)))
    }
}

/// Serialize a whole message as concatenated wire frames.
pub fn encode_message(msg: &Message, out: &mut Vec<u8>) {
    for frame in msg {
        put_header(frame.data.len(), frame.more, out);
        out.extend_from_slice(&frame.data);
    }
}

/// Serialized size of a whole message.
pub fn message_wire_size(msg: &Message) -> usize {
    msg.iter().map(Frame::wire_size).sum()
}

/// Parse a buffer holding exactly one whole message.
///
/// Truncated or trailing bytes are `Corrupt`; the caller is expected to
/// hand over one complete serialized message (a NOM body).
pub fn decode_message(mut data: &[u8]) -> Result<Message, VtxError> {
    let mut msg = Message::new();
    while !data.is_empty() {
        let (len, more, header) = parse_header(data)?.ok_or(VtxError::Corrupt)?;
        if data.len() < header + len {
            return Err(VtxError::Corrupt);
        }
        msg.push(Frame::new(&data[header..header + len], more));
        data = &data[header + len..];
    }
    if msg.is_empty() {
        return Err(VtxError::Corrupt);
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_header_round_trip() {
        let mut buf = Vec::new();
        put_header(0, false, &mut buf);
        assert_eq!(buf, vec![1, 0]);
        assert_eq!(parse_header(&buf).unwrap(), Some((0, false, 2)));

        buf.clear();
        put_header(SHORT_MAX, true, &mut buf);
        assert_eq!(buf.len(), 2);
        assert_eq!(parse_header(&buf).unwrap(), Some((SHORT_MAX, true, 2)));
    }

    #[test]
    fn test_long_header_round_trip() {
        let mut buf = Vec::new();
        put_header(SHORT_MAX + 1, true, &mut buf);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf[0], 0xFF);
        assert_eq!(parse_header(&buf).unwrap(), Some((SHORT_MAX + 1, true, 10)));

        buf.clear();
        put_header(70_000, false, &mut buf);
        assert_eq!(parse_header(&buf).unwrap(), Some((70_000, false, 10)));
    }

    #[test]
    fn test_incomplete_header() {
        assert_eq!(parse_header(&[]).unwrap(), None);
        assert_eq!(parse_header(&[5]).unwrap(), None);
        assert_eq!(parse_header(&[0xFF, 0, 0, 0]).unwrap(), None);
    }

    #[test]
    fn test_zero_length_is_corrupt() {
        assert!(parse_header(&[0, 0]).is_err());
    }

    #[test]
    fn test_message_round_trip() {
        let msg = vec![
            Frame::new(b"udp://127.0.0.1:32000".to_vec(), true),
            Frame::new(Vec::new(), true),
            Frame::new(vec![7u8; 400], false),
        ];
        let mut buf = Vec::new();
        encode_message(&msg, &mut buf);
        assert_eq!(buf.len(), message_wire_size(&msg));
        assert_eq!(decode_message(&buf).unwrap(), msg);
    }

    #[test]
    fn test_truncated_message_is_corrupt() {
        let mut buf = Vec::new();
        encode_message(&message(b"hello".to_vec()), &mut buf);
        buf.pop();
        assert!(decode_message(&buf).is_err());
    }
}
