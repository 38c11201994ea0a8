//! Frame header layout and the tokio-util codec for it.
//!
//! Every frame on the wire is an 18 byte big-endian header followed by
//! up to `TUS - HEADER_LEN` payload bytes:
//!
//! | command | tag_id | flags | length | time_us | bus_id | payload |
//! |   1 B   |  2 B   |  1 B  |  4 B   |   8 B   |  2 B   |   var   |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 18;

/// Default transmit-unit size: the largest frame (header + payload) either
/// side emits before fragmenting.
pub const DEFAULT_TUS: usize = 55_000;

/// Set on every fragment of a split message except the final one.
pub const FLAG_CONTINUATION: u8 = 0b0000_0001;
/// Set on the final fragment of a split message.
pub const FLAG_LAST: u8 = 0b0000_0010;

/// The six message kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Name to id registration, broadcast so every peer learns the mapping.
    Id = 0x01,
    /// Publish a value.
    Set = 0x02,
    /// Ask for the current value, answered with a SET to the requester only.
    Get = 0x03,
    /// Request-to-author rendezvous.
    Rta = 0x04,
    /// Subscribe to a tag id.
    Sub = 0x05,
    /// Diagnostic text from the server.
    Err = 0x06,
}

impl Command {
    pub fn from_byte(byte: u8) -> Result<Command, ProtocolError> {
        match byte {
            0x01 => Ok(Command::Id),
            0x02 => Ok(Command::Set),
            0x03 => Ok(Command::Get),
            0x04 => Ok(Command::Rta),
            0x05 => Ok(Command::Sub),
            0x06 => Ok(Command::Err),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// One wire frame. `payload` holds only this frame's slice of the message;
/// see [`super::assembly`] for the whole-message view.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub tag_id: u16,
    pub flags: u8,
    pub time_us: u64,
    pub bus_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_continuation(&self) -> bool {
        self.flags & FLAG_CONTINUATION != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }
}

/// Length-prefixed frame codec over a TCP byte stream.
///
/// `max_payload` bounds the per-frame payload a peer may declare; a larger
/// length field is a protocol violation and poisons the connection.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> FrameCodec {
        FrameCodec { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_TUS)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek the declared payload length before committing to the frame.
        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if length > self.max_payload {
            return Err(ProtocolError::Oversize {
                got: length,
                limit: self.max_payload,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let command = Command::from_byte(src.get_u8())?;
        let tag_id = src.get_u16();
        let flags = src.get_u8();
        let _length = src.get_u32();
        let time_us = src.get_u64();
        let bus_id = src.get_u16();
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            command,
            tag_id,
            flags,
            time_us,
            bus_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > self.max_payload {
            return Err(ProtocolError::Oversize {
                got: frame.payload.len(),
                limit: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.command as u8);
        dst.put_u16(frame.tag_id);
        dst.put_u8(frame.flags);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_u64(frame.time_us);
        dst.put_u16(frame.bus_id);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
