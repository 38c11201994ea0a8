//! Whole-message view over the frame stream.
//!
//! A logical message may not fit in one frame once the connection's
//! transmit-unit size is applied; [`fragment`] splits it on the way out
//! and a per-connection [`Reassembler`] stitches fragments back together
//! on the way in.

use bytes::{Bytes, BytesMut};

use super::frame::{Command, Frame, FLAG_CONTINUATION, FLAG_LAST, HEADER_LEN};
use super::ProtocolError;

/// Hard cap on a reassembled message. History blobs run to a few MiB;
/// anything past this is a runaway peer.
pub const MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// One logical bus message, independent of how it was framed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: Command,
    pub tag_id: u16,
    pub time_us: u64,
    pub bus_id: u16,
    pub payload: Bytes,
}

impl Message {
    pub fn new(command: Command, tag_id: u16, time_us: u64, bus_id: u16, payload: Bytes) -> Message {
        Message {
            command,
            tag_id,
            time_us,
            bus_id,
            payload,
        }
    }

    /// An ERR frame carrying diagnostic text, tag_id echoing the offender.
    pub fn error(tag_id: u16, text: &str) -> Message {
        Message::new(Command::Err, tag_id, 0, 0, Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Split `message` into frames of at most `tus` bytes each (header
/// included). A message that fits yields a single frame with no flags;
/// larger ones get CONTINUATION on all but the final frame and LAST on
/// the final one.
pub fn fragment(message: Message, tus: usize) -> Vec<Frame> {
    let chunk = tus.saturating_sub(HEADER_LEN).max(1);
    let Message {
        command,
        tag_id,
        time_us,
        bus_id,
        payload,
    } = message;

    if payload.len() <= chunk {
        return vec![Frame {
            command,
            tag_id,
            flags: 0,
            time_us,
            bus_id,
            payload,
        }];
    }

    let mut frames = Vec::with_capacity(payload.len() / chunk + 1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        let flags = if end == payload.len() {
            FLAG_LAST
        } else {
            FLAG_CONTINUATION
        };
        frames.push(Frame {
            command,
            tag_id,
            flags,
            time_us,
            bus_id,
            payload: payload.slice(offset..end),
        });
        offset = end;
    }
    frames
}

struct Partial {
    command: Command,
    tag_id: u16,
    time_us: u64,
    bus_id: u16,
    buf: BytesMut,
}

/// Buffers CONTINUATION fragments until LAST arrives, then yields the
/// whole message. One reassembly may be open at a time per connection;
/// the stream is FIFO so fragments of a message are contiguous.
pub struct Reassembler {
    max_message: usize,
    pending: Option<Partial>,
}

impl Reassembler {
    pub fn new(max_message: usize) -> Reassembler {
        Reassembler {
            max_message,
            pending: None,
        }
    }

    /// Feed one frame; returns a complete message when one is ready.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        if frame.is_continuation() || frame.is_last() {
            if let Some(partial) = &self.pending {
                if partial.command != frame.command
                    || partial.tag_id != frame.tag_id
                    || partial.time_us != frame.time_us
                    || partial.bus_id != frame.bus_id
                {
                    self.pending = None;
                    return Err(ProtocolError::FragmentMismatch);
                }
            }
            let partial = self.pending.get_or_insert_with(|| Partial {
                command: frame.command,
                tag_id: frame.tag_id,
                time_us: frame.time_us,
                bus_id: frame.bus_id,
                buf: BytesMut::new(),
            });

            if partial.buf.len() + frame.payload.len() > self.max_message {
                self.pending = None;
                return Err(ProtocolError::MessageTooLarge(self.max_message));
            }
            partial.buf.extend_from_slice(&frame.payload);

            if frame.is_last() {
                if let Some(done) = self.pending.take() {
                    return Ok(Some(Message {
                        command: done.command,
                        tag_id: done.tag_id,
                        time_us: done.time_us,
                        bus_id: done.bus_id,
                        payload: done.buf.freeze(),
                    }));
                }
            }
            return Ok(None);
        }

        // Unfragmented frame; an open reassembly cannot be interleaved.
        if self.pending.is_some() {
            self.pending = None;
            return Err(ProtocolError::FragmentMismatch);
        }
        Ok(Some(Message {
            command: frame.command,
            tag_id: frame.tag_id,
            time_us: frame.time_us,
            bus_id: frame.bus_id,
            payload: frame.payload,
        }))
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new(MAX_MESSAGE)
    }
}
