//! Wire protocol: frame header, value encoding and fragmentation.

pub mod assembly;
pub mod frame;
pub mod value;

pub use assembly::{fragment, Message, Reassembler};
pub use frame::{Command, Frame, FrameCodec, DEFAULT_TUS, FLAG_CONTINUATION, FLAG_LAST, HEADER_LEN};
pub use value::Value;

use thiserror::Error;

/// Faults raised by the codec and reassembly layers. Anything in here is
/// a protocol violation or a transport failure; stale writes and unknown
/// tag ids are handled at the bus layer instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("frame payload of {got} bytes exceeds the {limit} byte limit")]
    Oversize { got: usize, limit: usize },
    #[error("value payload truncated")]
    Truncated,
    #[error("unknown value kind {0}")]
    UnknownKind(u8),
    #[error("value body is not valid utf-8")]
    Utf8,
    #[error("value body is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("fragment does not continue the open message")]
    FragmentMismatch,
    #[error("reassembled message exceeds {0} bytes")]
    MessageTooLarge(usize),
}
