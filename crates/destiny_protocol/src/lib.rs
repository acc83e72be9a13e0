#![doc = include_str!("../README.md")]

pub mod command;
pub mod decode;
pub mod encode;
pub mod keyword;

mod frame;

pub use command::Command;
pub use decode::FrameDecoder;
pub use encode::FrameEncoder;
pub use frame::{additive_checksum, Frame, FrameHeader};
pub use keyword::KeywordRing;
use thiserror::Error;

/// The maximum number of bytes in a single frame, header included.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 12;

/// The maximum payload a frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Protocol-level failures. Transport problems live in `destiny_network`;
/// everything here is recoverable by dropping the offending frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame's declared size or checksum did not match its contents.
    #[error("corrupt frame: {0}")]
    CorruptFrame(&'static str),
    /// The declared frame size exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge { size: usize },
    /// The frame's keyword byte does not match the next expected ring value.
    #[error("keyword {got:#04x} does not match expected ring value {expected:#04x}")]
    InvalidKeyword { got: u8, expected: u8 },
    /// The command code is not part of the protocol.
    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u16),
}
