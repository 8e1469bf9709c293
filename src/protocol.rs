use crate::codes::CodeTable;
use crate::transfer::{TransferKind, TransferMetadata, UrbEvent};
use byteorder::{ByteOrder, LE};
use log::{debug, trace};
use std::borrow::Cow;
use std::fmt::Display;
use std::ops::Range;
use thiserror::Error;

/// First byte of every frame, in both directions.
pub const START_OF_PACKET: u8 = 0x01;
/// Last byte of every frame sent by a conforming host or bootloader. Captured, never checked.
pub const END_OF_PACKET: u8 = 0x17;

/// Host-to-device frames are written to this interrupt endpoint.
pub const COMMAND_ENDPOINT: u8 = 1;
/// Device-to-host frames are read from this interrupt endpoint.
pub const RESPONSE_ENDPOINT: u8 = 2;

// SOP + code + 2-byte length
const HEADER_SIZE: usize = 4;
// 2-byte checksum + EOP
const FOOTER_SIZE: usize = 3;
/// Size of a frame with an empty payload.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// Which way a frame travels. The bootloader uses the same framing both ways, so this is decided
/// by transfer metadata, not frame content.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Host to device, on [COMMAND_ENDPOINT].
    Command,
    /// Device to host, on [RESPONSE_ENDPOINT].
    Response,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Direction::Command => write!(f, "command"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// Decide whether `buffer` is a bootloader frame and, if so, which way it is going. [None] means
/// the buffer should be left to some other decoder; an empty buffer is simply not a frame.
pub fn classify(buffer: &[u8], metadata: &TransferMetadata) -> Option<Direction> {
    if metadata.kind != TransferKind::Interrupt {
        return None;
    }

    if buffer.first() != Some(&START_OF_PACKET) {
        return None;
    }

    match (metadata.event, metadata.endpoint) {
        (UrbEvent::Submit, COMMAND_ENDPOINT) => Some(Direction::Command),
        (UrbEvent::Complete, RESPONSE_ENDPOINT) => Some(Direction::Response),
        _ => None,
    }
}

/// The second frame byte: a command code going out, a status code coming back.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Discriminator {
    pub code: u8,
    /// Symbolic name, if the code table knows this code.
    pub name: Option<Cow<'static, str>>,
}

impl Display for Discriminator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{:#04x} ({name})", self.code),
            None => write!(f, "{:#04x} (unknown)", self.code),
        }
    }
}

/// One decoded bootloader frame.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootloaderFrame {
    pub direction: Direction,
    pub start_marker: u8,
    /// Command code for [Direction::Command], status code for [Direction::Response].
    pub discriminator: Discriminator,
    pub data_length: u16,
    pub payload: Vec<u8>,
    /// As captured. Not compared against anything.
    pub checksum: u16,
    pub end_marker: u8,
    /// Byte range of the input buffer past the end of the frame, if the buffer was longer than
    /// the frame claims to be.
    pub leftover: Option<Range<usize>>,
}

impl BootloaderFrame {
    /// Number of bytes the frame occupies on the wire.
    pub fn frame_len(&self) -> usize {
        MIN_FRAME_SIZE + self.data_length as usize
    }

    pub fn leftover_len(&self) -> usize {
        self.leftover.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_command(&self) -> bool {
        self.direction == Direction::Command
    }
}

/// Decode `buffer` as a frame travelling in `direction`, naming codes from the built-in tables.
pub fn decode(buffer: &[u8], direction: Direction) -> Result<BootloaderFrame, DecodeError> {
    decode_with(buffer, direction, CodeTable::builtin())
}

/// Decode `buffer` as a frame travelling in `direction`, naming codes from `codes`. Nothing past
/// the end of `buffer` is ever read: a frame whose length field runs off the end of the buffer is
/// reported as [DecodeError::Truncated] rather than partially decoded.
pub fn decode_with(
    buffer: &[u8],
    direction: Direction,
    codes: &CodeTable,
) -> Result<BootloaderFrame, DecodeError> {
    if buffer.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            expected: HEADER_SIZE,
            actual: buffer.len(),
        });
    }

    let data_length = LE::read_u16(&buffer[2..4]);
    let frame_len = MIN_FRAME_SIZE + data_length as usize;
    if buffer.len() < frame_len {
        return Err(DecodeError::Truncated {
            expected: frame_len,
            actual: buffer.len(),
        });
    }

    let code = buffer[1];
    let name = match direction {
        Direction::Command => codes.command_entry(code),
        Direction::Response => codes.status_entry(code),
    };

    let payload_end = HEADER_SIZE + data_length as usize;
    let checksum = LE::read_u16(&buffer[payload_end..payload_end + 2]);
    let end_marker = buffer[payload_end + 2];

    let leftover = if buffer.len() > frame_len {
        debug!(
            "{} bytes left over after {frame_len}-byte {direction} frame",
            buffer.len() - frame_len
        );
        Some(frame_len..buffer.len())
    } else {
        None
    };

    trace!("Raw {direction} frame: {:02x?}", &buffer[..frame_len]);

    Ok(BootloaderFrame {
        direction,
        start_marker: buffer[0],
        discriminator: Discriminator {
            code,
            name: name.cloned(),
        },
        data_length,
        payload: buffer[HEADER_SIZE..payload_end].to_vec(),
        checksum,
        end_marker,
        leftover,
    })
}

/// Classify and, if applicable, decode. `Ok(None)` means the buffer is not a bootloader frame.
pub fn dissect(
    buffer: &[u8],
    metadata: &TransferMetadata,
    codes: &CodeTable,
) -> Result<Option<BootloaderFrame>, DecodeError> {
    match classify(buffer, metadata) {
        Some(direction) => decode_with(buffer, direction, codes).map(Some),
        None => Ok(None),
    }
}

/// Structural problems with a buffer that was classified as a frame.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("frame is truncated: needs {expected} bytes, buffer has {actual}")]
    Truncated { expected: usize, actual: usize },
}
