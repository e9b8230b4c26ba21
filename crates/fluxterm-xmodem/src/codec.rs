//! # Frame Codec
//!
//! Pure functions over XMODEM frames. A data frame is
//!
//! ```text
//! header | block# | !block# | data (128 or 1024) | trailer (1 or 2)
//! ```
//!
//! where the header is SOH for 128-byte blocks and STX for 1024-byte blocks,
//! and the trailer is either an 8-bit arithmetic checksum or a CRC-16
//! (polynomial 0x1021, zero init, no reflection, big-endian on the wire).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

// ─── Control Bytes ──────────────────────────────────────────────────────────

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Padding for the final partial block.
pub const SUB: u8 = 0x1A;
/// Receiver start signal requesting CRC-16 trailers.
pub const CRC_REQUEST: u8 = b'C';

// ─── Block Size ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    /// 128 bytes, SOH header.
    Standard,
    /// 1024 bytes, STX header.
    Extended,
}

impl BlockSize {
    pub const fn len(self) -> usize {
        match self {
            BlockSize::Standard => 128,
            BlockSize::Extended => 1024,
        }
    }

    pub const fn header(self) -> u8 {
        match self {
            BlockSize::Standard => SOH,
            BlockSize::Extended => STX,
        }
    }

    pub fn from_header(byte: u8) -> Option<Self> {
        match byte {
            SOH => Some(BlockSize::Standard),
            STX => Some(BlockSize::Extended),
            _ => None,
        }
    }
}

// ─── Trailer Mode ───────────────────────────────────────────────────────────

/// Error-detection trailer, chosen by the receiver's start signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// 1-byte arithmetic sum, requested with NAK.
    Sum8,
    /// 2-byte CRC-16, requested with 'C'.
    Crc16,
}

impl Checksum {
    pub const fn trailer_len(self) -> usize {
        match self {
            Checksum::Sum8 => 1,
            Checksum::Crc16 => 2,
        }
    }

    /// The byte a receiver sends to ask for this mode.
    pub const fn request_byte(self) -> u8 {
        match self {
            Checksum::Sum8 => NAK,
            Checksum::Crc16 => CRC_REQUEST,
        }
    }

    pub fn from_request(byte: u8) -> Option<Self> {
        match byte {
            NAK => Some(Checksum::Sum8),
            CRC_REQUEST => Some(Checksum::Crc16),
            _ => None,
        }
    }

    fn put_trailer(self, data: &[u8], buf: &mut BytesMut) {
        match self {
            Checksum::Sum8 => buf.put_u8(checksum(data)),
            Checksum::Crc16 => buf.put_u16(crc16(data)),
        }
    }

    fn matches(self, data: &[u8], trailer: &[u8]) -> bool {
        match self {
            Checksum::Sum8 => trailer == [checksum(data)],
            Checksum::Crc16 => trailer == crc16(data).to_be_bytes(),
        }
    }
}

/// Sum of all bytes modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-16/XMODEM: polynomial 0x1021, init 0, no reflection, no final xor.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ─── Blocks ─────────────────────────────────────────────────────────────────

/// Number of blocks needed for `len` payload bytes.
pub fn block_count(len: usize, size: BlockSize) -> usize {
    len.div_ceil(size.len())
}

/// Split a payload into fixed-size blocks, right-padding the last one with
/// [`SUB`].
pub fn split_blocks(payload: &[u8], size: BlockSize) -> Vec<Bytes> {
    payload
        .chunks(size.len())
        .map(|chunk| {
            let mut block = BytesMut::with_capacity(size.len());
            block.extend_from_slice(chunk);
            block.resize(size.len(), SUB);
            block.freeze()
        })
        .collect()
}

/// Block number carried by the `index`-th block (0-based). Wraps 255 → 0.
pub fn block_number(index: usize) -> u8 {
    (index.wrapping_add(1) & 0xFF) as u8
}

/// Encode one data frame. `data` must already be exactly one block long.
pub fn encode_frame(number: u8, data: &[u8], mode: Checksum) -> Bytes {
    let size = if data.len() > BlockSize::Standard.len() {
        BlockSize::Extended
    } else {
        BlockSize::Standard
    };
    let mut buf = BytesMut::with_capacity(3 + data.len() + mode.trailer_len());
    buf.put_u8(size.header());
    buf.put_u8(number);
    buf.put_u8(!number);
    buf.put_slice(data);
    mode.put_trailer(data, &mut buf);
    buf.freeze()
}

// ─── Verification ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("block number {number} does not match its complement {complement:#04x}")]
    BadComplement { number: u8, complement: u8 },
    #[error("unexpected block number {actual} (expected {expected})")]
    WrongBlock { expected: u8, actual: u8 },
    #[error("trailer mismatch on block {0}")]
    BadTrailer(u8),
}

/// Length of a frame body (everything after the header byte).
pub const fn body_len(size: BlockSize, mode: Checksum) -> usize {
    2 + size.len() + mode.trailer_len()
}

/// Validate a frame body read after its header byte and return the data
/// block it carries.
pub fn verify_frame(
    body: &[u8],
    size: BlockSize,
    expected: u8,
    mode: Checksum,
) -> Result<&[u8], FrameError> {
    let want = body_len(size, mode);
    if body.len() != want {
        return Err(FrameError::Truncated {
            expected: want,
            actual: body.len(),
        });
    }
    let (number, complement) = (body[0], body[1]);
    if number != !complement {
        return Err(FrameError::BadComplement { number, complement });
    }
    if number != expected {
        return Err(FrameError::WrongBlock {
            expected,
            actual: number,
        });
    }
    let (data, trailer) = body[2..].split_at(size.len());
    if !mode.matches(data, trailer) {
        return Err(FrameError::BadTrailer(number));
    }
    Ok(data)
}
