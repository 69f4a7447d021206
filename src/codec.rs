//! Line encoding for data transfers.
//!
//! Each line carries up to `LINE_SIZE` bytes: one length character followed by
//! four characters per group of three bytes. Every character holds six bits,
//! offset by 0x20, with zero mapped to 0x60 so lines never contain spaces.

use thiserror::Error;

use crate::protocol::LINE_SIZE;

const ZERO_CHAR: u8 = 0x60;
const OFFSET: u8 = 0x20;

#[derive(Error, Clone, PartialEq, Debug)]
pub enum CodecError {
    #[error("line payload of {0} bytes exceeds the maximum of 45")]
    LineTooLong(usize),

    #[error("encoded line is empty")]
    Empty,

    #[error("encoded line length {actual} does not match the {expected} expected for its length byte")]
    LengthMismatch { expected: usize, actual: usize },
}

fn encode_char(v: u32) -> char {
    let v = (v & 0x3f) as u8;
    if v == 0 {
        ZERO_CHAR as char
    } else {
        (v + OFFSET) as char
    }
}

fn decode_char(c: u8) -> u32 {
    (c.wrapping_sub(OFFSET) & 0x3f) as u32
}

/// Length of an encoded line carrying `len` bytes, including the length character
pub fn encoded_len(len: usize) -> usize {
    (len + 2) / 3 * 4 + 1
}

/// Encode up to `LINE_SIZE` bytes into a single line (without terminator)
pub fn encode(data: &[u8]) -> Result<String, CodecError> {
    if data.len() > LINE_SIZE {
        return Err(CodecError::LineTooLong(data.len()));
    }

    let mut line = String::with_capacity(encoded_len(data.len()));
    line.push(encode_char(data.len() as u32));

    for group in data.chunks(3) {
        // Last group is zero padded
        let mut b = [0u8; 3];
        b[..group.len()].copy_from_slice(group);

        let v = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
        for shift in [18, 12, 6, 0].iter() {
            line.push(encode_char(v >> shift));
        }
    }

    Ok(line)
}

/// Decode a single line (without terminator) into its payload bytes
pub fn decode(line: &str) -> Result<Vec<u8>, CodecError> {
    let raw = line.as_bytes();
    let len = match raw.first() {
        Some(c) => decode_char(*c) as usize,
        None => return Err(CodecError::Empty),
    };

    let expected = encoded_len(len);
    if raw.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: raw.len(),
        });
    }

    let mut data = Vec::with_capacity(len + 2);
    for group in raw[1..].chunks(4) {
        let v = group.iter().fold(0u32, |acc, c| acc << 6 | decode_char(*c));
        data.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
    }

    // Drop group padding
    data.truncate(len);

    Ok(data)
}

/// Block checksum, the plain sum of the raw byte values
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().map(|b| *b as u32).sum()
}
