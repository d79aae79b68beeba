//! Netstring framing for the SCGI header block.
//!
//! A request starts with `<length>:<header-block>,` where `<length>` is the
//! decimal byte count of `<header-block>` and the block is a run of
//! NUL-terminated `key\0value\0` tokens. The raw body follows the comma.
//!
//! The functions here are pure: they work on byte slices and never perform
//! I/O, so the async reader in the server crate drives them incrementally.

use crate::error::{LengthFault, ProtocolError};
use crate::headers::HeaderSet;

/// Maximum number of characters accepted before the `:` of a length prefix.
pub const MAX_LENGTH_DIGITS: usize = 10;

/// Result of scanning the start of a buffer for a length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    /// More bytes are needed before the prefix can be judged.
    Incomplete,
    /// The prefix was read. `consumed` includes the `:`.
    Complete { length: usize, consumed: usize },
}

/// Scans `buf` for a netstring length prefix.
///
/// Never looks past the first `MAX_LENGTH_DIGITS + 1` bytes, so an overlong
/// prefix is rejected as soon as that many bytes are buffered.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedLength`] for an empty prefix, a
/// non-digit byte, more than [`MAX_LENGTH_DIGITS`] characters, or a length
/// that does not fit in `usize`.
pub fn scan_length_prefix(buf: &[u8]) -> Result<LengthPrefix, ProtocolError> {
    for (i, &byte) in buf.iter().enumerate() {
        if byte == b':' {
            if i == 0 {
                return Err(LengthFault::Empty.into());
            }
            let length = parse_digits(&buf[..i])?;
            return Ok(LengthPrefix::Complete {
                length,
                consumed: i + 1,
            });
        }
        if i >= MAX_LENGTH_DIGITS {
            return Err(LengthFault::TooManyDigits.into());
        }
        if !byte.is_ascii_digit() {
            return Err(LengthFault::NotADigit(byte).into());
        }
    }
    Ok(LengthPrefix::Incomplete)
}

fn parse_digits(digits: &[u8]) -> Result<usize, LengthFault> {
    // At most ten digits, which always fits in a u64.
    let value = digits
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
    usize::try_from(value).map_err(|_| LengthFault::Overflow)
}

/// Checks the byte that must follow the header block.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedTerminator`] unless `byte` is `,`.
pub fn check_terminator(byte: u8) -> Result<(), ProtocolError> {
    if byte == b',' {
        Ok(())
    } else {
        Err(ProtocolError::MalformedTerminator { found: byte })
    }
}

/// Decodes a header block payload into a [`HeaderSet`].
///
/// The payload is split on NUL bytes and consecutive tokens are paired into
/// name/value entries. The final NUL terminates the last token rather than
/// starting an empty one, so `A\0\0` is the single header `A = ""`. Header
/// bytes that are not valid UTF-8 are replaced with U+FFFD.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedHeaderPairs`] when the token count is odd.
pub fn decode_header_block(payload: &[u8]) -> Result<HeaderSet, ProtocolError> {
    if payload.is_empty() {
        return Ok(HeaderSet::new());
    }

    let trimmed = payload.strip_suffix(b"\0").unwrap_or(payload);
    let tokens: Vec<&[u8]> = trimmed.split(|&b| b == 0).collect();
    if tokens.len() % 2 != 0 {
        return Err(ProtocolError::MalformedHeaderPairs {
            tokens: tokens.len(),
        });
    }

    Ok(tokens
        .chunks_exact(2)
        .map(|pair| {
            (
                String::from_utf8_lossy(pair[0]).into_owned(),
                String::from_utf8_lossy(pair[1]).into_owned(),
            )
        })
        .collect())
}

/// Encodes a header set as a complete netstring, including prefix and comma.
///
/// Names and values must not contain NUL bytes.
#[must_use]
pub fn encode_header_block(headers: &HeaderSet) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in headers.iter() {
        block.extend_from_slice(name.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }

    let mut out = Vec::with_capacity(block.len() + MAX_LENGTH_DIGITS + 2);
    out.extend_from_slice(block.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(&block);
    out.push(b',');
    out
}

/// Encodes a full SCGI request: the header netstring followed by `body`.
///
/// The caller is responsible for `CONTENT_LENGTH` matching `body.len()`.
#[must_use]
pub fn encode_request(headers: &HeaderSet, body: &[u8]) -> Vec<u8> {
    let mut out = encode_header_block(headers);
    out.extend_from_slice(body);
    out
}
