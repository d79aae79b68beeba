//! Protocol framing errors.

use thiserror::Error;

/// Why a netstring length prefix was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LengthFault {
    /// The prefix had no digits before the `:`.
    #[error("no digits before ':'")]
    Empty,
    /// More than [`MAX_LENGTH_DIGITS`](crate::netstring::MAX_LENGTH_DIGITS) characters
    /// appeared without a terminating `:`.
    #[error("prefix longer than {} characters", crate::netstring::MAX_LENGTH_DIGITS)]
    TooManyDigits,
    /// A byte other than an ASCII digit or `:` appeared in the prefix.
    #[error("unexpected byte {0:#04x} in prefix")]
    NotADigit(u8),
    /// The declared length does not fit in `usize` on this platform.
    #[error("declared length does not fit in memory")]
    Overflow,
}

/// Errors raised while decoding the netstring header block of a request.
///
/// None of these are fatal to the processor: the connection that produced
/// them is closed without a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed netstring length: {0}")]
    MalformedLength(#[from] LengthFault),
    #[error("header block not terminated by ',' (found {found:#04x})")]
    MalformedTerminator { found: u8 },
    #[error("header block has an odd number of tokens ({tokens})")]
    MalformedHeaderPairs { tokens: usize },
}
