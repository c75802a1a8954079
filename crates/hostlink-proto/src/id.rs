//! Backend server identifiers
//!
//! A `ServerId` names one backend behind the relay. On the wire it is an
//! 8-byte big-endian integer; clients select a backend by embedding the
//! compact text form as the leading label of the hostname they connect to
//! (`<id>.proxy.example.com`). The text form is lowercase base-36 so it is
//! always a valid hostname label.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const RADIX: u64 = 36;
const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Longest base-36 rendering of a u64 ("3w5e11264sgsf").
const MAX_DIGITS: usize = 13;

/// Errors from parsing the text form of a [`ServerId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseServerIdError {
    #[error("server id is empty")]
    Empty,

    #[error("invalid character {0:?} in server id")]
    InvalidDigit(char),

    #[error("server id is too long")]
    Overflow,
}

/// Identifier of a backend management link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServerId(u64);

impl ServerId {
    /// Placeholder id of a link that has not completed its handshake.
    pub const ZERO: ServerId = ServerId(0);

    pub const fn new(raw: u64) -> Self {
        ServerId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ServerId {
    fn from(raw: u64) -> Self {
        ServerId(raw)
    }
}

impl FromStr for ServerId {
    type Err = ParseServerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseServerIdError::Empty);
        }
        if s.len() > MAX_DIGITS {
            return Err(ParseServerIdError::Overflow);
        }

        let mut value: u64 = 0;
        for c in s.chars() {
            let digit = match c {
                '0'..='9' => c as u64 - '0' as u64,
                'a'..='z' => c as u64 - 'a' as u64 + 10,
                _ => return Err(ParseServerIdError::InvalidDigit(c)),
            };
            value = value
                .checked_mul(RADIX)
                .and_then(|v| v.checked_add(digit))
                .ok_or(ParseServerIdError::Overflow)?;
        }

        Ok(ServerId(value))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; MAX_DIGITS];
        let mut pos = MAX_DIGITS;
        let mut rest = self.0;
        loop {
            pos -= 1;
            buf[pos] = DIGITS[(rest % RADIX) as usize];
            rest /= RADIX;
            if rest == 0 {
                break;
            }
        }
        // Digits are ASCII by construction.
        f.write_str(std::str::from_utf8(&buf[pos..]).unwrap())
    }
}
