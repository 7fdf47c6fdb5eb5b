//! implements a parser for the line-based control protocol.
use std::fmt;

use crate::types::protocol::Command;
use crate::types::serialisable::WireSerialisable;

/// Longest owner, category or label token accepted.
const MAX_NAME_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl WireSerialisable for ParsingError {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        let r = self.expect_next_u64()?;
        u32::try_from(r).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes from the input, expecting a space then a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u64)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then a name.
    fn expect_next_name(&mut self) -> Result<Vec<u8>, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        fn char_is_name_safe(c: u8, is_first: bool) -> bool {
            match c {
                b'a'..=b'z' => true,
                b'A'..=b'Z' => true,
                b'0'..=b'9' => true,
                b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
                b'@' => true,
                b'-' => !is_first, // - is only name safe outside first position
                _ => false,
            }
        }

        if token
            .iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
            && token.len() <= MAX_NAME_LEN
        {
            Ok(token.to_vec())
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// As `expect_next_name`, but a lone `-` stands for "absent".
    fn expect_next_optional_name(
        &mut self,
    ) -> Result<Option<Vec<u8>>, ParsingError> {
        if self.from.starts_with(b" -")
            && matches!(self.from.get(2), None | Some(b' '))
        {
            self.from = &self.from[2..];
            return Ok(None);
        }

        self.expect_next_name().map(Some)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for Command {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use Command::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"queue-status" => QueueStatus,
            b"rate-status" => RateStatus,
            b"stats" => Stats,
            b"quit" => Quit,

            // <cmd> <id>
            b"job-status" => JobStatus {
                id: ps.expect_next_u64()?,
            },

            // <cmd> <owner> <category> <label> <n_bytes>
            b"submit" => Submit {
                owner: ps.expect_next_name()?,
                category: ps.expect_next_optional_name()?,
                label: ps.expect_next_optional_name()?,
                n_bytes: ps.expect_next_u32()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
