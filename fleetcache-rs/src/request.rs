//! Parses incoming RESP requests.
//!
//! A request is an array of bulk strings: `*<count>\r\n` followed by `<count>` times
//! `$<length>\r\n<data>\r\n`. A peer asking for a value therefore sends:
//!
//! `*3\r\n$9\r\nGROUP.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n`
//!
//! As data arrives in chunks, [Request::parse](Request::parse) distinguishes three outcomes: a
//! complete request, a partial one (more data is needed) and malformed data. The parser only
//! records offsets into the received buffer, no parameter data is copied.
//!
//! # Examples
//!
//! ```
//! # use bytes::BytesMut;
//! # use fleetcache::request::Request;
//! let bytes = BytesMut::from("*3\r\n$9\r\nGROUP.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n");
//! let request = Request::parse(&bytes).unwrap().unwrap();
//!
//! assert_eq!(request.command(), "GROUP.GET");
//! assert_eq!(request.str_parameter(0).unwrap(), "scores");
//! assert_eq!(request.str_parameter(1).unwrap(), "Tom");
//! assert_eq!(request.len(), bytes.len());
//!
//! // A partial request yields None...
//! let bytes = BytesMut::from("*2\r\n$4\r\nPING\r\n$7\r\nTESTP");
//! assert_eq!(Request::parse(&bytes).unwrap().is_none(), true);
//!
//! // Whereas malformed data is reported as error...
//! let bytes = BytesMut::from("$4\r\nPING\r\n");
//! assert_eq!(Request::parse(&bytes).is_err(), true);
//! ```
use std::ops::Range;

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};

/// Limits the number of digits accepted for a count or length.
const MAX_DIGITS: usize = 10;

/// Represents a parsed RESP request.
///
/// The first element is treated as command, the remaining ones as parameters. Therefore
/// "GROUP.GET scores Tom" has "GROUP.GET" as command, "scores" as parameter 0 and "Tom" as
/// parameter 1.
pub struct Request {
    len: usize,
    data: Bytes,
    command: Range<usize>,
    arguments: Vec<Range<usize>>,
}

/// Walks over the received bytes.
///
/// Each read either yields a value, **None** if the buffer ends prematurely or an error for
/// malformed data.
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn expect(&mut self, marker: u8, what: &str) -> Result<Option<()>> {
        match self.data.get(self.offset) {
            None => Ok(None),
            Some(byte) if *byte == marker => {
                self.offset += 1;
                Ok(Some(()))
            }
            Some(_) => Err(anyhow!("Expected {} at position {}", what, self.offset)),
        }
    }

    fn read_number(&mut self) -> Result<Option<usize>> {
        let mut value = 0usize;
        let mut digits = 0;
        loop {
            match self.data.get(self.offset) {
                None => return Ok(None),
                Some(b'\r') if digits > 0 => {
                    return match self.data.get(self.offset + 1) {
                        None => Ok(None),
                        Some(b'\n') => {
                            self.offset += 2;
                            Ok(Some(value))
                        }
                        Some(_) => Err(anyhow!("Expected a LF at position {}", self.offset + 1)),
                    };
                }
                Some(digit @ b'0'..=b'9') if digits < MAX_DIGITS => {
                    value = value * 10 + (digit - b'0') as usize;
                    digits += 1;
                    self.offset += 1;
                }
                Some(_) => return Err(anyhow!("Malformed integer at position {}", self.offset)),
            }
        }
    }

    fn read_bulk_string(&mut self) -> Result<Option<Range<usize>>> {
        if self.expect(b'$', "a bulk string")?.is_none() {
            return Ok(None);
        }
        let length = match self.read_number()? {
            Some(length) => length,
            None => return Ok(None),
        };

        let start = self.offset;
        let end = start + length;
        if self.data.len() < end + 2 {
            return Ok(None);
        }
        if &self.data[end..end + 2] != b"\r\n" {
            return Err(anyhow!("Expected a CRLF at position {}", end));
        }

        self.offset = end + 2;
        Ok(Some(start..end))
    }
}

impl Request {
    /// Tries to parse a request from the start of the given buffer.
    ///
    /// Returns **Ok(None)** for a partial request and an error for malformed data. Any data
    /// behind the request (e.g. pipelined requests) is ignored, use [Request::len](Request::len)
    /// to skip over the parsed request.
    pub fn parse(data: &BytesMut) -> Result<Option<Request>> {
        // Every complete request ends with a CRLF, which is a cheap check for partial data...
        if data.len() < 4 || data[data.len() - 1] != b'\n' {
            return Ok(None);
        }

        let mut cursor = Cursor {
            data: &data[..],
            offset: 0,
        };
        if cursor.expect(b'*', "an array")?.is_none() {
            return Ok(None);
        }
        let count = match cursor.read_number()? {
            Some(0) => return Err(anyhow!("A request must contain at least a command")),
            Some(count) => count,
            None => return Ok(None),
        };

        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            match cursor.read_bulk_string()? {
                Some(range) => ranges.push(range),
                None => return Ok(None),
            }
        }

        let command = ranges.remove(0);
        std::str::from_utf8(&data[command.clone()]).context("The command must be valid UTF-8")?;

        Ok(Some(Request {
            len: cursor.offset,
            data: Bytes::copy_from_slice(&data[..cursor.offset]),
            command,
            arguments: ranges,
        }))
    }

    /// Creates a request from the given strings.
    ///
    /// This is intended for tests.
    ///
    /// ```
    /// # use fleetcache::request::Request;
    /// let request = Request::example(vec!["GROUP.LIST"]);
    /// assert_eq!(request.command(), "GROUP.LIST");
    /// assert_eq!(request.parameter_count(), 0);
    /// ```
    pub fn example(data: Vec<&str>) -> Request {
        let mut input = format!("*{}\r\n", data.len());
        for param in data {
            input.push_str(&format!("${}\r\n{}\r\n", param.len(), param));
        }

        Request::parse(&BytesMut::from(input.as_str()))
            .unwrap()
            .unwrap()
    }

    /// Returns the command of this request.
    pub fn command(&self) -> &str {
        // Validated during parsing...
        std::str::from_utf8(&self.data[self.command.clone()]).unwrap_or_default()
    }

    /// Returns the number of parameters (not counting the command).
    pub fn parameter_count(&self) -> usize {
        self.arguments.len()
    }

    fn range(&self, index: usize) -> Result<Range<usize>> {
        self.arguments.get(index).cloned().ok_or_else(|| {
            anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.arguments.len()
            )
        })
    }

    /// Returns the n-th parameter as raw bytes.
    pub fn parameter(&self, index: usize) -> Result<Bytes> {
        Ok(self.data.slice(self.range(index)?))
    }

    /// Returns the n-th parameter as UTF-8 string.
    pub fn str_parameter(&self, index: usize) -> Result<&str> {
        let range = self.range(index)?;
        std::str::from_utf8(&self.data[range.clone()]).with_context(|| {
            format!(
                "Failed to parse parameter {} ({}..{}) as UTF-8 string!",
                index, range.start, range.end
            )
        })
    }

    /// Returns the n-th parameter as integer.
    pub fn int_parameter(&self, index: usize) -> Result<i64> {
        let string = self.str_parameter(index)?;
        string.parse().with_context(|| {
            format!(
                "Failed to parse parameter {} ('{}') as integer!",
                index, string
            )
        })
    }

    /// Returns the number of bytes this request occupied in the input buffer.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}
