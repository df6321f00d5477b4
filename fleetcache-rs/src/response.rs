//! Builds RESP responses in memory.
//!
//! The whole response is rendered into a single buffer so that it can be written onto the socket
//! with one call. The buffer starts at 8 kB and grows in 8 kB blocks, which is plenty for the
//! diagnostic commands. Cached values are copied in once via [Response::bulk_bytes].
//!
//! The response tracks how many elements are still expected, so that an array with too few or
//! too many items is detected before anything is sent.
//!
//! # Example
//!
//! ```
//! # use fleetcache::response::{OutputError, Response};
//! # fn main() -> Result<(), OutputError> {
//! let mut response = Response::new();
//! response.array(2)?;
//! response.simple("scores")?;
//! response.number(42)?;
//! assert_eq!(response.complete_string()?, "*2\r\n+scores\r\n:42\r\n");
//! # Ok(())
//! # }
//! ```
use std::error::Error;
use std::fmt::{Display, Formatter, Write};

use anyhow::anyhow;
use bytes::{BufMut, BytesMut};

/// Determines the size of the blocks in which the buffer is allocated.
const BLOCK_SIZE: usize = 8192;

/// Enumerates the possible errors when creating a response.
#[derive(Debug)]
pub enum OutputError {
    /// Represents a formatting error while rendering into the buffer.
    IOError(std::fmt::Error),

    /// Represents an invalid structure like an array with a wrong number of elements.
    ProtocolError(anyhow::Error),
}

impl From<std::fmt::Error> for OutputError {
    fn from(err: std::fmt::Error) -> OutputError {
        OutputError::IOError(err)
    }
}

impl From<anyhow::Error> for OutputError {
    fn from(err: anyhow::Error) -> OutputError {
        OutputError::ProtocolError(err)
    }
}

impl Display for OutputError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OutputError::IOError(e) => write!(f, "IO error: {}", e),
            OutputError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl Error for OutputError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OutputError::IOError(e) => Some(e),
            OutputError::ProtocolError(_) => None,
        }
    }
}

/// Represents the result type of all output operations.
pub type OutputResult = std::result::Result<(), OutputError>;

/// Separates the sections of the tables rendered by the diagnostic commands.
pub static SEPARATOR: &str =
    "-------------------------------------------------------------------------------\n";

/// Represents a RESP response being built.
pub struct Response {
    buffer: BytesMut,
    pending: Vec<i32>,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    /// Creates a new response which expects exactly one element.
    ///
    /// Use [Response::array] to emit several elements.
    pub fn new() -> Self {
        Response {
            buffer: BytesMut::with_capacity(BLOCK_SIZE),
            pending: vec![1],
        }
    }

    /// Accounts for the next element and ensures that it is still expected.
    fn begin_element(&mut self, expected_length: usize) -> OutputResult {
        match self.pending.last_mut() {
            Some(remaining) if *remaining > 1 => *remaining -= 1,
            Some(_) => {
                let _ = self.pending.pop();
            }
            None => return Err(OutputError::ProtocolError(anyhow!("Invalid result nesting!"))),
        }

        if self.buffer.capacity() - self.buffer.len() < expected_length {
            self.buffer
                .reserve((expected_length / BLOCK_SIZE + 1) * BLOCK_SIZE);
        }

        Ok(())
    }

    /// Completes the response and returns the rendered bytes.
    ///
    /// Fails if an array is still missing elements.
    pub fn complete(self) -> Result<BytesMut, OutputError> {
        if !self.pending.is_empty() {
            return Err(OutputError::ProtocolError(anyhow!("Invalid result nesting!")));
        }

        Ok(self.buffer)
    }

    /// Completes the response and returns it as string.
    ///
    /// This is intended for tests and fails for binary data.
    pub fn complete_string(self) -> Result<String, OutputError> {
        let buffer = self.complete()?;
        String::from_utf8(buffer.to_vec())
            .map_err(|_| OutputError::ProtocolError(anyhow!("Non UTF-8 data found")))
    }

    /// Starts an array which has to be followed by exactly the given number of elements.
    ///
    /// ```should_panic
    /// # use fleetcache::response::Response;
    /// let mut response = Response::new();
    /// response.array(3).unwrap();
    /// response.simple("Hello").unwrap();
    ///
    /// // Two elements are still missing...
    /// response.complete_string().unwrap();
    /// ```
    pub fn array(&mut self, items: i32) -> OutputResult {
        self.begin_element(16)?;
        if items > 0 {
            self.pending.push(items);
        }
        write!(self.buffer, "*{}\r\n", items)?;

        Ok(())
    }

    /// Emits "OK" as simple string.
    pub fn ok(&mut self) -> OutputResult {
        self.simple("OK")
    }

    /// Emits the given number.
    ///
    /// ```
    /// # use fleetcache::response::Response;
    /// let mut response = Response::new();
    /// response.number(-7).unwrap();
    /// assert_eq!(response.complete_string().unwrap(), ":-7\r\n");
    /// ```
    pub fn number(&mut self, number: i64) -> OutputResult {
        self.begin_element(24)?;
        write!(self.buffer, ":{}\r\n", number)?;

        Ok(())
    }

    /// Emits "1" for **true** and "0" for **false**.
    pub fn boolean(&mut self, boolean: bool) -> OutputResult {
        self.number(if boolean { 1 } else { 0 })
    }

    /// Emits a simple string.
    ///
    /// Simple strings must not contain line breaks, which isn't checked here. When in doubt use
    /// [Response::bulk].
    pub fn simple(&mut self, string: impl AsRef<str>) -> OutputResult {
        let string = string.as_ref();
        self.begin_element(string.len() + 3)?;
        self.buffer.put_u8(b'+');
        self.buffer.put_slice(string.as_bytes());
        self.buffer.put_slice(b"\r\n");

        Ok(())
    }

    /// Emits the given string as bulk string.
    ///
    /// ```
    /// # use fleetcache::response::Response;
    /// let mut response = Response::new();
    /// response.bulk("Hello\nWorld").unwrap();
    /// assert_eq!(response.complete_string().unwrap(), "$11\r\nHello\nWorld\r\n");
    /// ```
    pub fn bulk(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.bulk_bytes(string.as_ref().as_bytes())
    }

    /// Emits arbitrary binary data as bulk string.
    pub fn bulk_bytes(&mut self, data: &[u8]) -> OutputResult {
        self.begin_element(data.len() + 24)?;
        write!(self.buffer, "${}\r\n", data.len())?;
        self.buffer.put_slice(data);
        self.buffer.put_slice(b"\r\n");

        Ok(())
    }

    /// Emits a null bulk string.
    pub fn null(&mut self) -> OutputResult {
        self.begin_element(5)?;
        self.buffer.put_slice(b"$-1\r\n");

        Ok(())
    }

    /// Emits an error.
    ///
    /// Line breaks are replaced by spaces, as RESP errors are single line.
    ///
    /// ```
    /// # use fleetcache::response::Response;
    /// let mut response = Response::new();
    /// response.error("CLIENT: Good bye,\ncruel World").unwrap();
    /// assert_eq!(response.complete_string().unwrap(), "-CLIENT: Good bye, cruel World\r\n");
    /// ```
    pub fn error(&mut self, string: impl AsRef<str>) -> OutputResult {
        let message = string.as_ref().replace(['\r', '\n'], " ");
        self.begin_element(message.len() + 3)?;
        self.buffer.put_u8(b'-');
        self.buffer.put_slice(message.as_bytes());
        self.buffer.put_slice(b"\r\n");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::request::Request;
    use crate::response::Response;

    #[test]
    fn an_array_of_bulk_strings_can_be_read_by_request() {
        let mut response = Response::new();
        response.array(3).unwrap();
        response.bulk("GROUP.GET").unwrap();
        response.bulk("scores").unwrap();
        response.bulk_bytes(b"Tom").unwrap();

        let buffer = response.complete().unwrap();
        let request = Request::parse(&buffer).unwrap().unwrap();
        assert_eq!(request.command(), "GROUP.GET");
        assert_eq!(request.parameter_count(), 2);
        assert_eq!(request.str_parameter(0).unwrap(), "scores");
        assert_eq!(request.str_parameter(1).unwrap(), "Tom");
    }

    #[test]
    fn binary_data_is_emitted_verbatim() {
        let mut response = Response::new();
        response.bulk_bytes(&[0, 255, b'\r', b'\n']).unwrap();

        assert_eq!(
            &response.complete().unwrap()[..],
            b"$4\r\n\x00\xff\r\n\r\n"
        );
    }

    #[test]
    fn incorrect_nesting_is_detected() {
        {
            let mut response = Response::new();
            response.array(2).unwrap();
            response.ok().unwrap();
            assert_eq!(response.complete().is_err(), true);
        }
        {
            let mut response = Response::new();
            response.ok().unwrap();
            assert_eq!(response.ok().is_err(), true);
        }
        {
            let mut response = Response::new();
            response.array(1).unwrap();
            response.null().unwrap();
            assert_eq!(response.ok().is_err(), true);
        }
        {
            let mut response = Response::new();
            response.array(0).unwrap();
            assert_eq!(response.complete_string().unwrap(), "*0\r\n");
        }
    }

    #[test]
    fn large_responses_grow_the_buffer() {
        let many_x = "X".repeat(16_000);
        let many_y = "Y".repeat(16_000);

        let mut response = Response::new();
        response.array(2).unwrap();
        response.simple(many_x.as_str()).unwrap();
        response.bulk(many_y.as_str()).unwrap();

        assert_eq!(
            response.complete_string().unwrap(),
            format!("*2\r\n+{}\r\n$16000\r\n{}\r\n", many_x, many_y)
        );
    }
}
