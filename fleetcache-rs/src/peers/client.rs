//! Fetches values from other nodes via RESP.
//!
//! A [RespPeer](RespPeer) sends `GROUP.FETCH <group> <key>` to the owning node and expects the
//! value as bulk string. Connections are kept in a small idle pool and re-used for subsequent
//! fetches. As a pooled connection might have been closed by the remote side in the meantime, a
//! fetch which fails on a re-used connection is retried once on a fresh one.
use std::fmt::{Display, Formatter};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::group::PeerFetcher;

/// Limits the number of idle connections kept per peer.
const MAX_IDLE_CONNECTIONS: usize = 16;

/// Limits the time spent to establish a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits the length of the first line of a reply (including its type marker).
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Limits the size of a bulk string sent by a peer.
const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;

/// Represents a reply sent by a RESP server.
#[derive(Debug, PartialEq)]
pub enum Reply {
    /// A simple string like `+OK`.
    Simple(String),
    /// An error like `-CLIENT: Unknown group: x`.
    Error(String),
    /// A number like `:42`.
    Number(i64),
    /// A bulk string.
    Bulk(Bytes),
    /// A null bulk string (`$-1`).
    Null,
}

impl Reply {
    /// Tries to parse a reply from the given data.
    ///
    /// Returns the reply along with the number of bytes it occupied or **None** if more data is
    /// required.
    ///
    /// ```
    /// # use fleetcache::peers::client::Reply;
    /// let (reply, len) = Reply::parse(b"$3\r\n630\r\n").unwrap().unwrap();
    /// assert_eq!(reply, Reply::Bulk(bytes::Bytes::from_static(b"630")));
    /// assert_eq!(len, 9);
    ///
    /// assert_eq!(Reply::parse(b"$3\r\n63").unwrap().is_none(), true);
    /// assert_eq!(Reply::parse(b"*1\r\n").is_err(), true);
    /// assert_eq!(Reply::parse(b"$9223372036854775807\r\nabc").is_err(), true);
    /// ```
    pub fn parse(data: &[u8]) -> anyhow::Result<Option<(Reply, usize)>> {
        let line_end = match data.windows(2).position(|window| window == b"\r\n") {
            Some(position) => position,
            None if data.len() > MAX_LINE_LENGTH => {
                return Err(anyhow!("Received a reply without a line break"))
            }
            None => return Ok(None),
        };
        if line_end == 0 {
            return Err(anyhow!("Received an empty reply"));
        }

        let line = std::str::from_utf8(&data[1..line_end]).context("Received a malformed reply")?;
        let header_len = line_end + 2;

        match data[0] {
            b'+' => Ok(Some((Reply::Simple(line.to_owned()), header_len))),
            b'-' => Ok(Some((Reply::Error(line.to_owned()), header_len))),
            b':' => {
                let number = line
                    .parse()
                    .with_context(|| format!("Received a malformed number: {}", line))?;
                Ok(Some((Reply::Number(number), header_len)))
            }
            b'$' => {
                let length: i64 = line
                    .parse()
                    .with_context(|| format!("Received a malformed bulk length: {}", line))?;
                if length < 0 {
                    return Ok(Some((Reply::Null, header_len)));
                }
                if length as u64 > MAX_BULK_LENGTH as u64 {
                    return Err(anyhow!("Received an oversized bulk string: {} bytes", length));
                }

                let end = header_len + length as usize;
                if data.len() < end + 2 {
                    return Ok(None);
                }
                if &data[end..end + 2] != b"\r\n" {
                    return Err(anyhow!("A bulk string is not terminated by a CRLF"));
                }

                Ok(Some((
                    Reply::Bulk(Bytes::copy_from_slice(&data[header_len..end])),
                    end + 2,
                )))
            }
            other => Err(anyhow!("Received an unexpected reply type: {}", other as char)),
        }
    }
}

/// Encodes the given arguments as RESP request.
fn encode_request(arguments: &[&str]) -> BytesMut {
    let mut request = BytesMut::with_capacity(
        16 + arguments
            .iter()
            .map(|argument| argument.len() + 16)
            .sum::<usize>(),
    );
    request.extend_from_slice(format!("*{}\r\n", arguments.len()).as_bytes());
    for argument in arguments {
        request.extend_from_slice(format!("${}\r\n", argument.len()).as_bytes());
        request.extend_from_slice(argument.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    request
}

/// Sends the given request and reads a single reply.
async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> anyhow::Result<Reply> {
    stream
        .write_all(request)
        .await
        .context("Failed to send the request")?;

    let mut buffer = BytesMut::with_capacity(8192);
    loop {
        if let Some((reply, len)) = Reply::parse(&buffer[..])? {
            if len != buffer.len() {
                return Err(anyhow!("Received unexpected data after the reply"));
            }
            return Ok(reply);
        }

        let bytes_read = stream
            .read_buf(&mut buffer)
            .await
            .context("Failed to read the reply")?;
        if bytes_read == 0 {
            return Err(anyhow!("The connection was closed by the peer"));
        }
    }
}

/// Fetches values from a single remote node.
pub struct RespPeer {
    address: String,
    idle: Mutex<Vec<TcpStream>>,
}

impl RespPeer {
    /// Creates a new client for the node reachable via the given address (host:port).
    ///
    /// No connection is established until the first fetch.
    pub fn new(address: impl Into<String>) -> Self {
        RespPeer {
            address: address.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Returns the address of the remote node.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> anyhow::Result<TcpStream> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| anyhow!("Timeout while connecting to {}", self.address))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        let _ = stream.set_nodelay(true);

        Ok(stream)
    }

    fn checkout(&self) -> Option<TcpStream> {
        self.idle.lock().unwrap().pop()
    }

    fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(stream);
        }
    }

    async fn request(&self, request: &[u8]) -> anyhow::Result<Reply> {
        if let Some(mut stream) = self.checkout() {
            match round_trip(&mut stream, request).await {
                Ok(reply) => {
                    self.checkin(stream);
                    return Ok(reply);
                }
                Err(error) => log::debug!(
                    "A pooled connection to {} failed ({:#}). Retrying with a new one...",
                    self.address,
                    error
                ),
            }
        }

        let mut stream = self.connect().await?;
        let reply = round_trip(&mut stream, request).await?;
        self.checkin(stream);

        Ok(reply)
    }
}

impl Display for RespPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[async_trait]
impl PeerFetcher for RespPeer {
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Bytes> {
        let request = encode_request(&["GROUP.FETCH", group, key]);
        match self.request(&request).await? {
            Reply::Bulk(data) => Ok(data),
            Reply::Error(message) => Err(anyhow!("{} reported: {}", self.address, message)),
            Reply::Null => Err(anyhow!("{} didn't provide a value", self.address)),
            other => Err(anyhow!("{} sent an unexpected reply: {:?}", self.address, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use crate::group::{loader_fn, PeerFetcher};
    use crate::groups::Groups;
    use crate::peers::client::{encode_request, Reply, RespPeer};
    use crate::server::Server;
    use crate::testing::test_async;
    use bytes::Bytes;

    #[test]
    fn replies_are_parsed() {
        assert_eq!(
            Reply::parse(b"+OK\r\n").unwrap(),
            Some((Reply::Simple("OK".to_owned()), 5))
        );
        assert_eq!(
            Reply::parse(b"-CLIENT: Unknown group: x\r\n").unwrap(),
            Some((Reply::Error("CLIENT: Unknown group: x".to_owned()), 27))
        );
        assert_eq!(
            Reply::parse(b":-42\r\n").unwrap(),
            Some((Reply::Number(-42), 6))
        );
        assert_eq!(Reply::parse(b"$-1\r\n").unwrap(), Some((Reply::Null, 5)));
        assert_eq!(
            Reply::parse(b"$0\r\n\r\n").unwrap(),
            Some((Reply::Bulk(Bytes::new()), 6))
        );
        assert_eq!(
            Reply::parse(b"$4\r\na\r\nb\r\n").unwrap(),
            Some((Reply::Bulk(Bytes::from_static(b"a\r\nb")), 10))
        );

        assert_eq!(Reply::parse(b"").unwrap(), None);
        assert_eq!(Reply::parse(b"$4\r\nab").unwrap(), None);
        assert_eq!(Reply::parse(b":x\r\n").is_err(), true);
        assert_eq!(Reply::parse(b"$2\r\nabc\r\n").is_err(), true);
    }

    #[test]
    fn oversized_replies_are_rejected() {
        assert_eq!(Reply::parse(b"$9223372036854775807\r\nabc").is_err(), true);
        assert_eq!(Reply::parse(b"$536870913\r\n").is_err(), true);
        assert_eq!(Reply::parse(b"$536870912\r\nabc").unwrap(), None);

        let endless_line = vec![b'+'; 64 * 1024 + 1];
        assert_eq!(Reply::parse(&endless_line).is_err(), true);
        assert_eq!(Reply::parse(&endless_line[..1024]).unwrap(), None);
    }

    #[test]
    fn requests_are_encoded() {
        assert_eq!(
            &encode_request(&["GROUP.FETCH", "scores", "Tom"])[..],
            b"*3\r\n$11\r\nGROUP.FETCH\r\n$6\r\nscores\r\n$3\r\nTom\r\n"
        );
    }

    #[test]
    fn unreachable_peers_are_reported() {
        test_async(async {
            let peer = RespPeer::new("127.0.0.1:1");
            assert_eq!(peer.fetch("scores", "Tom").await.is_err(), true);
            assert_eq!(peer.to_string(), "127.0.0.1:1");
        });
    }

    #[test]
    fn values_are_fetched_from_a_server() {
        // We want exclusive access to port 1503 on which we fire up a test-server...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_commands()
                .enable_server()
                .enable_groups()
                .build()
                .await;
            platform
                .require::<Config>()
                .load_from_string(
                    "
                server:
                    port: 1503
            ",
                    None,
                )
                .unwrap();
            let _ = platform.require::<Groups>().create(
                "scores",
                loader_fn(|key: String| async move {
                    match key.as_str() {
                        "Tom" => Ok(b"630".to_vec()),
                        _ => Err(anyhow::anyhow!("{} not exist", key)),
                    }
                }),
            );
            Server::fork_and_await(&platform.require::<Server>()).await;

            let peer = RespPeer::new("127.0.0.1:1503");
            assert_eq!(&peer.fetch("scores", "Tom").await.unwrap()[..], b"630");
            // The second fetch re-uses the pooled connection...
            assert_eq!(&peer.fetch("scores", "Tom").await.unwrap()[..], b"630");
            assert_eq!(peer.idle.lock().unwrap().len(), 1);

            let error = peer.fetch("scores", "Unknown").await.unwrap_err();
            assert_eq!(error.to_string().contains("Unknown not exist"), true);
            let error = peer.fetch("missing", "Tom").await.unwrap_err();
            assert_eq!(error.to_string().contains("Unknown group: missing"), true);

            platform.terminate();
        });
    }
}
