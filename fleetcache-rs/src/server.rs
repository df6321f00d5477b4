//! Contains the RESP server of a fleetcache node.
//!
//! The server serves two kinds of clients: other peers which fetch values of the keys owned by
//! this node via `GROUP.FETCH` and administrators (or any Redis client) which use the diagnostic
//! commands.
//!
//! The socket is bound to **server.host** (default 0.0.0.0) and **server.port** (default 2410)
//! as given in the config. If the port is occupied, binding is retried every 500ms. This permits
//! to start a new node while the old one is still draining. Once the config changes and the
//! address differs, the server socket is re-created for the new address.
//!
//! # Example
//!
//! ```no_run
//! use fleetcache::builder::Builder;
//! use fleetcache::config::Config;
//! use fleetcache::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None).unwrap();
//!
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::average::Average;
use crate::commands::CommandDictionary;
use crate::config::{wait_for_change, Config};
use crate::platform::Platform;
use crate::request::Request;
use crate::response::OutputError;
use crate::spawn;

/// Determines how long to wait for incoming data or connections before re-checking if the
/// platform (or the connection) is still active.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Determines the initial size of the receive buffer of a connection. Larger requests grow the
/// buffer, which is shrunk back once the request has been handled.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Contains the port used if none is configured.
pub const DEFAULT_PORT: u16 = 2410;

/// Represents a client connection.
pub struct Connection {
    peer_address: String,
    active: AtomicBool,
    commands: Average,
    name: ArcSwap<Option<String>>,
}

impl Connection {
    fn new(peer_address: String) -> Self {
        Connection {
            peer_address,
            active: AtomicBool::new(true),
            commands: Average::new(),
            name: ArcSwap::new(Arc::new(None)),
        }
    }

    /// Determines if the connection is active or if a termination has been requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Terminates the connection once the current command has been handled.
    pub fn quit(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Stores the name of the connected client (as sent via `CLIENT SETNAME`).
    pub fn set_name(&self, name: &str) {
        self.name.store(Arc::new(Some(name.to_owned())));
    }

    /// Returns the name of the connected client, if known.
    pub fn name(&self) -> Option<String> {
        self.name.load().as_ref().clone()
    }
}

/// Provides a snapshot of the metadata of a client connection.
pub struct ConnectionInfo {
    /// Contains the remote address of the client.
    pub peer_address: String,

    /// Contains the name of the client or an empty string.
    pub client: String,

    /// Contains the number of commands received along with their average duration.
    pub commands: Average,
}

/// Manages the server socket and all client connections.
pub struct Server {
    rebind: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// This doesn't open the server socket yet. This is done by
    /// [event_loop](Server::event_loop), which is most probably run by the main task.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            rebind: AtomicBool::new(true),
            current_address: Mutex::new(None),
            platform: platform.clone(),
            connections: Mutex::new(Vec::new()),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Lists all currently open connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|connection| ConnectionInfo {
                peer_address: connection.peer_address.clone(),
                client: connection.name().unwrap_or_default(),
                commands: connection.commands.clone(),
            })
            .collect()
    }

    /// Terminates the connection of the given remote address.
    ///
    /// Returns **false** if no such connection is known.
    pub fn kill(&self, peer_address: &str) -> bool {
        match self
            .connections
            .lock()
            .unwrap()
            .iter()
            .find(|connection| connection.peer_address == peer_address)
        {
            Some(connection) => {
                connection.quit();
                true
            }
            None => false,
        }
    }

    /// Returns the address the server socket is currently bound to.
    pub fn current_address(&self) -> Option<String> {
        self.current_address.lock().unwrap().clone()
    }

    fn remove_connection(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, connection));
    }

    /// Determines the address to bind to based on the current configuration.
    fn address(&self) -> String {
        let (host, port) = match self.platform.find::<Config>() {
            Some(config) => {
                let handle = config.current();
                (
                    handle
                        .query("server.host")
                        .as_str()
                        .unwrap_or("0.0.0.0")
                        .to_owned(),
                    handle
                        .query("server.port")
                        .as_i64()
                        .and_then(|port| u16::try_from(port).ok())
                        .filter(|port| *port > 0)
                        .unwrap_or(DEFAULT_PORT),
                )
            }
            None => ("0.0.0.0".to_owned(), DEFAULT_PORT),
        };

        format!("{}:{}", host, port)
    }

    /// Starts the event loop in a separate task.
    pub fn fork(server: &Arc<Server>) {
        let server = server.clone();
        spawn!(async move {
            server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the server socket is bound.
    ///
    /// This is intended to be used by tests.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Binds the server socket and serves incoming connections until the platform terminates.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported: Option<Instant> = None;

        while self.platform.is_running() {
            if self.rebind.swap(false, Ordering::AcqRel) {
                address = self.address();
            }

            match TcpListener::bind(&address).await {
                Ok(listener) => {
                    log::info!("Opened server socket on {}...", &address);
                    *self.current_address.lock().unwrap() = Some(address.clone());
                    self.server_loop(&listener).await;
                    *self.current_address.lock().unwrap() = None;
                    log::info!("Closing server socket on {}.", &address);
                }
                Err(error) => {
                    // Only report every 5s, as we retry every 500ms...
                    if last_bind_error_reported
                        .map(|reported| reported.elapsed().as_secs() >= 5)
                        .unwrap_or(true)
                    {
                        log::error!(
                            "Cannot open server address {}: {}. Retrying every 500ms...",
                            &address,
                            error
                        );
                        last_bind_error_reported = Some(Instant::now());
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Accepts incoming connections until the platform terminates or the address changes.
    async fn server_loop(&self, listener: &TcpListener) {
        let mut config_changed = self
            .platform
            .find::<Config>()
            .map(|config| config.notifier());

        while self.platform.is_running() {
            tokio::select! {
                accepted = tokio::time::timeout(POLL_INTERVAL, listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, _))) => self.handle_new_connection(stream),
                        Ok(Err(error)) => {
                            log::error!("Failed to accept a connection: {}", error);
                            return;
                        }
                        Err(_) => (),
                    }
                }
                _ = wait_for_change(&mut config_changed) => {
                    if self.current_address().as_deref() != Some(self.address().as_str()) {
                        log::info!("Server address has changed. Restarting server socket...");
                        self.rebind.store(true, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }

    /// Registers the new connection and forks a task which serves it.
    fn handle_new_connection(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let connection = Arc::new(Connection::new(
            stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned()),
        ));
        self.connections.lock().unwrap().push(connection.clone());

        let platform = self.platform.clone();
        spawn!(async move {
            log::debug!("Opened connection from {}...", connection.peer_address);
            if let Err(error) = resp_protocol_loop(&platform, &connection, stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    connection.peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", connection.peer_address);
            if let Some(server) = platform.find::<Server>() {
                server.remove_connection(&connection);
            }
        });
    }
}

/// Reads, dispatches and answers RESP requests of a single client.
async fn resp_protocol_loop(
    platform: &Arc<Platform>,
    connection: &Arc<Connection>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while platform.is_running() && connection.is_active() {
        let bytes_read =
            match tokio::time::timeout(POLL_INTERVAL, reader.read_buf(&mut input_buffer)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(bytes_read)) => bytes_read,
                Ok(Err(error)) => {
                    return Err(anyhow::anyhow!(
                        "An error occurred while reading from the client: {}",
                        error
                    ))
                }
                Err(_) => continue,
            };
        log::trace!("Read {} bytes from {}", bytes_read, connection.peer_address);

        // A single read might contain several pipelined requests...
        loop {
            let request = match Request::parse(&input_buffer) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(error) => return report_malformed_request(error, &mut writer).await,
            };

            let request_len = request.len();
            let watch = Instant::now();
            match dispatcher.invoke(request, Some(connection)).await {
                Ok(response) => {
                    connection
                        .commands
                        .add(watch.elapsed().as_micros() as u64);
                    writer.write_all(response.as_ref()).await?;
                }
                Err(error) => return report_output_error(error, &mut writer).await,
            }

            input_buffer.advance(request_len);
        }
        writer.flush().await?;

        if input_buffer.is_empty() && input_buffer.capacity() > DEFAULT_BUFFER_SIZE {
            input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        }
    }

    Ok(())
}

/// Reports an **OutputError** and signals the caller to close the connection.
///
/// Output errors are the only errors which escalate up to here. They indicate that the
/// connection might be in an inconsistent state. If it is still possible, we notify the client.
async fn report_output_error(error: OutputError, writer: &mut WriteHalf<'_>) -> anyhow::Result<()> {
    if let OutputError::ProtocolError(error) = error {
        let message = error.to_string().replace(['\r', '\n'], " ");
        writer
            .write_all(format!("-SERVER: {}\r\n", message).as_bytes())
            .await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn report_malformed_request(
    error: anyhow::Error,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    let message = error.to_string().replace(['\r', '\n'], " ");
    writer
        .write_all(format!("-CLIENT: A malformed RESP request was received: {}\r\n", message).as_bytes())
        .await?;
    writer.flush().await?;

    Ok(())
}
