//! Dispatches incoming RESP requests to the actors which implement the commands.
//!
//! A [CommandDictionary](CommandDictionary) maps each command name to a [Queue](Queue) and a
//! numeric token. Once a request for a known command arrives, it is wrapped into a [Call](Call)
//! along with a pre-initialized [Response](crate::response::Response) and sent to the actor
//! listening on the queue. The actor fills the response and hands it back via
//! [Call::complete](Call::complete) (or [ResultExt::complete](ResultExt::complete)).
//!
//! As all commands of an actor share a single queue, the actor processes one call at a time. The
//! cache groups, the peer pool and the core commands each run such an actor. Commands which
//! might take a while (like **GROUP.GET** which might invoke a loader) move the call into a
//! separate task so that the actor isn't blocked.
//!
//! Each client connection obtains a [Dispatcher](Dispatcher), which is a read-only snapshot of
//! the dictionary and therefore requires no locking per request.
//!
//! # Errors
//!
//! Command handlers return a [CommandResult](CommandResult). Use [client_error](client_error)
//! if the request was malformed or referred to unknown data and [server_error](server_error) if
//! the node itself failed. An **anyhow::Error** converts into a client error.
//!
//! # Example
//!
//! ```
//! # use num_derive::FromPrimitive;
//! # use num_traits::FromPrimitive;
//! # use fleetcache::commands::{queue, Call, CommandDictionary, CommandResult, ResultExt};
//! # use fleetcache::request::Request;
//! fn echo(call: &mut Call) -> CommandResult {
//!     let text = call.request.str_parameter(0)?;
//!     call.response.bulk(text)?;
//!     Ok(())
//! }
//!
//! fn version(call: &mut Call) -> CommandResult {
//!     call.response.simple("1.0")?;
//!     Ok(())
//! }
//!
//! #[derive(FromPrimitive)]
//! enum DemoCommands {
//!     Echo,
//!     Version,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (queue, mut endpoint) = queue();
//!     tokio::spawn(async move {
//!         while let Some(mut call) = endpoint.recv().await {
//!             match DemoCommands::from_usize(call.token) {
//!                 Some(DemoCommands::Echo) => echo(&mut call).complete(call),
//!                 Some(DemoCommands::Version) => version(&mut call).complete(call),
//!                 _ => call.handle_unknown_token(),
//!             }
//!         }
//!     });
//!
//!     let commands = CommandDictionary::new();
//!     commands.register_command("DEMO.ECHO", queue.clone(), DemoCommands::Echo as usize);
//!     commands.register_command("DEMO.VERSION", queue, DemoCommands::Version as usize);
//!     let mut dispatcher = commands.dispatcher();
//!
//!     let result = dispatcher
//!         .invoke(Request::example(vec!["DEMO.ECHO", "Hello"]), None)
//!         .await
//!         .unwrap();
//!     assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$5\r\nHello\r\n");
//!
//!     // A missing parameter is reported as client error...
//!     let result = dispatcher
//!         .invoke(Request::example(vec!["DEMO.ECHO"]), None)
//!         .await
//!         .unwrap();
//!     assert_eq!(std::str::from_utf8(&result[..]).unwrap().starts_with("-CLIENT: "), true);
//! }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use bytes::BytesMut;

use crate::average::Average;
use crate::platform::Platform;
use crate::request::Request;
use crate::response::{OutputError, Response};
use crate::server::Connection;

/// Represents an error when executing a command.
///
/// An **OutputError** indicates that the response could not be written and that the connection
/// should be closed. A **ClientError** blames the request, a **ServerError** the node itself.
#[derive(Debug)]
pub enum CommandError {
    /// The response could not be written.
    OutputError(OutputError),
    /// The request was malformed or referenced unknown data.
    ClientError(anyhow::Error),
    /// The node failed to handle a valid request.
    ServerError(anyhow::Error),
}

/// Creates a **CommandError** which represents a **ServerError**.
///
/// # Example
///
/// ```
/// use fleetcache::commands::{Call, CommandResult};
/// fn broken(call: &mut Call) -> CommandResult {
///     Err(fleetcache::server_error!("The backend of {} is down", "scores"))
/// }
/// ```
#[macro_export]
macro_rules! server_error {
    ($err:expr $(,)?) => ({
        $crate::commands::CommandError::ServerError(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::commands::CommandError::ServerError(anyhow::anyhow!($fmt, $($arg)*))
    };
}

/// Creates a **CommandError** which represents a **ClientError**.
///
/// # Example
///
/// ```
/// use fleetcache::commands::{Call, CommandResult};
/// fn strict(call: &mut Call) -> CommandResult {
///     if call.request.parameter_count() != 2 {
///         Err(fleetcache::client_error!(
///             "Expected a group and a key but got {} parameter(s)",
///             call.request.parameter_count()
///         ))
///     } else {
///         call.response.ok()?;
///         Ok(())
///     }
/// }
/// ```
#[macro_export]
macro_rules! client_error {
    ($err:expr $(,)?) => ({
        $crate::commands::CommandError::ClientError(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::commands::CommandError::ClientError(anyhow::anyhow!($fmt, $($arg)*))
    };
}

impl From<OutputError> for CommandError {
    fn from(output_error: OutputError) -> Self {
        CommandError::OutputError(output_error)
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(error: anyhow::Error) -> Self {
        CommandError::ClientError(error)
    }
}

/// Represents the result of a command handler.
///
/// The actual payload has already been written into the response of the call.
pub type CommandResult = std::result::Result<(), CommandError>;

/// Permits to write `handler(&mut call).complete(call)` instead of
/// `let result = handler(&mut call); call.complete(result)`.
pub trait ResultExt {
    /// Completes the given call with this result.
    fn complete(self, call: Call);
}

impl ResultExt for CommandResult {
    fn complete(self, call: Call) {
        call.complete(self);
    }
}

/// Represents a single invocation of a command which is sent to the handling actor.
pub struct Call {
    /// Contains the request as sent by the client.
    pub request: Request,

    /// Contains the response to fill.
    pub response: Response,

    /// Contains the token the command was registered with.
    pub token: usize,

    callback: tokio::sync::oneshot::Sender<Result<BytesMut, OutputError>>,
}

impl Call {
    /// Marks the call as handled and sends the response back to the connection.
    ///
    /// Client and server errors are rendered as RESP errors prefixed with **CLIENT:** or
    /// **SERVER:**. An output error is passed back as is, so that the connection is closed.
    pub fn complete(mut self, result: CommandResult) {
        let result = match result {
            Ok(_) => self.response.complete(),
            Err(CommandError::OutputError(error)) => Err(error),
            Err(CommandError::ClientError(error)) => {
                Call::render_error(self.response, "CLIENT", error)
            }
            Err(CommandError::ServerError(error)) => {
                Call::render_error(self.response, "SERVER", error)
            }
        };

        if self.callback.send(result).is_err() {
            log::error!("Failed to submit a result to a oneshot callback channel!");
        }
    }

    fn render_error(
        mut response: Response,
        prefix: &str,
        error: anyhow::Error,
    ) -> Result<BytesMut, OutputError> {
        let message = format!("{}: {:#}", prefix, error).replace(['\r', '\n'], " ");
        response.error(message)?;
        response.complete()
    }

    /// Completes the call with a server error as its token isn't known to the actor.
    pub fn handle_unknown_token(self) {
        let token = self.token;
        self.complete(Err(CommandError::ServerError(anyhow!(
            "Unknown token received: {}!",
            token
        ))));
    }
}

/// Represents the sending side of an actor's queue.
pub type Queue = tokio::sync::mpsc::Sender<Call>;

/// Represents the receiving side of an actor's queue.
pub type Endpoint = tokio::sync::mpsc::Receiver<Call>;

/// Creates a new queue to connect an actor to the [CommandDictionary](CommandDictionary).
///
/// The queue is bounded (1024 calls), so that an overloaded actor applies back pressure instead of
/// exhausting the memory.
pub fn queue() -> (Queue, Endpoint) {
    tokio::sync::mpsc::channel(1024)
}

/// Represents a registered command along with its utilization metrics.
pub struct Command {
    /// Contains the name of the command.
    pub name: &'static str,
    queue: Queue,
    token: usize,
    call_metrics: Average,
}

impl Command {
    /// Returns the number of invocations of this command.
    pub fn call_count(&self) -> u64 {
        self.call_metrics.count()
    }

    /// Returns the average call duration in microseconds.
    pub fn avg_duration(&self) -> u64 {
        self.call_metrics.avg()
    }
}

/// Keeps track of all known commands and their queues.
#[derive(Default)]
pub struct CommandDictionary {
    commands: Mutex<HashMap<&'static str, Arc<Command>>>,
}

/// Provides a read-only snapshot of a [CommandDictionary](CommandDictionary) which dispatches
/// requests without any locking.
pub struct Dispatcher {
    commands: HashMap<&'static str, (Arc<Command>, Queue)>,
}

impl CommandDictionary {
    /// Creates a new and empty dictionary.
    pub fn new() -> Self {
        CommandDictionary {
            commands: Mutex::new(HashMap::default()),
        }
    }

    /// Creates and installs a dictionary into the given **Platform**.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let commands = Arc::new(CommandDictionary::new());
        platform.register::<CommandDictionary>(commands.clone());

        commands
    }

    /// Registers a command which is dispatched into the given queue along with the given token.
    ///
    /// A command which is already registered is kept and an error is logged.
    pub fn register_command(&self, name: &'static str, queue: Queue, token: usize) {
        let mut commands = self.commands.lock().unwrap();
        if commands.contains_key(name) {
            log::error!(
                "Not going to register command {} as there is already a command present for this name",
                name
            );
        } else {
            log::debug!("Registering command {}...", name);
            let _ = commands.insert(
                name,
                Arc::new(Command {
                    name,
                    queue,
                    token,
                    call_metrics: Average::new(),
                }),
            );
        }
    }

    /// Lists all known commands.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.commands.lock().unwrap().values().cloned().collect()
    }

    /// Creates a dispatcher for the currently known commands.
    pub fn dispatcher(&self) -> Dispatcher {
        let commands = self.commands.lock().unwrap();

        Dispatcher {
            commands: commands
                .values()
                .map(|command| (command.name, (command.clone(), command.queue.clone())))
                .collect(),
        }
    }
}

impl Dispatcher {
    /// Dispatches the given request and returns the RESP encoded response.
    ///
    /// Application level errors are already rendered into the response. An error returned here
    /// indicates that the connection is in an inconsistent state and should be closed.
    ///
    /// The connection is only required by the built-in commands **QUIT** and **CLIENT** and can
    /// be omitted in tests.
    ///
    /// # Example
    ///
    /// ```
    /// # use fleetcache::builder::Builder;
    /// # use fleetcache::request::Request;
    /// # use fleetcache::commands::CommandDictionary;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let platform = Builder::new()
    ///     .enable_server()
    ///     .enable_commands()
    ///     .enable_core_commands()
    ///     .build()
    ///     .await;
    ///
    /// let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
    ///
    /// let result = dispatcher.invoke(Request::example(vec!["SYS.COMMANDS"]), None).await;
    /// assert_eq!(result.is_ok(), true);
    ///
    /// let result = dispatcher.invoke(Request::example(vec!["PING"]), None).await.unwrap();
    /// assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "+PONG\r\n");
    /// # }
    /// ```
    pub async fn invoke(
        &mut self,
        request: Request,
        connection: Option<&Arc<Connection>>,
    ) -> Result<BytesMut, OutputError> {
        let response = Response::new();
        match self.commands.get_mut(request.command()) {
            Some((command, queue)) => {
                Dispatcher::invoke_command(command, queue, request, response).await
            }
            None => Dispatcher::handle_built_in(request, response, connection),
        }
    }

    /// Emulates the Redis commands most clients send on their own:
    /// * **QUIT**: terminates the connection
    /// * **CLIENT SETNAME**: stores the name of the client
    /// * **PING**: replies with PONG or echoes the first parameter
    fn handle_built_in(
        request: Request,
        mut response: Response,
        connection: Option<&Arc<Connection>>,
    ) -> Result<BytesMut, OutputError> {
        match request.command().to_uppercase().as_str() {
            "QUIT" => {
                if let Some(connection) = connection {
                    connection.quit();
                }
                response.ok()?;
            }
            "CLIENT" => {
                if request.str_parameter(0)?.eq_ignore_ascii_case("SETNAME") {
                    if let Some(connection) = connection {
                        connection.set_name(request.str_parameter(1)?);
                    }
                }
                response.ok()?;
            }
            "PING" => {
                if request.parameter_count() > 0 {
                    response.bulk(request.str_parameter(0)?)?;
                } else {
                    response.simple("PONG")?;
                }
            }
            _ => response.error(format!("CLIENT: Unknown command: {}", request.command()))?,
        }

        response.complete()
    }

    async fn invoke_command(
        command: &Arc<Command>,
        queue: &mut Queue,
        request: Request,
        response: Response,
    ) -> Result<BytesMut, OutputError> {
        let (callback, promise) = tokio::sync::oneshot::channel();
        let call = Call {
            request,
            response,
            callback,
            token: command.token,
        };

        let watch = Instant::now();
        if queue.send(call).await.is_err() {
            return Err(OutputError::ProtocolError(anyhow!(
                "Failed to submit command into queue!"
            )));
        }

        match promise.await {
            Ok(result) => {
                command
                    .call_metrics
                    .add(watch.elapsed().as_micros() as u64);
                result
            }
            Err(_) => Err(OutputError::ProtocolError(anyhow!(
                "Command {} did not yield any result!",
                command.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::{queue, CommandDictionary};
    use crate::request::Request;

    #[test]
    fn built_in_commands_work_without_a_connection() {
        crate::testing::test_async(async {
            let mut dispatcher = CommandDictionary::new().dispatcher();

            let result = dispatcher
                .invoke(Request::example(vec!["PING", "fleet"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$5\r\nfleet\r\n");

            let result = dispatcher
                .invoke(Request::example(vec!["CLIENT", "SETNAME", "peer"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "+OK\r\n");

            let result = dispatcher
                .invoke(Request::example(vec!["UNKNOWN.COMMAND"]), None)
                .await
                .unwrap();
            assert_eq!(
                std::str::from_utf8(&result[..]).unwrap(),
                "-CLIENT: Unknown command: UNKNOWN.COMMAND\r\n"
            );
        });
    }

    #[test]
    fn errors_are_rendered_with_their_origin() {
        crate::testing::test_async(async {
            let (queue, mut endpoint) = queue();
            crate::spawn!(async move {
                while let Some(call) = endpoint.recv().await {
                    match call.token {
                        0 => call.complete(Err(crate::client_error!("bad\r\nrequest"))),
                        _ => call.complete(Err(crate::server_error!("broken"))),
                    }
                }
            });

            let commands = CommandDictionary::new();
            commands.register_command("TEST.CLIENT", queue.clone(), 0);
            commands.register_command("TEST.SERVER", queue.clone(), 1);
            // Duplicate registrations are ignored...
            commands.register_command("TEST.SERVER", queue, 0);
            let mut dispatcher = commands.dispatcher();

            let result = dispatcher
                .invoke(Request::example(vec!["TEST.CLIENT"]), None)
                .await
                .unwrap();
            assert_eq!(
                std::str::from_utf8(&result[..]).unwrap(),
                "-CLIENT: bad  request\r\n"
            );

            let result = dispatcher
                .invoke(Request::example(vec!["TEST.SERVER"]), None)
                .await
                .unwrap();
            assert_eq!(
                std::str::from_utf8(&result[..]).unwrap(),
                "-SERVER: broken\r\n"
            );

            let server_command = commands
                .commands()
                .into_iter()
                .find(|command| command.name == "TEST.SERVER")
                .unwrap();
            assert_eq!(server_command.call_count(), 1);
        });
    }
}
