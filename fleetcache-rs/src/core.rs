//! Provides the maintenance commands of a node.
//!
//! * **SYS.COMMANDS**: Lists all known commands along with their call count and average duration.
//! * **SYS.CONNECTIONS**: Lists all connected clients (peers and administrators).
//! * **SYS.KILL <address>**: Terminates the connection of the given remote address.
//! * **SYS.SET_CONFIG <yaml>**: Validates and stores a new config file. It is picked up by the
//!   config monitor, so that groups and peers re-apply their settings.
use std::sync::Arc;

use anyhow::Context;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::commands::{queue, Call, CommandDictionary, CommandResult, Queue, ResultExt};
use crate::config::Config;
use crate::fmt::format_short_duration;
use crate::platform::Platform;
use crate::response::SEPARATOR;
use crate::server::Server;

#[derive(FromPrimitive)]
enum Commands {
    Commands,
    Connections,
    Kill,
    SetConfig,
}

/// Installs the maintenance commands into the given platform.
///
/// This is invoked by the [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: Arc<Platform>) {
    if let Some(commands) = platform.find::<CommandDictionary>() {
        let queue = actor(platform);
        commands.register_command("SYS.COMMANDS", queue.clone(), Commands::Commands as usize);
        commands.register_command(
            "SYS.CONNECTIONS",
            queue.clone(),
            Commands::Connections as usize,
        );
        commands.register_command("SYS.KILL", queue.clone(), Commands::Kill as usize);
        commands.register_command("SYS.SET_CONFIG", queue, Commands::SetConfig as usize);
    }
}

fn actor(platform: Arc<Platform>) -> Queue {
    let (queue, mut endpoint) = queue();

    crate::spawn!(async move {
        while let Some(mut call) = endpoint.recv().await {
            // Services are resolved per call, as the server or config might be disabled...
            match Commands::from_usize(call.token) {
                Some(Commands::Commands) => commands_command(&mut call, &platform).complete(call),
                Some(Commands::Connections) => {
                    connections_command(&mut call, &platform).complete(call)
                }
                Some(Commands::Kill) => kill_command(&mut call, &platform).complete(call),
                Some(Commands::SetConfig) => {
                    set_config_command(&mut call, &platform).await.complete(call)
                }
                None => call.handle_unknown_token(),
            }
        }
    });

    queue
}

fn commands_command(call: &mut Call, platform: &Arc<Platform>) -> CommandResult {
    let mut commands = match platform.find::<CommandDictionary>() {
        Some(dictionary) => dictionary.commands(),
        None => Vec::new(),
    };
    commands.sort_by(|a, b| a.name.cmp(b.name));

    let mut result = format!("{:<30} {:>10} {:>20}\n", "Name", "Calls", "Duration");
    result += SEPARATOR;
    for command in commands {
        result += &format!(
            "{:<30} {:>10} {:>20}\n",
            command.name,
            command.call_count(),
            format_short_duration(command.avg_duration())
        );
    }
    result += SEPARATOR;

    call.response.bulk(result)?;
    Ok(())
}

fn connections_command(call: &mut Call, platform: &Arc<Platform>) -> CommandResult {
    let server = platform
        .find::<Server>()
        .ok_or_else(|| crate::server_error!("No server is installed"))?;
    let connections = server.connections();

    let mut result = format!("Open connections: {}\n\n", connections.len());
    result += &format!(
        "{:<24} {:<30} {:>10} {:>15}\n",
        "Remote Address", "Client Name", "Calls", "Avg. Duration"
    );
    result += SEPARATOR;
    for connection in connections {
        result += &format!(
            "{:<24} {:<30} {:>10} {:>15}\n",
            connection.peer_address,
            connection.client,
            connection.commands.count(),
            format_short_duration(connection.commands.avg())
        );
    }
    result += SEPARATOR;

    call.response.bulk(result)?;
    Ok(())
}

fn kill_command(call: &mut Call, platform: &Arc<Platform>) -> CommandResult {
    let address = call.request.str_parameter(0)?;
    let killed = platform
        .find::<Server>()
        .map(|server| server.kill(address))
        .unwrap_or(false);

    if killed {
        call.response.ok()?;
        Ok(())
    } else {
        Err(crate::client_error!("Unknown connection: {}", address))
    }
}

async fn set_config_command(call: &mut Call, platform: &Arc<Platform>) -> CommandResult {
    let new_config = call
        .request
        .str_parameter(0)
        .context("Expected a valid YAML config as parameter.")?;
    let config = platform
        .find::<Config>()
        .ok_or_else(|| crate::server_error!("No config is installed"))?;
    config.store(new_config).await?;

    call.response.ok()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::commands::CommandDictionary;
    use crate::config::Config;
    use crate::request::Request;
    use crate::server::Server;
    use crate::testing::{query_redis_async, test_async};

    #[test]
    fn commands_are_listed_without_a_server() {
        test_async(async {
            let platform = Builder::new()
                .enable_commands()
                .enable_core_commands()
                .build()
                .await;
            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();

            let result = dispatcher
                .invoke(Request::example(vec!["SYS.COMMANDS"]), None)
                .await
                .unwrap();
            let text = String::from_utf8_lossy(&result[..]).to_string();
            assert_eq!(text.contains("SYS.KILL"), true);

            let result = dispatcher
                .invoke(Request::example(vec!["SYS.CONNECTIONS"]), None)
                .await
                .unwrap();
            assert_eq!(
                std::str::from_utf8(&result[..]).unwrap(),
                "-SERVER: No server is installed\r\n"
            );

            let result = dispatcher
                .invoke(Request::example(vec!["SYS.KILL", "1.2.3.4:5"]), None)
                .await
                .unwrap();
            assert_eq!(
                std::str::from_utf8(&result[..]).unwrap(),
                "-CLIENT: Unknown connection: 1.2.3.4:5\r\n"
            );

            platform.terminate();
        });
    }

    #[test]
    fn integration_test() {
        // We want exclusive access to port 1503 on which we fire up a test-server...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let platform = Builder::new().enable_all().disable_signals().build().await;
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

            Server::fork_and_await(&platform.require::<Server>()).await;

            assert_eq!(
                query_redis_async(|con| redis::cmd("SYS.COMMANDS").query::<String>(con))
                    .await
                    .is_some(),
                true
            );
            let connections =
                query_redis_async(|con| redis::cmd("SYS.CONNECTIONS").query::<String>(con))
                    .await
                    .unwrap();
            assert_eq!(connections.contains("Open connections: "), true);

            // KILL requires a parameter...
            assert_eq!(
                query_redis_async(|con| redis::cmd("SYS.KILL").query::<String>(con))
                    .await
                    .is_none(),
                true
            );

            platform.terminate();
        });
    }
}
