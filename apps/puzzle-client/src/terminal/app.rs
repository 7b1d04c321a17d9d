use std::io;
use std::sync::Arc;
use std::time::Duration;

use puzzle_sdk::{GameClient, MemorySessionStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{normalize_server, GameConfig};
use crate::driver::GameDriver;
use crate::profile::{FileProfileStore, ProfileStore};
use crate::session::Event;
use crate::terminal::cli::{Cli, Command, PlayArgs};
use crate::terminal::console::{self, ConsoleView, HELP};
use crate::terminal::error::CliError;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = GameConfig {
        server: normalize_server(cli.server),
        countdown_secs: cli.countdown,
        level_timeout_secs: cli.level_timeout,
        request_timeout: Duration::from_secs(cli.request_timeout),
        ..GameConfig::default()
    };
    let profile_path = match cli.profile_path {
        Some(path) => path,
        None => FileProfileStore::default_path()?,
    };
    debug!(target: "puzzle::app", profile = %profile_path.display(), server = %config.server, "resolved settings");
    let profiles: Arc<dyn ProfileStore> = Arc::new(FileProfileStore::new(profile_path));

    match cli.command {
        Some(Command::Play(args)) => play(config, profiles, args).await,
        None => play(config, profiles, PlayArgs::default()).await,
        Some(Command::Profile) => show_profile(profiles.as_ref()).await,
        Some(Command::Winners) => show_winners(&config).await,
        Some(Command::Reset) => {
            profiles.clear().await?;
            println!("Saved profile removed.");
            Ok(())
        }
    }
}

async fn play(
    config: GameConfig,
    profiles: Arc<dyn ProfileStore>,
    args: PlayArgs,
) -> Result<(), CliError> {
    let saved = profiles.load().await?;
    let client = client_for(&config);
    let view = ConsoleView::stdout(config.server.clone());
    let mut driver = GameDriver::new(config, client, profiles, view);

    let (tx, rx) = mpsc::unbounded_channel();
    match args.name.or(saved.map(|profile| profile.username)) {
        Some(name) => {
            info!(target: "puzzle::app", %name, "resuming as player");
            println!("Playing as {name}. Type 'help' for commands.");
            // rx is alive until the driver below returns
            let _ = tx.send(Event::SubmitName(name));
        }
        None => println!("Enter your name with 'name <NAME>'. Type 'help' for commands."),
    }

    let input = tokio::spawn(read_commands(tx));
    driver.run(rx).await;
    input.abort();
    Ok(())
}

fn client_for(config: &GameConfig) -> GameClient {
    GameClient::with_timeout(
        config.server.clone(),
        MemorySessionStore::new(),
        config.request_timeout,
    )
}

async fn read_commands(tx: mpsc::UnboundedSender<Event>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match console::parse_command(&line) {
            Ok(Some(console::Command::Game(event))) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Ok(Some(console::Command::Help)) => println!("{HELP}"),
            Ok(Some(console::Command::Quit)) => break,
            Ok(None) => {}
            Err(err) => println!("  {err}"),
        }
    }
    Ok(())
}

async fn show_profile(profiles: &dyn ProfileStore) -> Result<(), CliError> {
    match profiles.load().await? {
        Some(profile) => {
            println!("player:  {}", profile.username);
            if let Some(player_id) = profile.player_id.as_deref() {
                println!("id:      {player_id}");
            }
            println!("level:   {}", profile.level);
            println!("updated: {}", profile.updated_at);
        }
        None => println!("No saved profile."),
    }
    Ok(())
}

async fn show_winners(config: &GameConfig) -> Result<(), CliError> {
    let client = client_for(config);
    let response = client.winners().await?;
    if !response.ok {
        return Err(CliError::Server(format!(
            "leaderboard request failed with status {}",
            response.status
        )));
    }
    let reply = response.body;
    console::write_winners(&mut io::stdout(), &reply.winners, reply.message.as_deref())?;
    Ok(())
}
