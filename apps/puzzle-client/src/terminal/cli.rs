use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{
    DEFAULT_COUNTDOWN_SECS, DEFAULT_LEVEL_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_SERVER,
};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "puzzle",
    about = "Solve sliding puzzles of medical images, then answer questions about them",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "PUZZLE_SERVER",
        default_value = DEFAULT_SERVER,
        help = "Base URL of the game server"
    )]
    pub server: String,

    #[arg(
        long = "profile-path",
        global = true,
        env = "PUZZLE_PROFILE_PATH",
        value_name = "PATH",
        help = "Where the player profile is stored (default ~/.puzzle-quest/profile.toml)"
    )]
    pub profile_path: Option<PathBuf>,

    #[arg(
        long = "level-timeout",
        global = true,
        env = "PUZZLE_LEVEL_TIMEOUT",
        value_name = "SECONDS",
        default_value_t = DEFAULT_LEVEL_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Seconds allowed per level attempt"
    )]
    pub level_timeout: u32,

    #[arg(
        long,
        global = true,
        env = "PUZZLE_COUNTDOWN",
        value_name = "SECONDS",
        default_value_t = DEFAULT_COUNTDOWN_SECS,
        help = "Pre-shuffle countdown used when the server does not send one"
    )]
    pub countdown: u32,

    #[arg(
        long = "request-timeout",
        global = true,
        env = "PUZZLE_REQUEST_TIMEOUT",
        value_name = "SECONDS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Give up on a server request after this many seconds"
    )]
    pub request_timeout: u64,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PUZZLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PUZZLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play the game (default when no subcommand given)
    Play(PlayArgs),
    /// Show the saved player profile
    Profile,
    /// List the top players
    Winners,
    /// Forget the saved player profile
    Reset,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PlayArgs {
    #[arg(
        long,
        value_name = "NAME",
        help = "Register as NAME instead of the saved profile's name"
    )]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn play_is_optional() {
        let cli = Cli::try_parse_from(["puzzle", "--server", "http://host:1"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.server, "http://host:1");

        let cli = Cli::try_parse_from(["puzzle", "play", "--name", "Ann Lee"]).unwrap();
        match cli.command {
            Some(Command::Play(args)) => assert_eq!(args.name.as_deref(), Some("Ann Lee")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_is_refused() {
        assert!(Cli::try_parse_from(["puzzle", "--level-timeout", "0"]).is_err());
        assert!(Cli::try_parse_from(["puzzle", "--request-timeout", "0"]).is_err());
    }

    #[test]
    fn request_timeout_is_configurable() {
        let cli = Cli::try_parse_from(["puzzle", "--request-timeout", "5", "winners"]).unwrap();
        assert_eq!(cli.request_timeout, 5);
        assert!(matches!(cli.command, Some(Command::Winners)));
    }
}
