use std::io;

use puzzle_sdk::TransportError;
use thiserror::Error;

use crate::profile::ProfileError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("profile error: {0}")]
    Profile(#[from] ProfileError),
    #[error("server request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("server error: {0}")]
    Server(String),
}
