pub mod board;
pub mod config;
pub mod driver;
pub mod profile;
pub mod quiz;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod timer;
