use std::time::Duration;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LEVEL: &str = "level_1";
pub const DEFAULT_COUNTDOWN_SECS: u32 = 3;
pub const DEFAULT_LEVEL_TIMEOUT_SECS: u32 = 180;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = puzzle_sdk::DEFAULT_REQUEST_TIMEOUT.as_secs();

/// Resolved client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameConfig {
    /// Base URL of the game server.
    pub server: String,
    /// Level used when registration does not name one.
    pub default_level: String,
    /// Pre-shuffle countdown used when the server does not send one.
    pub countdown_secs: u32,
    /// Seconds a player gets per level attempt before timing out.
    pub level_timeout_secs: u32,
    /// Upper bound on a single server request, connect included.
    pub request_timeout: Duration,
    /// Interval between timer ticks; one second outside of tests.
    pub tick: Duration,
}

/// Rewrites `localhost` to IPv4 to avoid IPv6 (::1) preference on macOS.
pub fn normalize_server(server: String) -> String {
    if server.contains("://localhost") {
        server.replacen("localhost", "127.0.0.1", 1)
    } else {
        server
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            default_level: DEFAULT_LEVEL.to_string(),
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            level_timeout_secs: DEFAULT_LEVEL_TIMEOUT_SECS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            tick: Duration::from_secs(1),
        }
    }
}
