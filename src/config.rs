use std::env;

use tracing::warn;

/// 2 GiB upload cap unless `ENV_MAX_FILE_SIZE` overrides it.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 64 KiB copy buffer unless `ENV_BUFFER_SIZE` overrides it.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Server mode controls rate limiting and log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Debug,
    Release,
    Test,
}

impl ServerMode {
    pub fn from_env() -> Self {
        match env::var("ENV_SERVER_MODE").as_deref() {
            Ok("debug") => ServerMode::Debug,
            Ok("test") => ServerMode::Test,
            Ok("release") | Ok("") | Err(_) => ServerMode::Release,
            Ok(other) => {
                warn!(mode = other, "unknown ENV_SERVER_MODE, using release");
                ServerMode::Release
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Debug => "debug",
            ServerMode::Release => "release",
            ServerMode::Test => "test",
        }
    }
}

/// Long-lived process configuration, captured once at startup.
///
/// The upload size cap, copy buffer size, and validation mode are deliberately
/// *not* part of this snapshot: they are re-read from the environment on each
/// call (see [`max_file_size`], [`copy_buffer_size`], and
/// `validators::ValidationMode::from_env`).
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listener port (`SOCKET_PORT`, default 6033).
    pub socket_port: u16,
    /// Shared API key; `None` disables authentication (`API_KEY`).
    pub api_key: Option<String>,
    /// Per-IP requests per second; 0 disables (`ENV_RATE_LIMIT_RPS`, default 5).
    pub rate_limit_rps: u32,
    /// Include benchmark records by default (`ENABLE_QUERY_BENCHMARKS`).
    pub enable_benchmarks: bool,
    /// Object-store URI to seed the database from (`SNAPSHOT_LOCATION`).
    pub snapshot_location: Option<String>,
    pub server_mode: ServerMode,
}

impl Config {
    pub fn from_env() -> Self {
        let socket_port = env::var("SOCKET_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(6033);

        let api_key = env::var("API_KEY").ok().filter(|k| !k.is_empty());

        let rate_limit_rps = parse_rate_limit(env::var("ENV_RATE_LIMIT_RPS").ok().as_deref());

        let enable_benchmarks = env::var("ENABLE_QUERY_BENCHMARKS").as_deref() == Ok("true");

        let snapshot_location = env::var("SNAPSHOT_LOCATION").ok().filter(|s| !s.is_empty());

        Config {
            socket_port,
            api_key,
            rate_limit_rps,
            enable_benchmarks,
            snapshot_location,
            server_mode: ServerMode::from_env(),
        }
    }
}

fn parse_rate_limit(raw: Option<&str>) -> u32 {
    match raw {
        None | Some("") => 5,
        Some(v) => match v.parse::<u32>() {
            Ok(n) => n,
            Err(e) => {
                warn!(value = v, error = %e, "invalid ENV_RATE_LIMIT_RPS, using default 5");
                5
            }
        },
    }
}

/// Maximum upload size in bytes, re-read from `ENV_MAX_FILE_SIZE` on each call.
pub fn max_file_size() -> u64 {
    parse_positive_u64(
        env::var("ENV_MAX_FILE_SIZE").ok().as_deref(),
        DEFAULT_MAX_FILE_SIZE,
    )
}

/// Copy buffer size in bytes, re-read from `ENV_BUFFER_SIZE` on each call.
pub fn copy_buffer_size() -> usize {
    parse_positive_u64(
        env::var("ENV_BUFFER_SIZE").ok().as_deref(),
        DEFAULT_BUFFER_SIZE as u64,
    ) as usize
}

fn parse_positive_u64(raw: Option<&str>, default: u64) -> u64 {
    match raw {
        None | Some("") => default,
        Some(v) => match v.parse::<i64>() {
            Ok(n) if n > 0 => n as u64,
            Ok(_) => {
                warn!(value = v, default, "size must be positive, using default");
                default
            }
            Err(e) => {
                warn!(value = v, error = %e, default, "invalid size value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_sizes_parse() {
        assert_eq!(parse_positive_u64(Some("1024"), 99), 1024);
        assert_eq!(parse_positive_u64(Some("1"), 99), 1);
    }

    #[test]
    fn bad_sizes_fall_back_to_default() {
        assert_eq!(parse_positive_u64(None, 42), 42);
        assert_eq!(parse_positive_u64(Some(""), 42), 42);
        assert_eq!(parse_positive_u64(Some("0"), 42), 42);
        assert_eq!(parse_positive_u64(Some("-5"), 42), 42);
        assert_eq!(parse_positive_u64(Some("not-a-number"), 42), 42);
    }

    #[test]
    fn rate_limit_defaults() {
        assert_eq!(parse_rate_limit(None), 5);
        assert_eq!(parse_rate_limit(Some("")), 5);
        assert_eq!(parse_rate_limit(Some("12")), 12);
        assert_eq!(parse_rate_limit(Some("0")), 0);
        assert_eq!(parse_rate_limit(Some("nope")), 5);
    }
}
