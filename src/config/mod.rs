//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: String,
    /// Reject client transforms that leave the arena
    pub strict_intents: bool,
    /// Session simulation tunables
    pub game: GameSettings,
}

/// Tunables handed to the session directory
#[derive(Clone, Debug)]
pub struct GameSettings {
    /// Concurrent sessions allowed in the directory
    pub max_sessions: usize,
    pub maze_width: u32,
    pub maze_height: u32,
    /// Room edge length in pixels
    pub maze_step: u32,
    /// Delay between Countdown and Running
    pub countdown: Duration,
    /// Simulation tick period
    pub tick: Duration,
    /// How long a joined vehicle may go without a bound connection
    pub join_timeout: Duration,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            maze_width: 1200,
            maze_height: 720,
            maze_step: 120,
            countdown: Duration::from_millis(3000),
            tick: Duration::from_millis(16),
            join_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        };

        let defaults = GameSettings::default();
        let game = GameSettings {
            max_sessions: parse_or("MAX_SESSIONS", defaults.max_sessions)?,
            maze_width: parse_or("MAZE_WIDTH", defaults.maze_width)?,
            maze_height: parse_or("MAZE_HEIGHT", defaults.maze_height)?,
            maze_step: parse_or("MAZE_STEP", defaults.maze_step)?,
            countdown: Duration::from_millis(parse_or("COUNTDOWN_MS", 3000)?),
            tick: Duration::from_millis(parse_or("TICK_MS", 16)?),
            join_timeout: Duration::from_millis(parse_or("JOIN_TIMEOUT_MS", 30_000)?),
        };
        if game.maze_step == 0 || game.tick.is_zero() {
            return Err(ConfigError::Invalid("MAZE_STEP/TICK_MS"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            client_origin: env::var("CLIENT_ORIGIN")
                .unwrap_or_else(|_| "https://127.0.0.1:4200".to_string()),

            strict_intents: parse_or("STRICT_INTENTS", false)?,

            game,
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_match_arena() {
        let settings = GameSettings::default();
        assert_eq!(settings.max_sessions, 20);
        assert_eq!(settings.maze_width / settings.maze_step, 10);
        assert_eq!(settings.maze_height / settings.maze_step, 6);
        assert_eq!(settings.tick, Duration::from_millis(16));
        assert_eq!(settings.join_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_or_falls_back() {
        let value: u32 = parse_or("TANK_TANGO_TEST_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }
}
