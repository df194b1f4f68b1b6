use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;

/// Process configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub max_connections: u32,
    /// Queue capacity of each live event subscriber.
    pub subscriber_buffer: usize,
    pub session_inactivity: time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://playmatch.db?mode=rwc".to_owned(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 16,
            subscriber_buffer: 64,
            session_inactivity: time::Duration::minutes(60),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let defaults = Config::default();

        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.max_connections)?,
            subscriber_buffer: parse_or(&lookup, "SUBSCRIBER_BUFFER", defaults.subscriber_buffer)?,
            session_inactivity: time::Duration::minutes(parse_or(
                &lookup,
                "SESSION_INACTIVITY_MINUTES",
                defaults.session_inactivity.whole_minutes(),
            )?),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
