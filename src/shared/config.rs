use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

/// Fairness window used by ticket selection when none is configured.
pub const DEFAULT_ALTERNATION_WINDOW: i32 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub alternation_window: i32,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| {
                    "postgres://queue:@localhost:5432/queueserver".to_string()
                }),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            },
            queue: QueueConfig {
                alternation_window: env::var("QUEUE_ALTERNATION_WINDOW")
                    .unwrap_or_else(|_| DEFAULT_ALTERNATION_WINDOW.to_string())
                    .parse()?,
            },
        })
    }
}
