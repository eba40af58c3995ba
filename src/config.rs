use std::env;

use anyhow::{Context, Result};

/// Environment-backed settings, read once at startup.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Key for signing quiz attempt-session tokens.
    pub app_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8081);
        let app_secret = env::var("APP_SECRET").context("APP_SECRET not set")?;
        Ok(Self {
            database_url,
            port,
            app_secret,
        })
    }
}
