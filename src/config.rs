use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Storage
    pub sqlite_path: String,

    // Inbound API
    pub api_host: String,
    pub api_port: u16,
    pub query_timeout_ms: u64,
    pub deviation_window: usize,

    // Upstream price API
    pub price_api_base_url: String,
    pub fetch_max_attempts: u32,
    pub fetch_timeout_secs: u64,

    // Schedule (6-field cron, seconds first)
    pub schedule_cron: String,
    pub schedule_tz: String,
    pub fetch_on_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sqlite_path: "./data/crypto_prices.sqlite".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 3000,
            query_timeout_ms: 5000,
            deviation_window: 100,
            price_api_base_url: "https://api.coingecko.com/api/v3".to_string(),
            fetch_max_attempts: 3,
            fetch_timeout_secs: 30,
            schedule_cron: "0 0 */2 * * *".to_string(),
            schedule_tz: "America/New_York".to_string(),
            fetch_on_start: false,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let d = Self::default();

        let api_port = get_env_u64("PORT", d.api_port as u64)?;
        if api_port > u16::MAX as u64 {
            return Err(anyhow!("PORT out of range (got {api_port})"));
        }

        let s = Self {
            sqlite_path: get_env_string("SQLITE_PATH", &d.sqlite_path),
            api_host: get_env_string("API_HOST", &d.api_host),
            api_port: api_port as u16,
            query_timeout_ms: get_env_u64("QUERY_TIMEOUT_MS", d.query_timeout_ms)?,
            deviation_window: get_env_u64("DEVIATION_WINDOW", d.deviation_window as u64)? as usize,
            price_api_base_url: get_env_string("PRICE_API_BASE_URL", &d.price_api_base_url)
                .trim_end_matches('/')
                .to_string(),
            fetch_max_attempts: get_env_u64("FETCH_MAX_ATTEMPTS", d.fetch_max_attempts as u64)?
                .min(u32::MAX as u64) as u32,
            fetch_timeout_secs: get_env_u64("FETCH_TIMEOUT_SECS", d.fetch_timeout_secs)?,
            schedule_cron: get_env_string("SCHEDULE_CRON", &d.schedule_cron),
            schedule_tz: get_env_string("SCHEDULE_TZ", &d.schedule_tz),
            fetch_on_start: get_env_bool("FETCH_ON_START", d.fetch_on_start),
        };

        s.validate()?;
        Ok(s)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn schedule_tz(&self) -> Result<chrono_tz::Tz> {
        self.schedule_tz
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow!("SCHEDULE_TZ invalid ({}): {e}", self.schedule_tz))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sqlite_path.trim().is_empty() {
            return Err(anyhow!("SQLITE_PATH must not be empty"));
        }
        if self.fetch_max_attempts < 1 {
            return Err(anyhow!(
                "FETCH_MAX_ATTEMPTS must be >= 1 (got {})",
                self.fetch_max_attempts
            ));
        }
        if self.fetch_timeout_secs < 1 {
            return Err(anyhow!(
                "FETCH_TIMEOUT_SECS must be >= 1 (got {})",
                self.fetch_timeout_secs
            ));
        }
        if self.query_timeout_ms < 1 {
            return Err(anyhow!(
                "QUERY_TIMEOUT_MS must be >= 1 (got {})",
                self.query_timeout_ms
            ));
        }
        if self.deviation_window < 1 {
            return Err(anyhow!(
                "DEVIATION_WINDOW must be >= 1 (got {})",
                self.deviation_window
            ));
        }
        if !self.price_api_base_url.starts_with("http://") && !self.price_api_base_url.starts_with("https://") {
            return Err(anyhow!(
                "PRICE_API_BASE_URL must be an http(s) url (got {})",
                self.price_api_base_url
            ));
        }
        if self.schedule_cron.split_whitespace().count() < 6 {
            return Err(anyhow!(
                "SCHEDULE_CRON must have 6 fields, seconds first (got {})",
                self.schedule_cron
            ));
        }
        self.schedule_tz()?;
        Ok(())
    }
}
