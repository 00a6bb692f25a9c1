use std::env;
use std::time::Duration;

pub const RELAY_URL_ENV: &str = "DRINK_CAM_RELAY_URL";
pub const ACCESS_KEY_ENV: &str = "DRINK_CAM_ACCESS_KEY";
pub const STUN_URLS_ENV: &str = "DRINK_CAM_STUN_URLS";
pub const READY_TIMEOUT_ENV: &str = "DRINK_CAM_READY_TIMEOUT_MS";

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8787";
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Drink-cam client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub relay_url: String,
    /// `None` leaves the session open to anyone with the room code.
    pub access_key: Option<String>,
    pub stun_urls: Vec<String>,
    pub ready_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay_url = env::var(RELAY_URL_ENV)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(defaults.relay_url);
        let access_key = env::var(ACCESS_KEY_ENV)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        let stun_urls = env::var(STUN_URLS_ENV)
            .map(|urls| parse_list(&urls))
            .unwrap_or(defaults.stun_urls);
        let ready_timeout = env::var(READY_TIMEOUT_ENV)
            .ok()
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.ready_timeout);
        Self {
            relay_url,
            access_key,
            stun_urls,
            ready_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            access_key: None,
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Comma-separated list; an empty value yields an empty list.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
