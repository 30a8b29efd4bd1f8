//! Link configuration from environment variables
//!
//! Controls the backend endpoint, the coin to discover and the timing of the
//! link worker. Defaults to Ethereum mainnet on a local node.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::coin::Coin;

#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Coin whose backend the worker connects to
    pub coin: Coin,
    /// JSON-RPC endpoint of the backend node
    pub backend_url: String,
    /// How long the channel waits for the worker to announce readiness
    pub handshake_timeout: Duration,
    /// Interval of the worker's block polling once subscribed
    pub poll_interval: Duration,
    /// Verbose worker logging
    pub debug: bool,
}

impl LinkConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `COIN`: "eth" (default), "etc" or "trop"
    /// - `BACKEND_URL`: JSON-RPC endpoint (default http://localhost:8545)
    /// - `HANDSHAKE_TIMEOUT_MS`: default 5000
    /// - `POLL_INTERVAL_MS`: default 10000
    /// - `LINK_DEBUG`: "1" or "true" enables worker debug logging
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let coin = match env::var("COIN") {
            Ok(symbol) => symbol.parse().unwrap_or_else(|_| {
                log::warn!("Unknown coin '{}', defaulting to {}", symbol, defaults.coin);
                defaults.coin
            }),
            Err(_) => defaults.coin,
        };
        log::info!("Coin: {} ({})", coin.shortcut(), coin.bip44_path());

        let backend_url = env::var("BACKEND_URL").unwrap_or(defaults.backend_url);
        log::info!("Backend URL: {}", backend_url);

        let handshake_timeout = duration_from_env("HANDSHAKE_TIMEOUT_MS")
            .unwrap_or(defaults.handshake_timeout);
        let poll_interval =
            duration_from_env("POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval);

        let debug = env::var("LINK_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            coin,
            backend_url,
            handshake_timeout,
            poll_interval,
            debug,
        }
    }

    /// Settings handed to the worker in the handshake reply
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            name: self.coin.shortcut().to_string(),
            url: self.backend_url.clone(),
            poll_interval_ms: self.poll_interval.as_millis() as u64,
            debug: self.debug,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            coin: Coin::Ethereum,
            backend_url: "http://localhost:8545".to_string(),
            handshake_timeout: Duration::from_millis(5_000),
            poll_interval: Duration::from_millis(10_000),
            debug: false,
        }
    }
}

/// Configuration sent to the worker once it announced readiness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSettings {
    pub name: String,
    pub url: String,
    pub poll_interval_ms: u64,
    pub debug: bool,
}

fn duration_from_env(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            log::warn!("Ignoring invalid {}='{}'", key, raw);
            None
        }
    }
}
