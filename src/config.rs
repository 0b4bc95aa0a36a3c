use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: Storage,
    pub wallet: Wallet,
    pub reconcile: Reconcile,
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Wallet {
    /// BIP44-style purpose field (84 for native segwit layouts).
    #[serde(default = "default_purpose")]
    pub purpose: u32,
    #[serde(default)]
    pub coin_type: u32,
    #[serde(default)]
    pub account: u32,
    /// Number of pre-generated receive addresses to keep submitted to the
    /// server-side address pool.
    #[serde(default = "default_pool_target")]
    pub pool_target: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Reconcile {
    /// Seconds between background sync cycles.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// How long a sent invitation may remain unacknowledged by the server
    /// before it is pruned and its index freed.
    #[serde(default = "default_ack_window")]
    pub ack_window_secs: u64,
    /// Directory watched by the spool-file request client. The external
    /// transport drops fulfillment responses here as JSON files.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_purpose() -> u32   { 84 }
fn default_pool_target() -> u32 { 5 }
fn default_interval() -> u64  { 30 }
fn default_ack_window() -> u64 { 24 * 60 * 60 }
fn default_spool_dir() -> String { "spool".into() }
fn default_bind() -> String { "0.0.0.0:9100".into() }

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

/// Parse a config from an in-memory TOML string (used for the embedded
/// fallback config).
pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).with_context(|| "📝  invalid TOML in config file".to_string())
}
