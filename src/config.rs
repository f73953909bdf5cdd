// src/config.rs
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::MinuetResult;

/// Top-level configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Document root served to clients.
    pub src_dir: PathBuf,

    /// Listen port, 1024..=65535.
    pub port: u16,

    /// Trigger mode bits: bit 1 = listener edge-triggered, bit 0 =
    /// connection edge-triggered.
    pub trigger_mode: u8,

    /// Idle timeout in milliseconds; 0 disables eviction.
    pub timeout: u64,

    /// Enable SO_LINGER(1, 1) on the listener.
    pub opt_linger: bool,

    pub thread: ThreadConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            src_dir: PathBuf::from("./www"),
            port: 8080,
            trigger_mode: 3,
            timeout: 60_000,
            opt_linger: false,
            thread: ThreadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Worker pool size; 0 means one worker per CPU.
    pub count: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self { count: 8 }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> MinuetResult<Self> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}
