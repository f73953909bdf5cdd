// src/error.rs
use std::io;

use thiserror::Error;

/// Central error type for server setup and configuration.
///
/// The socket hot paths (buffer reads, vectored writes) do not use this
/// type; they return signed lengths with `!errno` encoding so EAGAIN can be
/// told apart from data without an allocation.
#[derive(Debug, Error)]
pub enum MinuetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid port {0}; expected 1024..=65535")]
    InvalidPort(u16),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("{0}")]
    Init(String),
}

pub type MinuetResult<T> = Result<T, MinuetError>;
