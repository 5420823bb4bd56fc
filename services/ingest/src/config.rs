//! Environment configuration.

use crate::pipeline::{PipelineOptions, DEFAULT_CHUNK_SIZE, DEFAULT_ERROR_PREVIEW};
use anyhow::{Context, Result};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Postgres URL. Only required by commands that touch the warehouse.
    pub db_url: Option<String>,
    pub max_connections: u32,
    pub chunk_size: usize,
    pub error_preview: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            db_url: lookup("DB_URL").filter(|v| !v.trim().is_empty()),
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?.max(1),
            chunk_size: parse_or(&lookup, "INGEST_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?.max(1),
            error_preview: parse_or(&lookup, "INGEST_ERROR_PREVIEW", DEFAULT_ERROR_PREVIEW)?,
        })
    }

    pub fn require_db_url(&self) -> Result<&str> {
        self.db_url.as_deref().context("DB_URL env var missing")
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            chunk_size: self.chunk_size,
            error_preview: self.error_preview,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        _ => Ok(default),
    }
}
