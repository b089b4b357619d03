//! Job settings shared by the API server and the worker
//!
//! Both processes run the reaper and the webhook processor, so both read the
//! same environment variables through [`JobSettings::from_env`].

use std::str::FromStr;

use thiserror::Error;

use crate::events::DuplicatePolicy;
use crate::processor::DEFAULT_MAX_ATTEMPTS;
use crate::reaper::{ReaperConfig, DEFAULT_BATCH_SIZE, DEFAULT_TIMEOUT_MINUTES};

#[derive(Debug, Error)]
#[error("{name} is invalid: {message}")]
pub struct SettingsError {
    pub name: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub duplicate_policy: DuplicatePolicy,
    pub webhook_max_attempts: i32,
    pub reaper: ReaperConfig,
}

/// Environment variable, with blank values treated as unset
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn parse_env<T>(name: &'static str, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| SettingsError {
            name,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn positive(name: &'static str, value: i64) -> Result<i64, SettingsError> {
    if value <= 0 {
        return Err(SettingsError {
            name,
            message: format!("must be positive, got {}", value),
        });
    }
    Ok(value)
}

impl JobSettings {
    /// Reads `WEBHOOK_DUPLICATE_POLICY`, `WEBHOOK_MAX_ATTEMPTS`,
    /// `REAPER_TIMEOUT_MINUTES` and `REAPER_BATCH_SIZE`
    pub fn from_env() -> Result<Self, SettingsError> {
        let max_attempts = positive(
            "WEBHOOK_MAX_ATTEMPTS",
            parse_env("WEBHOOK_MAX_ATTEMPTS", i64::from(DEFAULT_MAX_ATTEMPTS))?,
        )?;
        let timeout_minutes = positive(
            "REAPER_TIMEOUT_MINUTES",
            parse_env("REAPER_TIMEOUT_MINUTES", DEFAULT_TIMEOUT_MINUTES)?,
        )?;
        let batch_size = positive(
            "REAPER_BATCH_SIZE",
            parse_env("REAPER_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
        )?;

        Ok(Self {
            duplicate_policy: parse_env("WEBHOOK_DUPLICATE_POLICY", DuplicatePolicy::default())?,
            webhook_max_attempts: i32::try_from(max_attempts).map_err(|e| SettingsError {
                name: "WEBHOOK_MAX_ATTEMPTS",
                message: e.to_string(),
            })?,
            reaper: ReaperConfig {
                timeout: time::Duration::minutes(timeout_minutes),
                batch_size,
            },
        })
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            webhook_max_attempts: DEFAULT_MAX_ATTEMPTS,
            reaper: ReaperConfig::default(),
        }
    }
}
