//! Operator configuration read from the process environment

use std::time::Duration;

use crate::reconcilers::certificates::LEAF_VALIDITY_DAYS;
use crate::{Error, Result};

/// Environment variable holding the Dex container image
pub const DEX_IMAGE_ENV_NAME: &str = "RELATED_IMAGE_DEX";
/// Environment variable overriding the metrics port
pub const METRICS_PORT_ENV_NAME: &str = "METRICS_PORT";
/// Environment variable overriding the per-pass deadline
pub const RECONCILE_TIMEOUT_ENV_NAME: &str = "RECONCILE_TIMEOUT_SECS";
/// Environment variable overriding the mTLS renewal window
pub const RENEWAL_WINDOW_ENV_NAME: &str = "MTLS_RENEWAL_WINDOW_HOURS";

const DEFAULT_METRICS_PORT: u16 = 8080;
const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RENEWAL_WINDOW_HOURS: i64 = 24;

/// Process-wide operator settings
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Dex server image pull spec
    pub dex_image: String,
    /// Port for the metrics and health server
    pub metrics_port: u16,
    /// Deadline applied to each convergence pass
    pub reconcile_timeout: Duration,
    /// Lead time before certificate expiry at which the bundle is regenerated
    pub renewal_window: chrono::Duration,
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dex_image = lookup(DEX_IMAGE_ENV_NAME)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "required environment variable {} is empty or not set",
                    DEX_IMAGE_ENV_NAME
                ))
            })?;

        let metrics_port = parse_or(&lookup, METRICS_PORT_ENV_NAME, DEFAULT_METRICS_PORT)?;
        let timeout_secs = parse_or(
            &lookup,
            RECONCILE_TIMEOUT_ENV_NAME,
            DEFAULT_RECONCILE_TIMEOUT_SECS,
        )?;
        let window_hours = parse_or(
            &lookup,
            RENEWAL_WINDOW_ENV_NAME,
            DEFAULT_RENEWAL_WINDOW_HOURS,
        )?;
        if window_hours < 0 {
            return Err(Error::ConfigError(format!(
                "{} must not be negative",
                RENEWAL_WINDOW_ENV_NAME
            )));
        }
        // a window covering the whole certificate lifetime renews on every pass
        let max_window_hours = LEAF_VALIDITY_DAYS * 24;
        if window_hours >= max_window_hours {
            return Err(Error::ConfigError(format!(
                "{} must be below {} (the certificate validity), got {}",
                RENEWAL_WINDOW_ENV_NAME, max_window_hours, window_hours
            )));
        }

        Ok(Self {
            dex_image,
            metrics_port,
            reconcile_timeout: Duration::from_secs(timeout_secs),
            renewal_window: chrono::Duration::hours(window_hours),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            Error::ConfigError(format!("invalid value {:?} for {}: {}", raw, key, e))
        }),
        _ => Ok(default),
    }
}
