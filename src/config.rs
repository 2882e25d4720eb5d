use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::{CurrencyAmount, CurrencyUnit};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub billing: BillingConfig,
    pub payment: PaymentConfig,
    pub storage: StorageConfig,
    pub observer: ObserverConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    pub chunk_seconds: f64,
    pub payment_per_chunk: i64,
    pub payment_unit: CurrencyUnit,
    pub billable_video_id: String,
}

impl BillingConfig {
    pub fn payment_per_chunk(&self) -> CurrencyAmount {
        CurrencyAmount::new(self.payment_unit, self.payment_per_chunk)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub api_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub timeout_secs: u64,
    pub invoice_memo: String,
    pub transaction_poll_ms: u64,
}

impl PaymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `file` or `memory`
    pub provider: String,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    pub pause_grace_ms: u64,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            server: ServerConfig {
                port: parse(&lookup, "PORT", 3000)?,
                host: get("HOST", "0.0.0.0"),
                cors_allowed_origins: get("ALLOWED_ORIGINS", "*")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            billing: BillingConfig {
                chunk_seconds: parse(&lookup, "CHUNK_SECONDS", 2.0)?,
                payment_per_chunk: parse(&lookup, "PAYMENT_PER_CHUNK", 10)?,
                payment_unit: {
                    let unit = get("PAYMENT_UNIT", "SATOSHI");
                    CurrencyUnit::from_id(&unit)
                        .with_context(|| format!("PAYMENT_UNIT: unknown currency unit {unit:?}"))?
                },
                billable_video_id: get("BILLABLE_VIDEO_ID", "ls_demo"),
            },
            payment: PaymentConfig {
                api_url: get(
                    "PAYMENT_API_URL",
                    "https://api.lightspark.com/graphql/server/2023-09-13",
                ),
                client_id: lookup("PAYMENT_API_CLIENT_ID"),
                client_secret: lookup("PAYMENT_API_CLIENT_SECRET"),
                timeout_secs: parse(&lookup, "PAYMENT_TIMEOUT_SECS", 60)?,
                invoice_memo: get("INVOICE_MEMO", "Streaming payments"),
                transaction_poll_ms: parse(&lookup, "TRANSACTION_POLL_MS", 2000)?,
            },
            storage: StorageConfig {
                provider: get("STORAGE_PROVIDER", "file"),
                data_dir: lookup("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_data_dir),
            },
            observer: ObserverConfig {
                pause_grace_ms: parse(&lookup, "PAUSE_GRACE_MS", 3000)?,
                resubscribe_attempts: parse(&lookup, "RESUBSCRIBE_ATTEMPTS", 5)?,
                resubscribe_backoff_ms: parse(&lookup, "RESUBSCRIBE_BACKOFF_MS", 500)?,
            },
            log: LogConfig {
                dir: lookup("LOG_DIR").map(PathBuf::from),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.billing.chunk_seconds.is_finite() || self.billing.chunk_seconds <= 0.0 {
            bail!("CHUNK_SECONDS must be a positive number");
        }
        if self.billing.payment_per_chunk < 0 {
            bail!("PAYMENT_PER_CHUNK must not be negative");
        }
        if self.payment.timeout_secs == 0 {
            bail!("PAYMENT_TIMEOUT_SECS must be at least 1");
        }
        if self.observer.resubscribe_attempts == 0 {
            bail!("RESUBSCRIBE_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}: invalid value {raw:?}")),
        None => Ok(default),
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("paystream"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}
