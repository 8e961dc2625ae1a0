use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use zeroize::Zeroizing;

use crate::gate::bypass::{BypassPolicy, TrustedSource};
use crate::gate::GateSettings;
use crate::models::approval::ReplyOptions;
use crate::models::context::HostInfo;
use crate::notification::retry::RetryPolicy;
use crate::notification::telegram::DEFAULT_API_BASE_URL;

pub struct Config {
    pub telegram_token: Zeroizing<String>,
    pub chat_id: String,
    pub api_base_url: url::Url,
    pub parse_mode: Option<String>,
    /// Token bucket burst size. Set via LOGINGUARD_BUCKET_CAPACITY. Default: 3.
    pub bucket_capacity: f64,
    /// Tokens per second. Set via LOGINGUARD_BUCKET_FILL_RATE. Default: 1.
    pub bucket_fill_rate: f64,
    pub reply_options: ReplyOptions,
    /// Skip approval entirely. Set via LOGINGUARD_FORCE.
    pub force_bypass: bool,
    /// Comma-separated CIDRs, addresses, or legacy prefixes like `192.168.1.`.
    pub trusted_networks: Vec<TrustedSource>,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    pub rate_limit_interval: Duration,
    /// Overall deadline for one authentication. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub finalize_attempts: u32,
    pub finalize_grace: Duration,
    pub log_file: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("telegram_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("api_base_url", &self.api_base_url.as_str())
            .field("parse_mode", &self.parse_mode)
            .field("bucket_capacity", &self.bucket_capacity)
            .field("bucket_fill_rate", &self.bucket_fill_rate)
            .field("reply_options", &self.reply_options)
            .field("force_bypass", &self.force_bypass)
            .field("trusted_networks", &self.trusted_networks)
            .field("poll_interval", &self.poll_interval)
            .field("retry_interval", &self.retry_interval)
            .field("rate_limit_interval", &self.rate_limit_interval)
            .field("timeout", &self.timeout)
            .field("finalize_attempts", &self.finalize_attempts)
            .field("finalize_grace", &self.finalize_grace)
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl Config {
    /// Parse from an arbitrary key lookup. `load` passes the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_token = get("LOGINGUARD_TELEGRAM_TOKEN")
            .context("LOGINGUARD_TELEGRAM_TOKEN is not set")?;
        let chat_id = get("LOGINGUARD_CHAT_ID").context("LOGINGUARD_CHAT_ID is not set")?;

        let base = get("LOGINGUARD_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.into());
        let api_base_url = url::Url::parse(&base)
            .with_context(|| format!("LOGINGUARD_API_BASE_URL is not a valid URL: {base}"))?;
        if !matches!(api_base_url.scheme(), "http" | "https") {
            bail!("LOGINGUARD_API_BASE_URL must be http or https: {base}");
        }

        let bucket_capacity: f64 = parse_or(&get, "LOGINGUARD_BUCKET_CAPACITY", 3.0)?;
        let bucket_fill_rate: f64 = parse_or(&get, "LOGINGUARD_BUCKET_FILL_RATE", 1.0)?;
        if !(bucket_capacity.is_finite() && bucket_capacity >= 1.0) {
            bail!("LOGINGUARD_BUCKET_CAPACITY must be at least 1, got {bucket_capacity}");
        }
        if !(bucket_fill_rate.is_finite() && bucket_fill_rate >= 0.0) {
            bail!("LOGINGUARD_BUCKET_FILL_RATE must be non-negative, got {bucket_fill_rate}");
        }

        let defaults = ReplyOptions::default();
        let reply_options = ReplyOptions {
            approve: get("LOGINGUARD_APPROVE_LABEL").unwrap_or(defaults.approve),
            deny: get("LOGINGUARD_DENY_LABEL").unwrap_or(defaults.deny),
        };
        if reply_options.approve.eq_ignore_ascii_case(&reply_options.deny) {
            bail!("approve and deny labels must differ");
        }

        let trusted_networks = get("LOGINGUARD_TRUSTED_NETWORKS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<TrustedSource>()
                    .map_err(|e| anyhow::anyhow!("LOGINGUARD_TRUSTED_NETWORKS: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let timeout = get("LOGINGUARD_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("LOGINGUARD_TIMEOUT_SECS: invalid value {v:?}"))
            })
            .transpose()?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Config {
            telegram_token: Zeroizing::new(telegram_token),
            chat_id,
            api_base_url,
            parse_mode: get("LOGINGUARD_PARSE_MODE"),
            bucket_capacity,
            bucket_fill_rate,
            reply_options,
            force_bypass: parse_flag(get("LOGINGUARD_FORCE").as_deref())
                .context("LOGINGUARD_FORCE")?,
            trusted_networks,
            poll_interval: millis_or(&get, "LOGINGUARD_POLL_INTERVAL_MS", 1000)?,
            retry_interval: millis_or(&get, "LOGINGUARD_RETRY_INTERVAL_MS", 1000)?,
            rate_limit_interval: millis_or(&get, "LOGINGUARD_RATE_LIMIT_INTERVAL_MS", 1000)?,
            timeout,
            finalize_attempts: parse_or(&get, "LOGINGUARD_FINALIZE_ATTEMPTS", 3u32)?.max(1),
            finalize_grace: millis_or(&get, "LOGINGUARD_FINALIZE_GRACE_MS", 10_000)?,
            log_file: get("LOGINGUARD_LOG_FILE"),
        })
    }

    pub fn gate_settings(&self, host: HostInfo) -> GateSettings {
        GateSettings {
            reply_options: self.reply_options.clone(),
            poll_interval: self.poll_interval,
            rate_limit_interval: self.rate_limit_interval,
            retry: RetryPolicy::unbounded(self.retry_interval),
            finalize_attempts: self.finalize_attempts,
            finalize_grace: self.finalize_grace,
            bypass: BypassPolicy {
                force: self.force_bypass,
                trusted: self.trusted_networks.clone(),
            },
            host,
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}: invalid value {v:?}: {e}")),
        None => Ok(default),
    }
}

fn millis_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> anyhow::Result<Duration> {
    let ms: u64 = parse_or(get, key, default)?;
    if ms == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_millis(ms))
}

fn parse_flag(value: Option<&str>) -> anyhow::Result<bool> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => bail!("expected a boolean, got {other:?}"),
    }
}

/// Read `.env` (explicit path, else the working directory) and then the
/// process environment.
pub fn load(env_file: Option<&Path>) -> anyhow::Result<Config> {
    match env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to read env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    Config::from_lookup(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let mut env: HashMap<String, String> = [
            ("LOGINGUARD_TELEGRAM_TOKEN", "123:abc"),
            ("LOGINGUARD_CHAT_ID", "4242"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            env.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bucket_capacity, 3.0);
        assert_eq!(cfg.bucket_fill_rate, 1.0);
        assert_eq!(cfg.reply_options, ReplyOptions::default());
        assert!(!cfg.force_bypass);
        assert!(cfg.trusted_networks.is_empty());
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.retry_interval, Duration::from_secs(1));
        assert_eq!(cfg.timeout, None);
        assert_eq!(cfg.finalize_grace, Duration::from_secs(10));
        assert_eq!(cfg.api_base_url.as_str(), "https://api.telegram.org/");
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let err = Config::from_lookup(|k| (k == "LOGINGUARD_CHAT_ID").then(|| "1".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("LOGINGUARD_TELEGRAM_TOKEN"));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("LOGINGUARD_BUCKET_CAPACITY", "5"),
            ("LOGINGUARD_BUCKET_FILL_RATE", "0.5"),
            ("LOGINGUARD_APPROVE_LABEL", "Allow"),
            ("LOGINGUARD_DENY_LABEL", "Block"),
            ("LOGINGUARD_FORCE", "true"),
            ("LOGINGUARD_TRUSTED_NETWORKS", "10.0.0.0/8, 192.168.1. ,"),
            ("LOGINGUARD_POLL_INTERVAL_MS", "250"),
            ("LOGINGUARD_TIMEOUT_SECS", "120"),
        ])
        .unwrap();

        assert_eq!(cfg.bucket_capacity, 5.0);
        assert_eq!(cfg.bucket_fill_rate, 0.5);
        assert_eq!(cfg.reply_options.approve, "Allow");
        assert!(cfg.force_bypass);
        assert_eq!(cfg.trusted_networks.len(), 2);
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.timeout, Some(Duration::from_secs(120)));

        let settings = cfg.gate_settings(HostInfo::default());
        assert!(settings.bypass.force);
        assert_eq!(settings.retry.max_attempts, None);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(config(&[("LOGINGUARD_BUCKET_CAPACITY", "0")]).is_err());
        assert!(config(&[("LOGINGUARD_BUCKET_FILL_RATE", "-1")]).is_err());
        assert!(config(&[("LOGINGUARD_FORCE", "maybe")]).is_err());
        assert!(config(&[("LOGINGUARD_POLL_INTERVAL_MS", "0")]).is_err());
        assert!(config(&[("LOGINGUARD_TRUSTED_NETWORKS", "10.0.0.0/40")]).is_err());
        assert!(config(&[("LOGINGUARD_APPROVE_LABEL", "no")]).is_err());
        assert!(config(&[("LOGINGUARD_API_BASE_URL", "ftp://example.com")]).is_err());
        assert!(config(&[("LOGINGUARD_TIMEOUT_SECS", "soon")]).is_err());
    }

    #[test]
    fn test_huge_durations_load_without_overflow() {
        let cfg = config(&[
            ("LOGINGUARD_TIMEOUT_SECS", "18446744073709551615"),
            ("LOGINGUARD_FINALIZE_GRACE_MS", "18446744073709551615"),
        ])
        .unwrap();
        let timeout = cfg.timeout.unwrap();
        let cancel = crate::cancel::Cancellation::never().with_timeout(timeout);
        assert_eq!(cancel.deadline(), None);
        assert_eq!(cfg.finalize_grace, Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_debug_redacts_token() {
        let cfg = config(&[]).unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("123:abc"));
        assert!(rendered.contains("<redacted>"));
    }
}
