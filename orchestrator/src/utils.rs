//! Utility functions

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::WfError;

/// Version information for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub git_commit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_tag: String,
    pub git_tree_state: String,
    pub build_date: String,
}

fn stamped(value: Option<&'static str>) -> String {
    value.filter(|v| !v.is_empty()).unwrap_or("unknown").to_string()
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_commit: stamped(option_env!("ARGOFLOW_GIT_COMMIT")),
        git_tag: option_env!("ARGOFLOW_GIT_TAG").unwrap_or_default().to_string(),
        git_tree_state: stamped(option_env!("ARGOFLOW_GIT_TREE_STATE")),
        build_date: stamped(option_env!("ARGOFLOW_BUILD_DATE")),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempts before giving up; zero retries forever
    pub max_attempts: u32,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Run `op` until it succeeds, the error is not retriable, or attempts run out
pub async fn retry_on_error<T, Op, Fut, P>(
    options: &CooldownOptions,
    retriable: P,
    mut op: Op,
) -> Result<T, WfError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WfError>>,
    P: Fn(&WfError) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !retriable(&e) || (options.max_attempts > 0 && attempt >= options.max_attempts) {
                    return Err(e);
                }
                let wait = calc_exp_backoff(options, attempt - 1);
                warn!("retrying in {:?} after error (attempt {}): {}", wait, attempt, e);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// 32-bit FNV-1a hash
pub fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Calculate SHA256 hash of data
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Parse a Go-style duration (`1h30m`, `500ms`, `30s`) or bare seconds
pub fn parse_duration(text: &str) -> Result<Duration, WfError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(WfError::BadRequest("empty duration".to_string()));
    }
    if let Ok(secs) = text.parse::<f64>() {
        if secs < 0.0 {
            return Err(WfError::BadRequest(format!("negative duration: {}", text)));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| WfError::BadRequest(format!("missing unit in duration: {}", text)))?;
        if num_len == 0 {
            return Err(WfError::BadRequest(format!("invalid duration: {}", text)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| WfError::BadRequest(format!("invalid duration: {}", text)))?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => {
                return Err(WfError::BadRequest(format!(
                    "unknown unit '{}' in duration: {}",
                    unit, text
                )))
            }
        };
        total += value * factor;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// Format a duration the way Go prints one, e.g. `1m30s`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        let millis = duration.as_millis();
        return if millis == 0 { "0s".to_string() } else { format!("{}ms", millis) };
    }
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    out.push_str(&format!("{}s", s));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exp_backoff() {
        let options = CooldownOptions::default();

        assert_eq!(calc_exp_backoff(&options, 0), Duration::from_secs(1));
        assert_eq!(calc_exp_backoff(&options, 1), Duration::from_secs(2));
        assert_eq!(calc_exp_backoff(&options, 2), Duration::from_secs(4));
        assert_eq!(calc_exp_backoff(&options, 10), Duration::from_secs(30)); // capped
    }

    #[test]
    fn test_version_info_is_stamped() {
        let version = version_info();
        assert_eq!(version.version, env!("CARGO_PKG_VERSION"));
        assert!(["clean", "dirty", "unknown"].contains(&version.git_tree_state.as_str()));
        assert!(chrono::DateTime::parse_from_rfc3339(&version.build_date).is_ok());

        let rendered = serde_json::to_value(&version).unwrap();
        assert!(rendered.get("gitCommit").is_some());
        assert!(rendered.get("buildDate").is_some());
    }

    #[test]
    fn test_fnv32a() {
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
    }

    #[tokio::test]
    async fn test_retry_on_error_gives_up_on_permanent_errors() {
        let options = CooldownOptions {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let mut calls = 0;
        let result: Result<(), WfError> = retry_on_error(&options, WfError::is_transient, || {
            calls += 1;
            async { Err(WfError::BadRequest("nope".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_on_error_retries_transient() {
        let options = CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_attempts: 3,
            ..Default::default()
        };
        let mut calls = 0;
        let result: Result<u32, WfError> = retry_on_error(&options, WfError::is_transient, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(WfError::Transient("later".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
