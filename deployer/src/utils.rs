//! Utility functions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version information for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff between step retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownOptions {
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl CooldownOptions {
    /// Reject multipliers that would shrink, flip sign or poison the delay
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.multiplier
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            ));
        }
        Ok(())
    }
}

/// Calculate exponential backoff delay
///
/// Always within `0..=max_delay`, even for options that fail `validate`.
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let max_secs = options.max_delay.as_secs_f64();
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = if delay_secs.is_nan() {
        max_secs
    } else {
        delay_secs.clamp(0.0, max_secs)
    };
    Duration::from_secs_f64(capped_delay)
}

/// Calculate SHA256 hash of data
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Keep at most `limit` trailing bytes of `text`, cut on a char boundary
pub fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Hex encoding utilities
pub mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }

    /// Decode a hex string; an optional `0x` prefix is accepted
    pub fn decode(text: &str) -> Result<Vec<u8>, String> {
        let digits = text.trim();
        let digits = digits.strip_prefix("0x").unwrap_or(digits);
        if digits.len() % 2 != 0 {
            return Err("odd number of hex digits".to_string());
        }
        digits
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                let hi = nibble(pair[0])?;
                let lo = nibble(pair[1])?;
                Ok((hi << 4) | lo)
            })
            .collect()
    }

    fn nibble(c: u8) -> Result<u8, String> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(format!("invalid hex digit '{}'", c as char)),
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
