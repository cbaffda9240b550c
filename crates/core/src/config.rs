use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::{HoundError, Result};

pub const API_URL_ENV: &str = "HOUND_API_URL";
pub const PROTOCOL_ENV: &str = "HOUND_PROTOCOL";
pub const ILLUSTRATIVE_OVERLAY_ENV: &str = "HOUND_ILLUSTRATIVE_OVERLAY";
pub const FFMPEG_ENV: &str = "HOUND_FFMPEG";
pub const FFPROBE_ENV: &str = "HOUND_FFPROBE";

/// How the analysis endpoint delivers its answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// The analysis is the body of the upload response.
    #[default]
    Direct,
    /// The upload returns a job id that is polled until it finishes.
    Queued,
}

impl Protocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Protocol::Direct),
            "queued" => Some(Protocol::Queued),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub protocol: Protocol,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub synthetic_ramp_ms: u64,
    pub extract_timeout_ms: u64,
    /// Show fixed demonstration markers when the service reports no keypoints.
    pub illustrative_overlay: bool,
    pub default_withers_cm: String,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            protocol: Protocol::Direct,
            poll_interval_ms: 1_000,
            poll_timeout_ms: 900_000,
            request_timeout_ms: None,
            synthetic_ramp_ms: 2_500,
            extract_timeout_ms: 10_000,
            illustrative_overlay: false,
            default_withers_cm: "50".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `HOUND_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, environment or otherwise.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(API_URL_ENV) {
            self.api_base_url = url;
        }
        if let Some(protocol) = lookup(PROTOCOL_ENV) {
            self.protocol = Protocol::parse(&protocol).ok_or_else(|| HoundError::Config {
                key: PROTOCOL_ENV,
                reason: format!("expected \"direct\" or \"queued\", got {protocol:?}"),
            })?;
        }
        if let Some(flag) = lookup(ILLUSTRATIVE_OVERLAY_ENV) {
            self.illustrative_overlay = parse_flag(&flag).ok_or_else(|| HoundError::Config {
                key: ILLUSTRATIVE_OVERLAY_ENV,
                reason: format!("expected a boolean, got {flag:?}"),
            })?;
        }
        if let Some(bin) = lookup(FFMPEG_ENV) {
            self.ffmpeg_bin = bin;
        }
        if let Some(bin) = lookup(FFPROBE_ENV) {
            self.ffprobe_bin = bin;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.api_base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(HoundError::Config {
                key: "api_base_url",
                reason: format!("must start with http:// or https://, got {url:?}"),
            });
        }
        if self.synthetic_ramp_ms == 0 {
            return Err(HoundError::Config {
                key: "synthetic_ramp_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.extract_timeout_ms == 0 {
            return Err(HoundError::Config {
                key: "extract_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(HoundError::Config {
                key: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    pub fn synthetic_ramp(&self) -> Duration {
        Duration::from_millis(self.synthetic_ramp_ms)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Root directory for frames written by front ends.
pub fn get_root_output_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("houndforward")
}
