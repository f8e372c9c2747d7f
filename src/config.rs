use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::source::SourceConfig;

const DEFAULT_DEVICE: &str = "0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_STOP_GRACE_MS: u64 = 100;
const MAX_STOP_GRACE_MS: u64 = 10_000;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    device: Option<String>,
    resolution: Option<ResolutionConfigFile>,
    stop_grace_ms: Option<u64>,
    stats: Option<StatsConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolutionConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    path: Option<PathBuf>,
}

/// Settings for the `capture` binary.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub source: SourceConfig,
    /// How often running stats are logged.
    pub stats_interval: Duration,
    /// Where the last frame is written on shutdown, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

impl CaptureConfig {
    /// Load from the file named by `CAPTURE_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from `path` (if given), then apply env overrides.
    ///
    /// Files ending in `.toml` are parsed as TOML, anything else as JSON.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let source = SourceConfig {
            device: file
                .device
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            width: file
                .resolution
                .as_ref()
                .and_then(|res| res.width)
                .unwrap_or(DEFAULT_WIDTH),
            height: file
                .resolution
                .as_ref()
                .and_then(|res| res.height)
                .unwrap_or(DEFAULT_HEIGHT),
            stop_grace: Duration::from_millis(
                file.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
            ),
        };
        let stats_interval = Duration::from_secs(
            file.stats
                .and_then(|stats| stats.interval_secs)
                .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
        );
        let snapshot_path = file.snapshot.and_then(|snapshot| snapshot.path);
        Self {
            source,
            stats_interval,
            snapshot_path,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("CAPTURE_DEVICE") {
            if !device.trim().is_empty() {
                self.source.device = device.trim().to_string();
            }
        }
        if let Some(width) = env_number("CAPTURE_WIDTH")? {
            self.source.width = width;
        }
        if let Some(height) = env_number("CAPTURE_HEIGHT")? {
            self.source.height = height;
        }
        if let Some(grace) = env_number("CAPTURE_STOP_GRACE_MS")? {
            self.source.stop_grace = Duration::from_millis(grace as u64);
        }
        if let Ok(path) = std::env::var("CAPTURE_SNAPSHOT_PATH") {
            if !path.trim().is_empty() {
                self.snapshot_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!(
                "resolution must be non-zero, got {}x{}",
                self.source.width,
                self.source.height
            ));
        }
        if self.source.stop_grace > Duration::from_millis(MAX_STOP_GRACE_MS) {
            return Err(anyhow!(
                "stop grace must be at most {} ms",
                MAX_STOP_GRACE_MS
            ));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be a non-negative integer", key))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path.extension().map_or(false, |ext| ext == "toml");
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_a_plain_webcam() {
        let cfg = CaptureConfig::from_file(CaptureConfigFile::default());
        assert_eq!(cfg.source.device, "0");
        assert_eq!((cfg.source.width, cfg.source.height), (640, 480));
        assert_eq!(cfg.source.stop_grace, Duration::from_millis(100));
        assert_eq!(cfg.stats_interval, Duration::from_secs(5));
        assert!(cfg.snapshot_path.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_resolution() {
        let mut cfg = CaptureConfig::from_file(CaptureConfigFile::default());
        cfg.source.height = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_excessive_stop_grace() {
        let mut cfg = CaptureConfig::from_file(CaptureConfigFile::default());
        cfg.source.stop_grace = Duration::from_secs(60);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_toml_sections() {
        let file: CaptureConfigFile = toml::from_str(
            r#"
            device = "stub://pattern"
            stop_grace_ms = 250

            [resolution]
            width = 320
            height = 240
            "#,
        )
        .unwrap();
        let cfg = CaptureConfig::from_file(file);
        assert_eq!(cfg.source.device, "stub://pattern");
        assert_eq!((cfg.source.width, cfg.source.height), (320, 240));
        assert_eq!(cfg.source.stop_grace, Duration::from_millis(250));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<CaptureConfigFile, _> =
            serde_json::from_str(r#"{"device": "0", "fps": 30}"#);
        assert!(parsed.is_err());
    }
}
