//! Configuration management for rtc-helper

use crate::engine::BitrateBounds;
use crate::session::SessionDefaults;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Statistics polling
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One STUN/TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// ICE servers handed to every new connection
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// Minimum send bitrate (bps)
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate: u32,

    /// Starting send bitrate (bps)
    #[serde(default = "default_current_bitrate")]
    pub current_bitrate: u32,

    /// Maximum send bitrate (bps)
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: u32,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            min_bitrate: default_min_bitrate(),
            current_bitrate: default_current_bitrate(),
            max_bitrate: default_max_bitrate(),
        }
    }
}

impl WebRTCConfig {
    pub fn bitrate_bounds(&self) -> BitrateBounds {
        BitrateBounds {
            min: self.min_bitrate,
            current: self.current_bitrate,
            max: self.max_bitrate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stats_interval_ms(),
        }
    }
}

impl Config {
    /// Load configuration from file, or defaults when it does not exist
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let webrtc = &self.webrtc;
        if webrtc.min_bitrate == 0 || webrtc.current_bitrate == 0 || webrtc.max_bitrate == 0 {
            return Err("WebRTC bitrates must be non-zero".into());
        }
        if webrtc.min_bitrate > webrtc.current_bitrate {
            return Err("WebRTC min bitrate cannot exceed current bitrate".into());
        }
        if webrtc.current_bitrate > webrtc.max_bitrate {
            return Err("WebRTC current bitrate cannot exceed max bitrate".into());
        }

        for server in &webrtc.ice_servers {
            if server.urls.iter().all(|url| url.trim().is_empty()) {
                return Err("Each ICE server needs at least one URL".into());
            }
        }

        if self.stats.interval_ms == 0 {
            return Err("Stats interval must be non-zero".into());
        }

        Ok(())
    }

    /// Per-session settings derived from this configuration
    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            ice_servers: self.webrtc.ice_servers.clone(),
            bitrate: self.webrtc.bitrate_bounds(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_bitrate() -> u32 { 1_000_000 }
fn default_current_bitrate() -> u32 { 2_000_000 }
fn default_max_bitrate() -> u32 { 4_000_000 }
fn default_stats_interval_ms() -> u64 { 1000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_process_bitrates() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.webrtc.bitrate_bounds(), BitrateBounds::default());
        assert_eq!(cfg.stats.interval_ms, 1000);
    }

    #[test]
    fn validate_rejects_unordered_bitrates() {
        let mut cfg = Config::default();
        cfg.webrtc.min_bitrate = 3_000_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.webrtc.max_bitrate = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_ice_urls() {
        let mut cfg = Config::default();
        cfg.webrtc.ice_servers.push(IceServerConfig {
            urls: vec![" ".to_string()],
            username: None,
            credential: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [webrtc]
            max_bitrate = 6000000

            [[webrtc.ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "user"
            credential = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.webrtc.min_bitrate, 1_000_000);
        assert_eq!(cfg.webrtc.max_bitrate, 6_000_000);
        assert_eq!(cfg.logging.level, "info");

        let defaults = cfg.session_defaults();
        assert_eq!(defaults.ice_servers.len(), 1);
        assert_eq!(defaults.ice_servers[0].username.as_deref(), Some("user"));
        assert_eq!(defaults.bitrate.max, 6_000_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(&PathBuf::from("/nonexistent/rtc-helper.toml")).unwrap();
        assert_eq!(cfg.webrtc.current_bitrate, 2_000_000);
    }
}
