//! Simulation profiles and persistence snapshots.
//!
//! A profile is the TOML document the kernel is constructed from. The
//! snapshot is the serializable view of a running simulation handed to the
//! external persistence collaborator; the simulator itself never reads
//! snapshots back.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read profile {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse profile {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid profile: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationProfile {
    /// Human-readable simulation title.
    #[serde(default = "default_title")]
    pub title: String,
    /// Propagation policy identifier. "full-coverage" is built in.
    #[serde(default = "default_medium")]
    pub radio_medium: String,
    /// Simulated-to-real time ratio; absent means unlimited.
    #[serde(default)]
    pub speed_limit: Option<f64>,
    /// Explicit random seed; absent means generate one at construction.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Upper bound of the random per-mote boot delay (microseconds).
    #[serde(default = "default_startup_delay")]
    pub mote_startup_delay_us: u64,
    /// Fast non-interactive setup (test runs) instead of interactive.
    #[serde(default)]
    pub quick_setup: bool,
    /// External compiler used for firmware adapter builds.
    #[serde(default = "default_compiler")]
    pub compiler: String,
    /// Extra flags appended to every adapter build.
    #[serde(default)]
    pub extra_cflags: Vec<String>,
}

fn default_title() -> String {
    "simulation".to_string()
}

fn default_medium() -> String {
    "full-coverage".to_string()
}

fn default_startup_delay() -> u64 {
    // One simulated second of boot-time clock drift.
    1_000_000
}

fn default_compiler() -> String {
    "cc".to_string()
}

impl Default for SimulationProfile {
    fn default() -> Self {
        SimulationProfile {
            title: default_title(),
            radio_medium: default_medium(),
            speed_limit: None,
            seed: None,
            mote_startup_delay_us: default_startup_delay(),
            quick_setup: false,
            compiler: default_compiler(),
            extra_cflags: Vec::new(),
        }
    }
}

impl SimulationProfile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let profile: SimulationProfile =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = self.speed_limit {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "speed_limit must be a positive ratio, got {limit}"
                )));
            }
        }
        if self.title.is_empty() {
            return Err(ConfigError::Invalid("title must not be empty".into()));
        }
        Ok(())
    }
}

/// How the simulation's seed was chosen.
#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SeedSetting {
    Generated { value: u64 },
    Explicit { value: u64 },
}

#[derive(Serialize)]
pub struct MediumSnapshot {
    pub name: String,
    pub config: serde_json::Value,
    pub stats: crate::radio::medium::MediumStats,
}

#[derive(Serialize)]
pub struct MoteTypeSnapshot {
    pub name: String,
    /// Communicator slot index for firmware types.
    pub slot: u32,
}

#[derive(Serialize)]
pub struct MoteSnapshot {
    pub id: u32,
    pub mote_type: String,
    pub channel: i32,
}

/// Serializable view of a whole simulation for the persistence collaborator.
#[derive(Serialize)]
pub struct SimulationSnapshot {
    pub title: String,
    /// `null` means unlimited.
    pub speed_limit: Option<f64>,
    pub seed: SeedSetting,
    pub mote_startup_delay_us: u64,
    pub radio_medium: MediumSnapshot,
    pub mote_types: Vec<MoteTypeSnapshot>,
    pub motes: Vec<MoteSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_profile_uses_defaults() {
        let profile: SimulationProfile = toml::from_str("").unwrap();
        assert_eq!(profile.title, "simulation");
        assert_eq!(profile.radio_medium, "full-coverage");
        assert!(profile.speed_limit.is_none());
        assert!(profile.seed.is_none());
        assert_eq!(profile.mote_startup_delay_us, 1_000_000);
        assert!(!profile.quick_setup);
        assert_eq!(profile.compiler, "cc");
    }

    #[test]
    fn full_profile_parses() {
        let profile: SimulationProfile = toml::from_str(
            r#"
            title = "two node exchange"
            radio_medium = "full-coverage"
            speed_limit = 1.0
            seed = 12345
            mote_startup_delay_us = 0
            quick_setup = true
            compiler = "gcc"
            extra_cflags = ["-O1"]
            "#,
        )
        .unwrap();
        assert_eq!(profile.title, "two node exchange");
        assert_eq!(profile.speed_limit, Some(1.0));
        assert_eq!(profile.seed, Some(12345));
        assert!(profile.quick_setup);
        assert_eq!(profile.extra_cflags, vec!["-O1".to_string()]);
        profile.validate().unwrap();
    }

    #[test]
    fn non_positive_speed_limit_is_rejected() {
        let profile = SimulationProfile {
            speed_limit: Some(0.0),
            ..SimulationProfile::default()
        };
        assert!(matches!(profile.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn seed_setting_serializes_tagged() {
        let json = serde_json::to_value(SeedSetting::Generated { value: 7 }).unwrap();
        assert_eq!(json["source"], "generated");
        assert_eq!(json["value"], 7);
        let json = serde_json::to_value(SeedSetting::Explicit { value: 9 }).unwrap();
        assert_eq!(json["source"], "explicit");
    }
}
