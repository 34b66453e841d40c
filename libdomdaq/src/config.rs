use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{ConfigError, TimeCalibratorError};
use super::time_calibrator::TcalFormat;

/// Structure representing the application configuration. Contains the input files and
/// decoding options. Configs are serializable and deserializable to YAML using serde
/// and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub payload_paths: Vec<PathBuf>,
    pub tcal_path: Option<PathBuf>,
    /// 0: legacy, 1: South Pole with GPS, 2: DOMHub
    pub tcal_format: u8,
    /// The GPS string carries no year; this one is assumed
    pub year: i32,
    pub hit_path: Option<PathBuf>,
    pub decode_waveforms: bool,
    /// Stop each payload file after this many payloads
    pub max_records: Option<u64>,
    pub summary_path: Option<PathBuf>,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty
    fn default() -> Self {
        Self {
            payload_paths: Vec::new(),
            tcal_path: None,
            tcal_format: 1,
            year: 1970,
            hit_path: None,
            decode_waveforms: false,
            max_records: None,
            summary_path: None,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Check that there is something to process and that every input exists
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payload_paths.is_empty() && self.hit_path.is_none() {
            return Err(ConfigError::NoPayloadFiles);
        }
        let inputs = self
            .payload_paths
            .iter()
            .chain(self.tcal_path.iter())
            .chain(self.hit_path.iter());
        for path in inputs {
            if !path.exists() {
                return Err(ConfigError::BadFilePath(path.clone()));
            }
        }
        Ok(())
    }

    pub fn get_tcal_format(&self) -> Result<TcalFormat, TimeCalibratorError> {
        TcalFormat::try_from(self.tcal_format)
    }

    pub fn has_calibration(&self) -> bool {
        self.tcal_path.is_some()
    }

    /// Per-file payload limit, unlimited when unset
    pub fn record_limit(&self) -> u64 {
        self.max_records.unwrap_or(u64::MAX)
    }
}
