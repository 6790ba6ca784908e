// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Configuration for the MIDIO command-line tool.
//!
//! A small YAML document selects the devices to use and the initial
//! playback parameters. Everything has a default, so an empty document is
//! a valid configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Engine settings loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Initial tempo-scale multiplier (0 pauses dispatch)
    #[serde(default = "default_tempo_scale")]
    pub tempo_scale: f64,
    /// Whether overlapping note-ons retrigger cleanly
    #[serde(default = "default_retrigger")]
    pub retrigger: bool,
    /// Preferred output device, matched by substring against device names
    #[serde(default)]
    pub output_device: Option<String>,
    /// Preferred input device, matched by substring against device names
    #[serde(default)]
    pub input_device: Option<String>,
    /// Log filter directive (e.g. "midio=debug")
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_tempo_scale() -> f64 {
    1.0
}
fn default_retrigger() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tempo_scale: default_tempo_scale(),
            retrigger: default_retrigger(),
            output_device: None,
            input_device: None,
            log_filter: None,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&contents)
    }

    /// Parse a configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Serialize to a YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration to YAML")
    }

    /// Save the configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = self.to_yaml()?;
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))
    }

    /// Find a device index by case-insensitive substring match.
    pub fn resolve_device(names: &[String], wanted: &str) -> Option<i32> {
        let wanted = wanted.to_lowercase();
        names
            .iter()
            .position(|name| name.to_lowercase().contains(&wanted))
            .map(|i| i as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.tempo_scale, 1.0);
        assert!(config.retrigger);
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig {
            tempo_scale: 0.5,
            retrigger: false,
            output_device: Some("IAC".to_string()),
            input_device: None,
            log_filter: Some("midio=debug".to_string()),
        };
        let yaml = config.to_yaml().unwrap();
        let parsed = EngineConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_yaml("tempo_scale: 2.0\n").unwrap();
        assert_eq!(config.tempo_scale, 2.0);
        assert!(config.retrigger);
        assert!(config.output_device.is_none());
    }

    #[test]
    fn test_resolve_device() {
        let names = vec![
            "14:0 Midi Through Port-0".to_string(),
            "20:0 (Synth) Synth MIDI 1".to_string(),
        ];
        assert_eq!(EngineConfig::resolve_device(&names, "synth"), Some(1));
        assert_eq!(EngineConfig::resolve_device(&names, "through"), Some(0));
        assert_eq!(EngineConfig::resolve_device(&names, "missing"), None);
    }
}
