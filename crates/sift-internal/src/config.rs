//! The `distributions.toml` configuration file.
//!
//! ```toml
//! epoch = 4
//!
//! [distributions.hirsute]
//! mirror = "https://mirror.example.org/ubuntu"
//! areas = ["", "updates", "security"]
//! components = ["main", "universe"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Re-analysis generation compiled into this build. Bumping it (or setting
/// `epoch` in the config file) forces every package to be reprocessed on the
/// next publisher run.
pub const DEFAULT_EPOCH: i64 = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    epoch: Option<i64>,
    pub distributions: BTreeMap<String, DistroConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistroConfig {
    pub mirror: String,
    pub areas: Vec<String>,
    pub components: Vec<String>,
}

impl Config {
    pub fn epoch(&self) -> i64 {
        self.epoch.unwrap_or(DEFAULT_EPOCH)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    if config.distributions.is_empty() {
        bail!("config file defines no distributions");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_distributions() {
        let config: Config = toml::from_str(
            r#"
            epoch = 7

            [distributions.hirsute]
            mirror = "https://mirror.example.org/ubuntu"
            areas = ["", "updates"]
            components = ["main"]
            "#,
        )
        .unwrap();
        assert_eq!(7, config.epoch());
        let hirsute = &config.distributions["hirsute"];
        assert_eq!("https://mirror.example.org/ubuntu", hirsute.mirror);
        assert_eq!(vec!["", "updates"], hirsute.areas);
    }

    #[test]
    fn epoch_defaults_when_absent() {
        let config: Config = toml::from_str(
            r#"
            [distributions.hirsute]
            mirror = "https://mirror.example.org/ubuntu"
            areas = [""]
            components = ["main"]
            "#,
        )
        .unwrap();
        assert_eq!(DEFAULT_EPOCH, config.epoch());
    }
}
