use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub statistics: Statistics,
    #[serde(default)]
    pub scan_types: ScanTypes,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Default::default(),
            tracker: Default::default(),
            statistics: Default::default(),
            scan_types: Default::default(),
            logging: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub dataset: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            dataset: "secmap.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Picked-up items older than this go back to requested.
    pub pickup_timeout_minutes: u64,
    /// Finished items older than this are purged.
    pub finished_retention_days: u64,
}
impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            pickup_timeout_minutes: 24 * 60,
            finished_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    /// How many trailing days to recompute per run. Two covers results that
    /// straddled midnight during the previous run.
    pub days: u32,
}
impl Default for Statistics {
    fn default() -> Self {
        Self { days: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTypes {
    pub endpoint_level: Vec<String>,
    pub url_level: Vec<String>,
}
impl Default for ScanTypes {
    fn default() -> Self {
        Self {
            endpoint_level: vec![
                "tls".into(),
                "security_headers".into(),
                "plain_https".into(),
                "ftp".into(),
            ],
            url_level: vec![
                "dnssec".into(),
                "internet_nl_web".into(),
                "internet_nl_mail".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
