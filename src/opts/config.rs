use std::fs::read_to_string;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use super::cli::Window;
use crate::utils;

#[derive(Deserialize, Debug, PartialEq)]
pub struct Concurrency(pub usize);

impl Default for Concurrency {
    fn default() -> Self {
        Self(3)
    }
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct VerifyConcurrency(pub usize);

impl Default for VerifyConcurrency {
    fn default() -> Self {
        Self(5)
    }
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LogRetentionDays(pub u32);

impl Default for LogRetentionDays {
    fn default() -> Self {
        Self(14)
    }
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct MultipartThresholdMib(pub u64);

impl Default for MultipartThresholdMib {
    fn default() -> Self {
        Self(50)
    }
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct PartSizeMib(pub u64);

impl Default for PartSizeMib {
    fn default() -> Self {
        Self(10)
    }
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct MaxPartRetries(pub u32);

impl Default for MaxPartRetries {
    fn default() -> Self {
        Self(3)
    }
}

/// The process-wide periodic backup, off unless configured
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PeriodicSection {
    /// One of `6h`, `12h`, `daily`, `every-2-days`, `weekly`
    pub preset: Option<String>,
    /// Preferred hour window, e.g. `"22-6"`
    pub window: Option<Window>,
    pub requires_charging: bool,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub concurrency: Concurrency,
    pub verify_concurrency: VerifyConcurrency,
    pub log_retention_days: LogRetentionDays,
    pub encrypt: bool,
    pub obfuscate_filenames: bool,
    pub multipart_threshold_mib: MultipartThresholdMib,
    pub part_size_mib: PartSizeMib,
    pub max_part_retries: MaxPartRetries,
    pub periodic: Option<PeriodicSection>,
}

impl Config {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let config_content = read_to_string(path).context(format!(
            "Failed to read configuration file at '{}'",
            path.display()
        ))?;

        Ok(toml::from_str(&config_content)?)
    }

    pub fn load_from_system() -> anyhow::Result<Self> {
        let config_dir =
            utils::snapvault_config_dir().context("Failed to find the configuration directory")?;

        let config_path = config_dir.join("snapvault.toml");

        if !config_path.is_file() {
            return Ok(Self::default());
        }

        Self::load_from_file(&config_path)
    }

    pub fn create_default_config(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating config dir at: {}", parent.display()))?;
        }
        std::fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed writing default config to: {}", path.display()))
    }
}

const DEFAULT_CONFIG: &str = "\
# snapvault configuration

# Transfer workers per backup run (1-10)
#concurrency = 3

# Workers per verification scan
#verify-concurrency = 5

# Days to keep logs and finished jobs around
#log-retention-days = 14

# Encrypt files before uploading (requires `snapvault encryption setup`)
#encrypt = false

# Replace filenames with random identifiers on the destination
#obfuscate-filenames = false

# Object-store uploads at or past this size take the multipart path
#multipart-threshold-mib = 50
#part-size-mib = 10
#max-part-retries = 3

# Uncomment to run a full-library backup of every destination on a cadence
#[periodic]
#preset = \"daily\"
#window = \"22-6\"
#requires-charging = false
";
