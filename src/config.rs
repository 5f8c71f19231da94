use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::rules::{Rule, RuleSet, default_maybe_rules, default_qc_rules};

pub const DEFAULT_CONFIG_FILE: &str = "ms2-filter.json";
pub const DEFAULT_CONVERTER_IMAGE: &str = "chambm/pwiz-skyline-i-agree-to-the-vendor-licenses";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub enable_conversion: Option<bool>,
    #[serde(default)]
    pub max_files_per_study: Option<usize>,
    #[serde(default)]
    pub admission_order: Option<AdmissionOrder>,
    #[serde(default)]
    pub study_workers: Option<usize>,
    #[serde(default)]
    pub file_workers: Option<usize>,
    #[serde(default)]
    pub max_concurrent_conversions: Option<usize>,
    #[serde(default)]
    pub listing_timeout_secs: Option<u64>,
    #[serde(default)]
    pub stream_timeout_secs: Option<u64>,
    #[serde(default)]
    pub conversion_timeout_secs: Option<u64>,
    #[serde(default)]
    pub converter_image: Option<String>,
    #[serde(default)]
    pub qc_rules: Option<Vec<RuleEntry>>,
    #[serde(default)]
    pub maybe_rules: Option<Vec<RuleEntry>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RuleEntry {
    Shorthand(String),
    Detailed(Rule),
}

impl RuleEntry {
    fn into_rule(self) -> Rule {
        match self {
            RuleEntry::Shorthand(value) => Rule::from_shorthand(&value),
            RuleEntry::Detailed(rule) => rule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOrder {
    #[default]
    Listing,
    SignalStrength,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub listing: Duration,
    pub stream: Duration,
    pub conversion: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            listing: Duration::from_secs(600),
            stream: Duration::from_secs(3600),
            conversion: Duration::from_secs(7200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub enable_conversion: bool,
    pub max_files_per_study: usize,
    pub admission_order: AdmissionOrder,
    pub study_workers: usize,
    pub file_workers: usize,
    pub max_concurrent_conversions: usize,
    pub timeouts: Timeouts,
    pub converter_image: String,
    pub qc_rules: RuleSet,
    pub maybe_rules: RuleSet,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `ms2-filter.json` from the working directory. A
    /// missing default file yields the built-in configuration.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, FilterError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }
        if !config_path.exists() {
            return Err(FilterError::ConfigRead(config_path));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| FilterError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| FilterError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, FilterError> {
        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            listing: config
                .listing_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.listing),
            stream: config
                .stream_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream),
            conversion: config
                .conversion_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.conversion),
        };

        let qc_rules = match config.qc_rules {
            Some(entries) => entries.into_iter().map(RuleEntry::into_rule).collect(),
            None => default_qc_rules(),
        };
        let maybe_rules = match config.maybe_rules {
            Some(entries) => entries.into_iter().map(RuleEntry::into_rule).collect(),
            None => default_maybe_rules(),
        };

        Ok(ResolvedConfig {
            enable_conversion: config.enable_conversion.unwrap_or(false),
            max_files_per_study: config.max_files_per_study.unwrap_or(10),
            admission_order: config.admission_order.unwrap_or_default(),
            study_workers: config
                .study_workers
                .unwrap_or_else(default_study_workers)
                .max(1),
            file_workers: config.file_workers.unwrap_or(4).max(1),
            max_concurrent_conversions: config.max_concurrent_conversions.unwrap_or(1).max(1),
            timeouts,
            converter_image: config
                .converter_image
                .unwrap_or_else(|| DEFAULT_CONVERTER_IMAGE.to_string()),
            qc_rules: RuleSet::compile(&qc_rules)?,
            maybe_rules: RuleSet::compile(&maybe_rules)?,
        })
    }
}

pub fn default_study_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(1);
    (cpus / 2).clamp(1, 4)
}
