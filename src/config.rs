use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How far a close inspection reaches in each direction.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InspectionSpan {
    /// As many sectors as the source file has.
    #[default]
    Full,
    /// Half of that.
    Half,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct EarlyAbortConfig {
    pub min_sectors: u64,
    pub min_hit_rate: f64,
}

impl EarlyAbortConfig {
    pub fn should_abort(&self, sectors_scanned: u64, successes: u64) -> bool {
        if sectors_scanned == 0 || sectors_scanned < self.min_sectors {
            return false;
        }
        (successes as f64 / sectors_scanned as f64) < self.min_hit_rate
    }
}

/// Tunables consumed by the scanning engine.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScanSettings {
    pub inspection_span: InspectionSpan,
    pub meaningless_recheck_streak: u64,
    pub early_abort: Option<EarlyAbortConfig>,
    pub chain_inspections: bool,
    pub chain_min_hit_rate: f64,
    pub wrap_around: bool,
    pub skim_sample_size: u64,
    pub inspection_sample_size: u64,
    pub calibration_samples: u64,
    pub inspection_throttle_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            inspection_span: InspectionSpan::Full,
            meaningless_recheck_streak: 2,
            early_abort: None,
            chain_inspections: false,
            chain_min_hit_rate: 0.4,
            wrap_around: true,
            skim_sample_size: 100,
            inspection_sample_size: 1000,
            calibration_samples: 100,
            inspection_throttle_ms: 0,
        }
    }
}

impl ScanSettings {
    /// Sectors each inspection reader scans for a file of `total_sectors`.
    pub fn sector_limit(&self, total_sectors: u64) -> u64 {
        match self.inspection_span {
            InspectionSpan::Full => total_sectors.max(1),
            InspectionSpan::Half => (total_sectors / 2).max(1),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub run_id: String,
    pub max_source_bytes: u64,
    #[serde(flatten)]
    pub scan: ScanSettings,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.run_id.trim().is_empty() {
        config.run_id = generate_run_id();
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), rand_suffix())
}

fn rand_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}
