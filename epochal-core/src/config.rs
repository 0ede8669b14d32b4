//! Configuration for training runs.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.

use crate::checkpoint::CheckpointManager;
use crate::error::ConfigError;
use crate::scaler::LossScaleConfig;
use crate::schedule::StepDecay;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Device ids, e.g. `"0"`, `"0,1"` or the inclusive range `"0-3"`.
    /// Bare integers and integer lists are accepted too.
    #[serde(deserialize_with = "device_spec")]
    pub device: Option<String>,
    /// Exclusive upper bound of the epoch loop.
    pub end_epoch: usize,
    /// Resume from the latest checkpoint in the checkpoint directory.
    pub continue_train: bool,
    /// Root directory for checkpoints and logs.
    pub exp_dir: PathBuf,
    pub precision: PrecisionConfig,
    pub lr: LrConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
    pub data: DataConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            device: None,
            end_epoch: 25,
            continue_train: false,
            exp_dir: PathBuf::from("output"),
            precision: PrecisionConfig::default(),
            lr: LrConfig::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
            data: DataConfig::default(),
        }
    }
}

/// Mixed-precision and loss-scale settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub mixed: bool,
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
    pub overflow_warn_streak: usize,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        let scale = LossScaleConfig::default();
        Self {
            mixed: false,
            init_scale: scale.init_scale,
            growth_factor: scale.growth_factor,
            backoff_factor: scale.backoff_factor,
            growth_interval: scale.growth_interval,
            min_scale: scale.min_scale,
            max_scale: scale.max_scale,
            overflow_warn_streak: scale.overflow_warn_streak,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrConfig {
    pub base_lr: f64,
    /// Epochs at which the rate is multiplied by `decay_factor`.
    pub decay_epochs: Vec<usize>,
    pub decay_factor: f64,
}

impl Default for LrConfig {
    fn default() -> Self {
        Self {
            base_lr: 1e-4,
            decay_epochs: Vec::new(),
            decay_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Snapshot directory; `<exp_dir>/model_dump` when unset.
    pub dir: Option<PathBuf>,
    /// Retain only the newest N snapshots.
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSONL file receiving dashboard scalars; disabled when unset.
    pub scalar_log: Option<PathBuf>,
    pub scalar_flush_every: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            scalar_log: None,
            scalar_flush_every: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Batches buffered ahead by the prefetch worker; 0 disables prefetching.
    pub prefetch_depth: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { prefetch_depth: 2 }
    }
}

impl TrainConfig {
    /// Reject configurations that must not reach the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_ids()?;
        let p = &self.precision;
        if !(p.init_scale.is_finite() && p.init_scale > 0.0) {
            return Err(ConfigError::Invalid {
                field: "precision.init_scale".into(),
                reason: format!("must be a positive finite number, got {}", p.init_scale),
            });
        }
        if !(p.min_scale > 0.0 && p.min_scale <= p.max_scale) {
            return Err(ConfigError::Invalid {
                field: "precision.min_scale".into(),
                reason: format!(
                    "must be positive and not above max_scale ({} > {})",
                    p.min_scale, p.max_scale
                ),
            });
        }
        if !(self.lr.base_lr.is_finite() && self.lr.base_lr >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "lr.base_lr".into(),
                reason: format!("must be a non-negative number, got {}", self.lr.base_lr),
            });
        }
        Ok(())
    }

    /// Expanded device ids. Fails with `NoDevice` when none are configured.
    pub fn device_ids(&self) -> Result<Vec<u32>, ConfigError> {
        match self.device.as_deref().map(str::trim) {
            None | Some("") => Err(ConfigError::NoDevice),
            Some(spec) => parse_device_ids(spec),
        }
    }

    pub fn loss_scale(&self) -> LossScaleConfig {
        let p = &self.precision;
        LossScaleConfig {
            init_scale: p.init_scale,
            growth_factor: p.growth_factor,
            backoff_factor: p.backoff_factor,
            growth_interval: p.growth_interval,
            min_scale: p.min_scale,
            max_scale: p.max_scale,
            overflow_warn_streak: p.overflow_warn_streak,
        }
    }

    pub fn lr_schedule(&self) -> StepDecay {
        StepDecay {
            base_lr: self.lr.base_lr,
            decay_epochs: self.lr.decay_epochs.clone(),
            factor: self.lr.decay_factor,
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint
            .dir
            .clone()
            .unwrap_or_else(|| self.exp_dir.join("model_dump"))
    }

    pub fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(self.checkpoint_dir()).with_max_keep(self.checkpoint.max_keep)
    }
}

/// Normalizes `device = 0`, `device = [0, 2]` and `EPOCHAL_DEVICE=0`, which
/// arrive as numbers, into the textual form `parse_device_ids` reads.
fn device_spec<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DeviceSpec {
        Text(String),
        Index(u64),
        List(Vec<u64>),
    }

    let spec = Option::<DeviceSpec>::deserialize(deserializer)?;
    Ok(spec.map(|spec| match spec {
        DeviceSpec::Text(text) => text,
        DeviceSpec::Index(id) => id.to_string(),
        DeviceSpec::List(ids) => ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(","),
    }))
}

/// Parse `"0"`, `"0,2"` or `"0-3"` (inclusive) into device ids.
pub fn parse_device_ids(spec: &str) -> Result<Vec<u32>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDevice {
        spec: spec.to_string(),
        reason,
    };
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|e| invalid(format!("'{}': {e}", s.trim())))
    };

    if let Some((start, end)) = spec.split_once('-') {
        let (start, end) = (parse(start)?, parse(end)?);
        if end < start {
            return Err(invalid(format!("range end {end} is below start {start}")));
        }
        return Ok((start..=end).collect());
    }

    let ids = spec
        .split(',')
        .map(parse)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_epoch: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_train: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "PrecisionOverrides::is_empty")]
    pub precision: PrecisionOverrides,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrecisionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_scale: Option<f32>,
}

impl PrecisionOverrides {
    fn is_empty(&self) -> bool {
        self.mixed.is_none() && self.init_scale.is_none()
    }
}

/// Load configuration with layered merging.
///
/// Order (later wins): built-in defaults, the TOML file at `file` (if given
/// and present), `EPOCHAL_` environment variables (`EPOCHAL_PRECISION__MIXED`,
/// `EPOCHAL_LR__BASE_LR`, ...), then `overrides`.
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<TrainConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(path) = file {
        if !path.exists() {
            return Err(ConfigError::Invalid {
                field: "cfg".into(),
                reason: format!("config file {} does not exist", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("EPOCHAL_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TrainConfig = figment.extract().map_err(Box::new)?;
    tracing::debug!(?config, "Configuration loaded");
    Ok(config)
}
