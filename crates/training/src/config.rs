use candle_core::{DType, Device};
use model::{CellKind, Seq2SeqConfig};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.to_model_config(Device::Cpu).validate() {
            errors.push(format!("model: {}", err));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.early_stopping.patience == 0 {
            errors.push("early_stopping.patience must be greater than 0".to_string());
        }

        if self.early_stopping.min_delta < 0.0 {
            errors.push("early_stopping.min_delta must be >= 0".to_string());
        }

        if self.evaluation.mc_samples == 0 {
            errors.push("evaluation.mc_samples must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.output_dir.as_os_str().is_empty() {
            errors.push("runtime.output_dir must not be empty".to_string());
        }

        if self.runtime.save_name.trim().is_empty()
            || self.runtime.save_name.contains(['/', '\\'])
        {
            errors.push("runtime.save_name must be a plain, non-empty name".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.runtime.apply_base_path(base);
    }
}

/// Serializable mirror of [`Seq2SeqConfig`] without device placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_enc_dim")]
    pub enc_dim: usize,
    #[serde(default = "default_dec_dim")]
    pub dec_dim: usize,
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_enc_len")]
    pub enc_len: usize,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_n_sites")]
    pub n_sites: usize,
    #[serde(default)]
    pub attention: bool,
    #[serde(default)]
    pub cell: CellKind,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            enc_dim: default_enc_dim(),
            dec_dim: default_dec_dim(),
            input_dim: default_input_dim(),
            k: default_k(),
            enc_len: default_enc_len(),
            embedding_dim: default_embedding_dim(),
            n_sites: default_n_sites(),
            attention: false,
            cell: CellKind::default(),
            bidirectional: false,
            dropout: default_dropout(),
        }
    }
}

impl ModelSettings {
    pub fn to_model_config(&self, device: Device) -> Seq2SeqConfig {
        Seq2SeqConfig {
            enc_dim: self.enc_dim,
            dec_dim: self.dec_dim,
            input_dim: self.input_dim,
            k: self.k,
            enc_len: self.enc_len,
            embedding_dim: self.embedding_dim,
            n_sites: self.n_sites,
            attention: self.attention,
            cell: self.cell,
            bidirectional: self.bidirectional,
            dropout: self.dropout,
            dtype: DType::F32,
            device,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Reshuffle the training split every epoch.
    #[serde(default)]
    pub shuffle: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            shuffle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            min_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Stochastic forward passes per test batch.
    #[serde(default = "default_mc_samples")]
    pub mc_samples: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            mc_samples: default_mc_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_save_name")]
    pub save_name: String,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            output_dir: default_output_dir(),
            save_name: default_save_name(),
            log_every_n_steps: default_log_every_n_steps(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if self.output_dir.is_relative() {
            self.output_dir = base.join(&self.output_dir);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Directory holding the saved weights for this run.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join(&self.save_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn default_enc_dim() -> usize {
    64
}

fn default_dec_dim() -> usize {
    32
}

fn default_input_dim() -> usize {
    4
}

fn default_k() -> usize {
    5
}

fn default_enc_len() -> usize {
    48
}

fn default_embedding_dim() -> usize {
    5
}

fn default_n_sites() -> usize {
    200
}

fn default_dropout() -> f32 {
    0.5
}

fn default_batch_size() -> usize {
    64
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_patience() -> usize {
    10
}

fn default_mc_samples() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_save_name() -> String {
    "wind_power".to_string()
}

fn default_log_every_n_steps() -> usize {
    50
}

fn default_tensorboard_flush() -> usize {
    1
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_toml_with_defaults_and_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[model]
cell = "lstm"
attention = true
enc_len = 24

[data]
batch_size = 16

[runtime]
output_dir = "artifacts"
save_name = "site_a"
"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();

        assert_eq!(config.model.cell, CellKind::Lstm);
        assert!(config.model.attention);
        assert_eq!(config.model.enc_len, 24);
        assert_eq!(config.model.enc_dim, 64);
        assert_eq!(config.data.batch_size, 16);
        assert_eq!(config.early_stopping.patience, 10);
        assert_eq!(config.evaluation.mc_samples, 10);
        assert_eq!(config.runtime.output_dir, dir.path().join("artifacts"));
        assert_eq!(
            config.runtime.checkpoint_dir(),
            dir.path().join("artifacts").join("site_a")
        );
    }

    #[test]
    fn loads_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, r#"{"optimizer": {"learning_rate": 0.01}}"#).unwrap();

        let config = TrainingConfig::load(&path).unwrap();

        assert!((config.optimizer.learning_rate - 0.01).abs() < 1e-12);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.data.batch_size = 0;
        config.evaluation.mc_samples = 0;
        config.model.dropout = 1.5;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, "model: {}").unwrap();

        assert!(matches!(
            TrainingConfig::load(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
