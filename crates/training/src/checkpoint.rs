use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::Seq2Seq;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::to_runtime_error, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    /// Epochs completed when the weights were written.
    pub epoch: usize,
    pub best_val_loss: Option<f64>,
}

pub struct SaveRequest<'a> {
    pub directory: &'a Path,
    pub config: &'a TrainingConfig,
    pub model: &'a Seq2Seq,
    pub epoch: usize,
    pub best_val_loss: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Writes the weights and manifest into `request.directory`, replacing any
/// previous save there.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.directory.display()
        ))
    })?;

    let model_path = request.directory.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: file_record(&model_path)?,
        epoch: request.epoch,
        best_val_loss: request.best_val_loss,
    };
    write_json(&request.directory.join(MANIFEST_FILENAME), &manifest)?;

    Ok(CheckpointDescriptor {
        directory: request.directory.to_path_buf(),
        manifest,
    })
}

/// Accepts either a checkpoint directory or the weights file inside one.
/// When a manifest sits next to the weights its checksum is enforced.
pub fn load_weights(model: &Seq2Seq, path: &Path) -> Result<Option<CheckpointManifest>, TrainingError> {
    let (directory, weights_path) = if path.is_dir() {
        (path.to_path_buf(), path.join(MODEL_FILENAME))
    } else {
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        (directory, path.to_path_buf())
    };

    let manifest_path = directory.join(MANIFEST_FILENAME);
    let manifest = if manifest_path.is_file() {
        let manifest: CheckpointManifest = read_json(&manifest_path)?;
        ensure_version_supported(manifest.version)?;
        if directory.join(&manifest.model.filename) == weights_path {
            validate_file(&weights_path, &manifest.model.sha256)?;
        }
        Some(manifest)
    } else {
        None
    };

    apply_model_weights(model, &weights_path)?;
    Ok(manifest)
}

pub fn apply_model_weights(model: &Seq2Seq, weights_path: &Path) -> Result<(), TrainingError> {
    let device = model.config().device.clone();
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read weights from {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    // Every tensor is checked before any parameter is touched, so a rejected
    // file leaves the model as it was.
    let parameters = model.parameters().map_err(to_runtime_error)?;
    let mut staged = Vec::with_capacity(parameters.len());
    let mut missing = Vec::new();
    for (name, var) in parameters {
        let Some(tensor) = params_by_name.remove(&name) else {
            missing.push(name);
            continue;
        };
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, expected {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        staged.push((name, var, tensor));
    }

    if !missing.is_empty() {
        return Err(TrainingError::runtime(format!(
            "checkpoint missing parameters: {}",
            missing.join(", ")
        )));
    }
    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    for (name, var, tensor) in staged {
        var.set(&tensor).map_err(|err| {
            TrainingError::runtime(format!("failed to restore parameter {name}: {err}"))
        })?;
    }

    Ok(())
}

fn save_model_weights(model: &Seq2Seq, path: &Path) -> Result<(), TrainingError> {
    let tensors = model.state_dict().map_err(to_runtime_error)?;
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
