//! Checkpoint layout and persistence.
//!
//! A checkpoint is a directory `<model_path>/model-<iterations>/` holding:
//! - `encoder.safetensors` / `generator.safetensors` - network parameters,
//!   batch-norm running statistics included
//! - `encoder_optimizer.safetensors` / `generator_optimizer.safetensors` -
//!   Adam moments and step counters
//! - `config.yaml` - the configuration of the run that wrote it
//! - `training_state.json` - iteration counter, written last
//!
//! A save is staged in `model-<iterations>.tmp` and renamed into place once
//! every file is written. Discovery ignores directories without
//! `training_state.json`, so an interrupted save never shadows the previous
//! checkpoint.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::config::IntroVaeConfig;
use crate::error::{IntroVaeError, Result};
use crate::model::IntroVae;
use crate::optimizer::Adam;

const DIR_PREFIX: &str = "model-";
const STAGING_SUFFIX: &str = ".tmp";
const ENCODER_FILE: &str = "encoder.safetensors";
const GENERATOR_FILE: &str = "generator.safetensors";
const ENCODER_OPTIMIZER_FILE: &str = "encoder_optimizer.safetensors";
const GENERATOR_OPTIMIZER_FILE: &str = "generator_optimizer.safetensors";
const STATE_FILE: &str = "training_state.json";
const CONFIG_FILE: &str = "config.yaml";

/// Progress counters stored alongside the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed iterations.
    pub global_iters: usize,
    /// Epoch the next iteration belongs to.
    pub epoch: usize,
    /// Seed of the run.
    pub seed: u64,
    /// Learning rate at save time.
    pub learning_rate: f64,
}

/// `<model_path>/model-<iterations>`.
pub fn checkpoint_dir(model_path: &Path, iterations: usize) -> PathBuf {
    model_path.join(format!("{DIR_PREFIX}{iterations}"))
}

/// Iteration count encoded in a checkpoint directory name.
///
/// ```rust
/// use introvae_rs::checkpoint::parse_iteration;
///
/// assert_eq!(parse_iteration("model-1200"), Some(1200));
/// assert_eq!(parse_iteration("model-"), None);
/// assert_eq!(parse_iteration("events.jsonl"), None);
/// ```
pub fn parse_iteration(name: &str) -> Option<usize> {
    name.strip_prefix(DIR_PREFIX)?.parse().ok()
}

/// The complete checkpoint with the highest iteration under `model_path`, if any.
///
/// A missing `model_path` counts as empty. Directories without a training
/// state file are left over from interrupted saves and are skipped.
pub fn latest_checkpoint(model_path: &Path) -> Result<Option<(usize, PathBuf)>> {
    if !model_path.exists() {
        return Ok(None);
    }
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(model_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(iters) = name.to_str().and_then(parse_iteration) else {
            continue;
        };
        if !entry.path().join(STATE_FILE).is_file() {
            tracing::warn!("Skipping incomplete checkpoint: {}", entry.path().display());
            continue;
        }
        if latest.as_ref().map_or(true, |(best, _)| iters > *best) {
            latest = Some((iters, entry.path()));
        }
    }
    Ok(latest)
}

/// Write a complete checkpoint for `state.global_iters` under `model_path`.
pub fn save(
    model_path: &Path,
    model: &IntroVae,
    encoder_optimizer: &Adam,
    generator_optimizer: &Adam,
    state: &TrainingState,
    config: &IntroVaeConfig,
) -> Result<PathBuf> {
    let dir = checkpoint_dir(model_path, state.global_iters);
    let staging = model_path.join(format!(
        "{DIR_PREFIX}{}{STAGING_SUFFIX}",
        state.global_iters
    ));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    model.encoder_vars().save(staging.join(ENCODER_FILE))?;
    model.generator_vars().save(staging.join(GENERATOR_FILE))?;
    encoder_optimizer.save(staging.join(ENCODER_OPTIMIZER_FILE))?;
    generator_optimizer.save(staging.join(GENERATOR_OPTIMIZER_FILE))?;
    config.to_file(staging.join(CONFIG_FILE))?;

    let state_json = serde_json::to_string_pretty(state)?;
    std::fs::write(staging.join(STATE_FILE), state_json)?;

    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::rename(&staging, &dir)?;

    tracing::info!("Saved checkpoint to: {}", dir.display());
    Ok(dir)
}

/// Read only the training state of the checkpoint in `dir`.
pub fn read_state(dir: &Path) -> Result<TrainingState> {
    let path = dir.join(STATE_FILE);
    let json = std::fs::read_to_string(&path).map_err(|e| {
        IntroVaeError::checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&json).map_err(|e| {
        IntroVaeError::checkpoint(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Load the checkpoint in `dir` into freshly built networks and optimizers.
///
/// The networks must have the architecture that wrote the checkpoint; any
/// missing or mis-shaped tensor is an error.
pub fn restore(
    dir: &Path,
    model: &mut IntroVae,
    encoder_optimizer: &mut Adam,
    generator_optimizer: &mut Adam,
    device: &Device,
) -> Result<TrainingState> {
    let state = read_state(dir)?;
    if let Some(iters) = dir.file_name().and_then(|n| n.to_str()).and_then(parse_iteration) {
        if iters != state.global_iters {
            return Err(IntroVaeError::checkpoint(format!(
                "{} records {} iterations",
                dir.display(),
                state.global_iters
            )));
        }
    }

    let load_err = |file: &str, e: candle_core::Error| {
        IntroVaeError::checkpoint(format!("failed to load {}: {e}", dir.join(file).display()))
    };
    model
        .encoder_vars_mut()
        .load(dir.join(ENCODER_FILE))
        .map_err(|e| load_err(ENCODER_FILE, e))?;
    model
        .generator_vars_mut()
        .load(dir.join(GENERATOR_FILE))
        .map_err(|e| load_err(GENERATOR_FILE, e))?;
    encoder_optimizer
        .load(dir.join(ENCODER_OPTIMIZER_FILE), device)
        .map_err(|e| match e {
            IntroVaeError::Candle(e) => load_err(ENCODER_OPTIMIZER_FILE, e),
            other => other,
        })?;
    generator_optimizer
        .load(dir.join(GENERATOR_OPTIMIZER_FILE), device)
        .map_err(|e| match e {
            IntroVaeError::Candle(e) => load_err(GENERATOR_OPTIMIZER_FILE, e),
            other => other,
        })?;

    tracing::info!(
        "Loaded checkpoint from: {} (iterations={}, epoch={})",
        dir.display(),
        state.global_iters,
        state.epoch
    );
    Ok(state)
}
