//! Run configuration: parsing, presets and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IntroVaeError, Result};

/// Main configuration for an IntroVAE training run.
///
/// # Example
///
/// ```rust
/// use introvae_rs::IntroVaeConfig;
///
/// # fn main() -> introvae_rs::Result<()> {
/// let mut config = IntroVaeConfig::from_preset("mnist-28")?;
/// config.training.epochs = 5;
/// config.validate()?;
/// assert_eq!(config.dataset.channels(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntroVaeConfig {
    /// Dataset location and partition sizes.
    pub dataset: DatasetConfig,

    /// Network shape.
    #[serde(default)]
    pub model: ModelConfig,

    /// Loss weights and hinge margin.
    #[serde(default)]
    pub loss: LossConfig,

    /// Optimization and periodic side effects.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Prefix for image grids, latent dumps and the summary log directory.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Checkpoint directory. Checkpointing and restore are off when unset.
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    /// Dump latent clouds and image grids at each epoch boundary.
    #[serde(default)]
    pub save_latent: bool,

    /// Seed for shuffling, prior sampling and reparameterization noise.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_prefix() -> String {
    "./outputs/introvae".into()
}

fn default_seed() -> u64 {
    10
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Root directory holding one directory per dataset.
    pub datasets_dir: PathBuf,

    /// Dataset name; shards live in `<datasets_dir>/<dataset>/{train,test}/*.npy`.
    pub dataset: String,

    /// Image height and width.
    pub shape: (usize, usize),

    /// Three channels when set, one otherwise.
    #[serde(default)]
    pub color: bool,

    /// Number of training examples used per epoch.
    pub train_size: usize,

    /// Number of test examples dumped per latent snapshot.
    #[serde(default = "default_test_size")]
    pub test_size: usize,

    /// Number of fixed training examples dumped per latent snapshot.
    #[serde(default = "default_latent_cloud_size")]
    pub latent_cloud_size: usize,
}

fn default_test_size() -> usize {
    1000
}
fn default_latent_cloud_size() -> usize {
    1000
}

impl DatasetConfig {
    /// Number of image channels.
    pub fn channels(&self) -> usize {
        if self.color {
            3
        } else {
            1
        }
    }

    /// Image shape as `(channels, height, width)`.
    pub fn original_shape(&self) -> (usize, usize, usize) {
        (self.channels(), self.shape.0, self.shape.1)
    }

    /// Directory holding this dataset's splits.
    pub fn data_path(&self) -> PathBuf {
        self.datasets_dir.join(&self.dataset)
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Latent dimensionality.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Filter count of the first convolution; deeper stages multiply it.
    #[serde(default = "default_base_filter_num")]
    pub base_filter_num: usize,

    /// Batch normalization in the encoder.
    #[serde(default = "default_true")]
    pub encoder_use_bn: bool,

    /// Batch normalization in the generator.
    #[serde(default = "default_true")]
    pub generator_use_bn: bool,

    /// Sample `z` with the reparameterization trick; `z = z_mean` otherwise.
    #[serde(default = "default_true")]
    pub sampling: bool,

    /// Fixed posterior standard deviation replacing the learned log-variance.
    #[serde(default)]
    pub sampling_std: Option<f64>,
}

fn default_latent_dim() -> usize {
    128
}
fn default_base_filter_num() -> usize {
    32
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            latent_dim: default_latent_dim(),
            base_filter_num: default_base_filter_num(),
            encoder_use_bn: true,
            generator_use_bn: true,
            sampling: true,
            sampling_std: None,
        }
    }
}

/// Loss weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LossConfig {
    /// Weight of the adversarial regularization terms.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Weight of the reconstruction terms.
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Hinge threshold on the regularization of generated samples.
    #[serde(default = "default_margin", alias = "m")]
    pub margin: f64,
}

fn default_alpha() -> f64 {
    0.25
}
fn default_beta() -> f64 {
    1.0
}
fn default_margin() -> f64 {
    120.0
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            beta: default_beta(),
            margin: default_margin(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Adam learning rate, shared by both optimizers.
    #[serde(default = "default_lr", alias = "lr")]
    pub learning_rate: f64,

    /// Number of epochs.
    #[serde(default = "default_epochs", alias = "nb_epoch")]
    pub epochs: usize,

    /// Log the scalar losses every N iterations.
    #[serde(default = "default_frequency")]
    pub frequency: usize,

    /// Write parameter histograms every N iterations.
    #[serde(default = "default_summary_every")]
    pub summary_every: usize,

    /// Save a checkpoint every N epochs.
    #[serde(default = "default_checkpoint_every_epochs")]
    pub checkpoint_every_epochs: usize,

    /// Fraction of GPU memory the run may claim.
    #[serde(default = "default_memory_share")]
    pub memory_share: f64,
}

fn default_batch_size() -> usize {
    50
}
fn default_lr() -> f64 {
    2e-4
}
fn default_epochs() -> usize {
    200
}
fn default_frequency() -> usize {
    100
}
fn default_summary_every() -> usize {
    10
}
fn default_checkpoint_every_epochs() -> usize {
    10
}
fn default_memory_share() -> f64 {
    0.45
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            epochs: default_epochs(),
            frequency: default_frequency(),
            summary_every: default_summary_every(),
            checkpoint_every_epochs: default_checkpoint_every_epochs(),
            memory_share: default_memory_share(),
        }
    }
}

impl IntroVaeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"mnist-28"` - 28x28 grayscale digits
    /// - `"celeba-64"` - 64x64 color faces
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "mnist-28" => Ok(Self::mnist_28_preset()),
            "celeba-64" => Ok(Self::celeba_64_preset()),
            _ => Err(IntroVaeError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// 28x28 grayscale preset.
    #[must_use]
    pub fn mnist_28_preset() -> Self {
        Self {
            dataset: DatasetConfig {
                datasets_dir: "./datasets".into(),
                dataset: "mnist".into(),
                shape: (28, 28),
                color: false,
                train_size: 60000,
                test_size: 10000,
                latent_cloud_size: 10000,
            },
            model: ModelConfig {
                latent_dim: 16,
                base_filter_num: 16,
                ..Default::default()
            },
            loss: LossConfig {
                alpha: 0.25,
                beta: 1.0,
                margin: 20.0,
            },
            training: TrainingConfig {
                epochs: 50,
                ..Default::default()
            },
            prefix: "./outputs/mnist/introvae".into(),
            model_path: Some("./outputs/mnist/checkpoints".into()),
            save_latent: true,
            seed: default_seed(),
        }
    }

    /// 64x64 color preset.
    #[must_use]
    pub fn celeba_64_preset() -> Self {
        Self {
            dataset: DatasetConfig {
                datasets_dir: "./datasets".into(),
                dataset: "celeba".into(),
                shape: (64, 64),
                color: true,
                train_size: 200000,
                test_size: 2000,
                latent_cloud_size: 2000,
            },
            model: ModelConfig::default(),
            loss: LossConfig::default(),
            training: TrainingConfig::default(),
            prefix: "./outputs/celeba/introvae".into(),
            model_path: Some("./outputs/celeba/checkpoints".into()),
            save_latent: true,
            seed: default_seed(),
        }
    }

    /// Total number of iterations of a full run.
    pub fn iterations(&self) -> usize {
        self.training.epochs * self.dataset.train_size / self.training.batch_size
    }

    /// Validate the configuration.
    ///
    /// ```rust
    /// use introvae_rs::IntroVaeConfig;
    ///
    /// let mut config = IntroVaeConfig::mnist_28_preset();
    /// assert!(config.validate().is_ok());
    ///
    /// config.training.batch_size = 0;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        let ds = &self.dataset;
        if ds.dataset.is_empty() {
            return Err(IntroVaeError::config("dataset.dataset is required"));
        }
        let (h, w) = ds.shape;
        if h < 4 || w < 4 {
            return Err(IntroVaeError::config(format!(
                "dataset.shape must be at least 4x4, got {h}x{w}"
            )));
        }

        let training = &self.training;
        if training.batch_size == 0 {
            return Err(IntroVaeError::config("training.batch_size must be > 0"));
        }
        if ds.train_size < training.batch_size {
            return Err(IntroVaeError::config(format!(
                "dataset.train_size ({}) must be >= training.batch_size ({})",
                ds.train_size, training.batch_size
            )));
        }
        if self.save_latent
            && (ds.test_size < training.batch_size || ds.latent_cloud_size < training.batch_size)
        {
            return Err(IntroVaeError::config(
                "test_size and latent_cloud_size must be >= batch_size when save_latent is set",
            ));
        }
        if training.frequency == 0 || training.summary_every == 0 {
            return Err(IntroVaeError::config(
                "training.frequency and training.summary_every must be > 0",
            ));
        }
        if training.checkpoint_every_epochs == 0 {
            return Err(IntroVaeError::config(
                "training.checkpoint_every_epochs must be > 0",
            ));
        }
        if !(training.learning_rate > 0.0) {
            return Err(IntroVaeError::config("training.learning_rate must be > 0"));
        }
        if !(training.memory_share > 0.0 && training.memory_share <= 1.0) {
            return Err(IntroVaeError::config(
                "training.memory_share must be in (0, 1]",
            ));
        }

        let model = &self.model;
        if model.latent_dim == 0 || model.base_filter_num == 0 {
            return Err(IntroVaeError::config(
                "model.latent_dim and model.base_filter_num must be > 0",
            ));
        }
        if let Some(std) = model.sampling_std {
            if !(std > 0.0) {
                return Err(IntroVaeError::config("model.sampling_std must be > 0"));
            }
        }

        if self.loss.alpha < 0.0 || self.loss.beta < 0.0 || self.loss.margin < 0.0 {
            return Err(IntroVaeError::config(
                "loss.alpha, loss.beta and loss.margin must be non-negative",
            ));
        }

        // Depth is derived from the shape; reject shapes the pooling pyramid cannot tile.
        crate::model::NetworkShape::new(ds.original_shape(), model.base_filter_num)?;

        Ok(())
    }
}
