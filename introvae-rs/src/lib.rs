//! # introvae-rs
//!
//! Introspective variational autoencoder (IntroVAE) training on candle.
//!
//! The encoder of an IntroVAE doubles as the discriminator: it learns to map
//! real images close to the prior while pushing generated images away from
//! it, and the generator learns to produce images the encoder maps close to
//! the prior. Each training iteration applies one encoder update and one
//! generator update, each with its own Adam optimizer.
//!
//! ## Features
//!
//! - **YAML Configuration** - Datasets, network shape, loss weights and schedule in one file
//! - **Residual Networks** - Depth derived from the image size, optional batch norm
//! - **Reproducible Runs** - Seeded shuffling and noise; resumed runs match uninterrupted ones
//! - **Checkpoints** - Weights, batch-norm statistics and optimizer moments in safetensors
//! - **Artifacts** - PNG image grids, latent `.npy` dumps and a JSON-lines summary log
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! introvae init config.yaml --preset mnist-28
//!
//! # Validate configuration
//! introvae validate config.yaml
//!
//! # Start (or continue) training
//! introvae train config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use introvae_rs::{IntroVaeConfig, Trainer};
//!
//! # fn main() -> introvae_rs::Result<()> {
//! let config = IntroVaeConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use introvae_rs::IntroVaeConfig;
//!
//! # fn main() -> introvae_rs::Result<()> {
//! let mut config = IntroVaeConfig::from_preset("celeba-64")?;
//! config.training.epochs = 5;
//! config.loss.margin = 90.0;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod losses;
pub mod model;
pub mod optimizer;
pub mod output;
pub mod summary;
pub mod trainer;

pub use config::{IntroVaeConfig, TrainingConfig};
pub use error::{IntroVaeError, Result};
pub use model::IntroVae;
pub use trainer::{StepLosses, Trainer};
