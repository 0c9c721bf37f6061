//! Training loop and optimization.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::checkpoint::{self, TrainingState};
use crate::config::IntroVaeConfig;
use crate::data::DataPipelines;
use crate::error::{IntroVaeError, Result};
use crate::losses::{encoder_loss, generator_loss, Moments};
use crate::model::IntroVae;
use crate::optimizer::{Adam, OptimizerConfig};
use crate::output::{self, GRID_COLUMNS};
use crate::summary::SummaryWriter;

/// Iteration arithmetic of a run.
///
/// ```rust
/// use introvae_rs::trainer::Schedule;
///
/// let schedule = Schedule { epochs: 3, train_size: 100, batch_size: 10 };
/// assert_eq!(schedule.iterations_per_epoch(), 10);
/// assert_eq!(schedule.iterations(), 30);
/// assert_eq!(schedule.epoch_of(9), 0);
/// assert_eq!(schedule.epoch_of(10), 1);
/// assert!(schedule.is_epoch_boundary(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Number of epochs.
    pub epochs: usize,
    /// Training examples per epoch.
    pub train_size: usize,
    /// Examples per iteration.
    pub batch_size: usize,
}

impl Schedule {
    /// Schedule of the run described by `config`.
    pub fn from_config(config: &IntroVaeConfig) -> Self {
        Self {
            epochs: config.training.epochs,
            train_size: config.dataset.train_size,
            batch_size: config.training.batch_size,
        }
    }

    /// Total iterations of a full run.
    pub fn iterations(&self) -> usize {
        self.epochs * self.train_size / self.batch_size
    }

    /// Iterations in one epoch.
    pub fn iterations_per_epoch(&self) -> usize {
        (self.train_size / self.batch_size).max(1)
    }

    /// Epoch containing the iteration that follows `global_iters` completed ones.
    pub fn epoch_of(&self, global_iters: usize) -> usize {
        global_iters * self.batch_size / self.train_size
    }

    /// Whether `global_iters` completed iterations end an epoch.
    pub fn is_epoch_boundary(&self, global_iters: usize) -> bool {
        global_iters > 0 && global_iters % self.iterations_per_epoch() == 0
    }
}

/// Lifecycle of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Built, no checkpoint restored and no iteration run yet.
    Uninitialized,
    /// At least one iteration has run since the last checkpoint.
    Running,
    /// The latest iteration is saved to disk.
    Checkpointed,
    /// The configured number of iterations is done.
    Terminated,
}

/// Scalar losses of one iteration, as computed during the updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    /// Encoder objective.
    pub encoder_loss: f32,
    /// Encoder reconstruction term.
    pub l_ae: f32,
    /// Regularization of real images.
    pub l_reg_z: f32,
    /// Regularization of reconstructions seen by the encoder.
    pub l_reg_zr_ng: f32,
    /// Regularization of prior samples seen by the encoder.
    pub l_reg_zpp_ng: f32,
    /// Generator objective.
    pub generator_loss: f32,
    /// Generator reconstruction term.
    pub l_ae2: f32,
    /// Regularization of reconstructions seen by the generator.
    pub l_reg_zr: f32,
    /// Regularization of prior samples seen by the generator.
    pub l_reg_zpp: f32,
}

impl StepLosses {
    /// `(tag, value)` pairs in logging order.
    pub fn scalars(&self) -> [(&'static str, f32); 9] {
        [
            ("encoder_loss", self.encoder_loss),
            ("l_ae", self.l_ae),
            ("l_reg_z", self.l_reg_z),
            ("l_reg_zr_ng", self.l_reg_zr_ng),
            ("l_reg_zpp_ng", self.l_reg_zpp_ng),
            ("generator_loss", self.generator_loss),
            ("l_ae2", self.l_ae2),
            ("l_reg_zr", self.l_reg_zr),
            ("l_reg_zpp", self.l_reg_zpp),
        ]
    }

    /// Whether every value is finite.
    pub fn is_finite(&self) -> bool {
        self.scalars().iter().all(|(_, v)| v.is_finite())
    }
}

/// Pick the training device.
///
/// CUDA is used when the `cuda` feature is enabled and a device is present,
/// unless `INTROVAE_FORCE_CPU=1`. `INTROVAE_CUDA_DEVICE` selects the ordinal.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("INTROVAE_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("INTROVAE_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via INTROVAE_FORCE_CPU");
        } else {
            tracing::info!("Training device: CPU (build with --features cuda for GPU)");
        }
        Device::Cpu
    }
}

fn standard_normal(rng: &mut ChaCha8Rng, shape: (usize, usize), device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_scalar::<f32>()?)
}

/// The summary log under `prefix`, opened on first use.
fn open_summary<'a>(
    summary: &'a mut Option<SummaryWriter>,
    prefix: &str,
) -> Result<&'a mut SummaryWriter> {
    if summary.is_none() {
        let writer = SummaryWriter::create(prefix)?;
        tracing::debug!("Writing summaries to {}", writer.path().display());
        *summary = Some(writer);
    }
    summary
        .as_mut()
        .ok_or_else(|| IntroVaeError::training("summary writer unavailable"))
}

/// Random draws of one iteration.
struct IterationNoise {
    /// Prior latents fed to the generator.
    z_p: Tensor,
    /// Reparameterization noise of the forward pass.
    forward: Tensor,
    /// Reparameterization noise of the encoder update.
    encoder: Tensor,
}

/// Training orchestrator.
///
/// Owns both networks, their optimizers and the three data streams. Each
/// iteration applies an encoder update followed by a generator update.
///
/// # Example
///
/// ```no_run
/// use introvae_rs::{IntroVaeConfig, Trainer};
///
/// # fn main() -> introvae_rs::Result<()> {
/// let config = IntroVaeConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: IntroVaeConfig,
    schedule: Schedule,
    device: Device,
    model: IntroVae,
    encoder_optimizer: Adam,
    generator_optimizer: Adam,
    data: DataPipelines,
    /// Completed iterations.
    global_iters: usize,
    state: TrainerState,
    summary: Option<SummaryWriter>,
    /// Losses of the most recent iteration run by this trainer.
    last_losses: Option<StepLosses>,
}

impl Trainer {
    /// Create a trainer reading shards from the configured dataset directory.
    ///
    /// Restores the latest checkpoint under `model_path` when there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the shards cannot be
    /// read, or an existing checkpoint cannot be restored.
    pub fn new(config: IntroVaeConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device();
        let data = DataPipelines::open(&config, &device)?;
        Self::with_data(config, data, device)
    }

    /// Create a trainer over already-loaded data streams.
    pub fn with_data(config: IntroVaeConfig, data: DataPipelines, device: Device) -> Result<Self> {
        config.validate()?;
        if data.train.len() != config.dataset.train_size {
            return Err(IntroVaeError::data(format!(
                "training stream holds {} images, dataset.train_size is {}",
                data.train.len(),
                config.dataset.train_size
            )));
        }
        if data.train.batch_size() != config.training.batch_size {
            return Err(IntroVaeError::data(format!(
                "training stream yields batches of {}, training.batch_size is {}",
                data.train.batch_size(),
                config.training.batch_size
            )));
        }

        let model = IntroVae::new(&config, &device)?;
        let (encoder_params, generator_params) = model.parameter_counts();
        tracing::info!(
            "Built encoder ({} params) and generator ({} params) with {} stages",
            encoder_params,
            generator_params,
            model.shape().stages
        );

        let optimizer_config = OptimizerConfig {
            learning_rate: config.training.learning_rate,
            ..OptimizerConfig::default()
        };
        let encoder_optimizer = optimizer_config.build_adam(model.encoder_vars());
        let generator_optimizer = optimizer_config.build_adam(model.generator_vars());
        tracing::info!(
            "Initialized Adam optimizers with lr={}",
            optimizer_config.learning_rate
        );
        if matches!(device, Device::Cuda(_)) {
            tracing::info!(
                "GPU memory share {} requested; allocation is not capped",
                config.training.memory_share
            );
        }

        let mut trainer = Self {
            schedule: Schedule::from_config(&config),
            config,
            device,
            model,
            encoder_optimizer,
            generator_optimizer,
            data,
            global_iters: 0,
            state: TrainerState::Uninitialized,
            summary: None,
            last_losses: None,
        };

        if let Some(model_path) = trainer.config.model_path.clone() {
            match checkpoint::latest_checkpoint(&model_path)? {
                Some((_, dir)) => trainer.resume_from(&dir)?,
                None => tracing::info!("No checkpoint in {}; starting fresh", model_path.display()),
            }
        }
        tracing::info!("Global iters: {}", trainer.global_iters);
        Ok(trainer)
    }

    /// Restore networks, optimizers and the iteration counter from the
    /// checkpoint directory `dir`, and reposition the training stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is missing or does not match the
    /// configured architecture.
    pub fn resume_from<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let state = checkpoint::restore(
            dir,
            &mut self.model,
            &mut self.encoder_optimizer,
            &mut self.generator_optimizer,
            &self.device,
        )?;
        if state.seed != self.config.seed {
            tracing::warn!(
                "Checkpoint was written with seed {}, run uses seed {}",
                state.seed,
                self.config.seed
            );
        }

        self.global_iters = state.global_iters;
        self.data.init();
        self.data
            .train
            .seek(self.global_iters * self.config.training.batch_size);
        self.state = TrainerState::Checkpointed;
        tracing::info!(
            "Model restored from {} (starting epoch {})",
            dir.display(),
            self.epoch() + 1
        );
        Ok(())
    }

    /// Run until the configured number of iterations is reached.
    ///
    /// A restored run only performs the remaining iterations. When a
    /// `model_path` is configured the final state is checkpointed.
    pub fn train(&mut self) -> Result<()> {
        let total = self.schedule.iterations();
        tracing::info!("Starting training");
        tracing::info!("  Dataset: {}", self.config.dataset.data_path().display());
        tracing::info!("  Epochs: {}", self.config.training.epochs);
        tracing::info!(
            "  Iterations: {} ({} per epoch)",
            total,
            self.schedule.iterations_per_epoch()
        );

        if self.global_iters >= total {
            tracing::info!("Run already complete at {} iterations", self.global_iters);
            self.state = TrainerState::Terminated;
            return Ok(());
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_position(self.global_iters as u64);

        while self.global_iters < total {
            let losses = self.run_iteration()?;
            pb.set_message(format!(
                "enc {:.4} gen {:.4}",
                losses.encoder_loss, losses.generator_loss
            ));
            pb.inc(1);
        }
        pb.finish_with_message("Training complete");

        if self.config.model_path.is_some() && self.state != TrainerState::Checkpointed {
            self.save_checkpoint()?;
        }
        if let Some(summary) = self.summary.as_mut() {
            summary.flush()?;
        }
        self.state = TrainerState::Terminated;
        Ok(())
    }

    /// Run exactly `n` iterations, periodic side effects included.
    pub fn train_steps(&mut self, n: usize) -> Result<Vec<StepLosses>> {
        let mut losses = Vec::with_capacity(n);
        for _ in 0..n {
            losses.push(self.run_iteration()?);
        }
        if let Some(summary) = self.summary.as_mut() {
            summary.flush()?;
        }
        Ok(losses)
    }

    /// One encoder update then one generator update on batch `x`.
    ///
    /// Advances the iteration counter but performs no periodic side effects.
    pub fn train_step(&mut self, x: &Tensor) -> Result<StepLosses> {
        let (losses, _, _) = self.step(x)?;
        Ok(losses)
    }

    fn noise(&self, batch: usize) -> Result<IterationNoise> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(self.global_iters as u64);
        let shape = (batch, self.model.latent_dim());
        Ok(IterationNoise {
            z_p: standard_normal(&mut rng, shape, &self.device)?,
            forward: standard_normal(&mut rng, shape, &self.device)?,
            encoder: standard_normal(&mut rng, shape, &self.device)?,
        })
    }

    /// Returns the losses plus the detached reconstruction and prior samples.
    fn step(&mut self, x: &Tensor) -> Result<(StepLosses, Tensor, Tensor)> {
        let x = x.to_device(&self.device)?;
        let noise = self.noise(x.dim(0)?)?;
        let weights = self.config.loss;
        let encoder = &self.model.encoder;
        let generator = &self.model.generator;

        // Forward pass; its outputs are constants for both updates.
        let (z_x, _, _) = encoder.encode_and_sample(&x, &noise.forward, true)?;
        let z_x = z_x.detach();
        let x_r = generator.generate(&z_x, true)?.detach();
        let x_p = generator.generate(&noise.z_p, true)?.detach();

        // Encoder update.
        let (z, z_mean, z_log_var) = encoder.encode_and_sample(&x, &noise.encoder, true)?;
        let xr = generator.generate(&z, true)?;
        let (zr_mean, zr_log_var) = encoder.encode(&x_r, true)?;
        let (zpp_mean, zpp_log_var) = encoder.encode(&x_p, true)?;
        let enc = encoder_loss(
            &weights,
            &x,
            &xr,
            &Moments::new(z_mean, z_log_var),
            &Moments::new(zr_mean, zr_log_var),
            &Moments::new(zpp_mean, zpp_log_var),
        )?;
        let grads = enc.total.backward()?;
        self.encoder_optimizer.step(&grads)?;

        // Generator update, judged by the updated encoder.
        let xr_latent = generator.generate(&z_x, true)?;
        let xpp = generator.generate(&noise.z_p, true)?;
        let (zr_mean, zr_log_var) = encoder.encode(&xr_latent, true)?;
        let (zpp_mean, zpp_log_var) = encoder.encode(&xpp, true)?;
        let gen = generator_loss(
            &weights,
            &x,
            &xr_latent,
            &Moments::new(zr_mean, zr_log_var),
            &Moments::new(zpp_mean, zpp_log_var),
        )?;
        let grads = gen.total.backward()?;
        self.generator_optimizer.step(&grads)?;

        let losses = StepLosses {
            encoder_loss: scalar(&enc.total)?,
            l_ae: scalar(&enc.l_ae)?,
            l_reg_z: scalar(&enc.l_reg_z)?,
            l_reg_zr_ng: scalar(&enc.l_reg_zr_ng)?,
            l_reg_zpp_ng: scalar(&enc.l_reg_zpp_ng)?,
            generator_loss: scalar(&gen.total)?,
            l_ae2: scalar(&gen.l_ae2)?,
            l_reg_zr: scalar(&gen.l_reg_zr)?,
            l_reg_zpp: scalar(&gen.l_reg_zpp)?,
        };

        self.global_iters += 1;
        self.state = TrainerState::Running;
        self.last_losses = Some(losses);
        Ok((losses, x_r, x_p))
    }

    fn run_iteration(&mut self) -> Result<StepLosses> {
        let epoch = self.schedule.epoch_of(self.global_iters);
        let x = self.data.train.next_batch()?;
        let (losses, x_r, x_p) = self.step(&x)?;
        let iters = self.global_iters;
        let training = self.config.training.clone();

        if iters % training.summary_every == 0 {
            let summary = open_summary(&mut self.summary, &self.config.prefix)?;
            summary.histograms(iters, self.model.encoder_vars())?;
            summary.histograms(iters, self.model.generator_vars())?;
        }

        if iters % training.frequency == 0 {
            tracing::info!(
                "Epoch: {}/{}, iteration: {}/{}",
                epoch + 1,
                training.epochs,
                iters,
                self.schedule.iterations()
            );
            tracing::info!(
                " Enc_loss: {}, l_ae: {}, l_reg_z: {}, l_reg_zr_ng: {}, l_reg_zpp_ng: {}",
                losses.encoder_loss,
                losses.l_ae,
                losses.l_reg_z,
                losses.l_reg_zr_ng,
                losses.l_reg_zpp_ng
            );
            tracing::info!(
                " Dec_loss: {}, l_ae: {}, l_reg_zr: {}, l_reg_zpp: {}",
                losses.generator_loss,
                losses.l_ae2,
                losses.l_reg_zr,
                losses.l_reg_zpp
            );
            let summary = open_summary(&mut self.summary, &self.config.prefix)?;
            for (tag, value) in losses.scalars() {
                summary.scalar(iters, tag, f64::from(value))?;
            }
        }

        if self.schedule.is_epoch_boundary(iters) {
            if self.config.save_latent {
                self.save_latents(epoch + 1)?;
                self.save_image_grids(epoch + 1, &x, &x_p, &x_r)?;
            }
            if (epoch + 1) % training.checkpoint_every_epochs == 0
                && self.config.model_path.is_some()
            {
                self.save_checkpoint()?;
            }
        }
        Ok(losses)
    }

    /// Dump latent moments of the test set and the fixed training subset.
    fn save_latents(&mut self, epoch: usize) -> Result<()> {
        let iters = self.global_iters;
        let batch_size = self.config.training.batch_size;
        let prefix = self.config.prefix.clone();
        let sets = [
            ("test", self.config.dataset.test_size, &mut self.data.test),
            ("train", self.config.dataset.latent_cloud_size, &mut self.data.fixed),
        ];

        for (name, size, stream) in sets {
            stream.init();
            let mut means = Vec::new();
            let mut log_vars = Vec::new();
            for _ in 0..size / batch_size {
                let x = stream.next_batch()?;
                let (mean, log_var) = self.model.encoder.encode(&x, false)?;
                means.push(mean);
                log_vars.push(log_var);
            }
            let mean_path = output::artifact_path(&prefix, &format!("{name}_mean"), epoch, iters, "npy");
            let log_var_path =
                output::artifact_path(&prefix, &format!("{name}_log_var"), epoch, iters, "npy");
            output::save_latent(&Tensor::cat(&means, 0)?, &mean_path)?;
            output::save_latent(&Tensor::cat(&log_vars, 0)?, &log_var_path)?;
            tracing::info!("Saved {} latent moments to {}", name, mean_path.display());
        }
        Ok(())
    }

    fn save_image_grids(&self, epoch: usize, x: &Tensor, x_p: &Tensor, x_r: &Tensor) -> Result<()> {
        let iters = self.global_iters;
        for (name, images) in [("original", x), ("sampled", x_p), ("reconstructed", x_r)] {
            let path = output::artifact_path(&self.config.prefix, name, epoch, iters, "png");
            output::save_image_grid(images, GRID_COLUMNS, &path)?;
            tracing::info!("Saved {} images to {}", name, path.display());
        }
        Ok(())
    }

    /// Write a checkpoint of the current state under `model_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no `model_path` is configured or writing fails.
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        let model_path = self.config.model_path.clone().ok_or_else(|| {
            IntroVaeError::checkpoint("no model_path configured for checkpoints")
        })?;
        let state = TrainingState {
            global_iters: self.global_iters,
            epoch: self.epoch(),
            seed: self.config.seed,
            learning_rate: self.encoder_optimizer.learning_rate(),
        };
        let dir = checkpoint::save(
            &model_path,
            &self.model,
            &self.encoder_optimizer,
            &self.generator_optimizer,
            &state,
            &self.config,
        )?;
        self.state = TrainerState::Checkpointed;
        Ok(dir)
    }

    /// Completed iterations.
    pub fn global_iters(&self) -> usize {
        self.global_iters
    }

    /// Epoch of the next iteration.
    pub fn epoch(&self) -> usize {
        self.schedule.epoch_of(self.global_iters)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Iteration arithmetic.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Run configuration.
    pub fn config(&self) -> &IntroVaeConfig {
        &self.config
    }

    /// Networks being trained.
    pub fn model(&self) -> &IntroVae {
        &self.model
    }

    /// Training device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Losses of the most recent iteration run by this trainer, if any.
    pub fn last_losses(&self) -> Option<&StepLosses> {
        self.last_losses.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BatchStream;
    use candle_core::DType;
    use candle_nn::VarMap;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> IntroVaeConfig {
        let mut config = IntroVaeConfig::mnist_28_preset();
        config.dataset.datasets_dir = dir.join("datasets");
        config.dataset.shape = (8, 8);
        config.dataset.train_size = 8;
        config.dataset.test_size = 8;
        config.dataset.latent_cloud_size = 8;
        config.model.latent_dim = 2;
        config.model.base_filter_num = 4;
        config.training.batch_size = 4;
        config.training.epochs = 2;
        config.training.learning_rate = 1e-3;
        config.prefix = dir.join("out").join("run").to_string_lossy().into_owned();
        config.model_path = None;
        config.save_latent = false;
        config
    }

    fn images(n: usize) -> Tensor {
        Tensor::rand(0f32, 1f32, (n, 1, 8, 8), &Device::Cpu).unwrap()
    }

    fn pipelines(config: &IntroVaeConfig, train: &Tensor, test: &Tensor) -> DataPipelines {
        let batch = config.training.batch_size;
        let device = Device::Cpu;
        DataPipelines {
            train: BatchStream::new(train.clone(), batch, true, config.seed, &device).unwrap(),
            test: BatchStream::new(test.clone(), batch, false, config.seed, &device).unwrap(),
            fixed: BatchStream::new(train.clone(), batch, false, config.seed, &device).unwrap(),
        }
    }

    fn max_abs_diff(a: &VarMap, b: &VarMap) -> f32 {
        let a = a.data().lock().unwrap();
        let b = b.data().lock().unwrap();
        assert_eq!(a.len(), b.len());
        a.iter()
            .map(|(name, var)| {
                (var.as_tensor() - b[name].as_tensor())
                    .unwrap()
                    .abs()
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .max(0)
                    .unwrap()
                    .to_scalar::<f32>()
                    .unwrap()
            })
            .fold(0.0, f32::max)
    }

    // ========================================================================
    // Schedule
    // ========================================================================

    #[test]
    fn test_schedule_epoch_rollover() {
        let schedule = Schedule {
            epochs: 5,
            train_size: 100,
            batch_size: 10,
        };
        assert_eq!(schedule.iterations_per_epoch(), 10);
        assert_eq!(schedule.iterations(), 50);
        assert_eq!(schedule.epoch_of(0), 0);
        assert_eq!(schedule.epoch_of(9), 0);
        assert_eq!(schedule.epoch_of(10), 1);
        assert!(!schedule.is_epoch_boundary(0));
        assert!(!schedule.is_epoch_boundary(9));
        assert!(schedule.is_epoch_boundary(20));
    }

    #[test]
    fn test_schedule_uneven_partition() {
        let schedule = Schedule {
            epochs: 2,
            train_size: 25,
            batch_size: 10,
        };
        assert_eq!(schedule.iterations_per_epoch(), 2);
        assert_eq!(schedule.iterations(), 5);
        assert_eq!(schedule.epoch_of(3), 1);
    }

    // ========================================================================
    // Single iterations
    // ========================================================================

    #[test]
    fn test_step_on_zero_batch_is_finite() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let data = images(8);
        let mut trainer =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert_eq!(trainer.state(), TrainerState::Uninitialized);

        let zeros = Tensor::zeros((4, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let losses = trainer.train_step(&zeros).unwrap();
        assert!(losses.is_finite(), "{losses:?}");
        assert!(losses.l_reg_z >= 0.0);
        assert_eq!(trainer.global_iters(), 1);
        assert_eq!(trainer.state(), TrainerState::Running);
    }

    #[test]
    fn test_last_losses_tracks_latest_iteration() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let data = images(8);
        let mut trainer =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert!(trainer.last_losses().is_none());

        let losses = trainer.train_steps(3).unwrap();
        assert_eq!(losses.len(), 3);
        assert_eq!(trainer.last_losses(), losses.last());
    }

    #[test]
    fn test_step_updates_both_networks() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let data = images(8);
        let mut trainer =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();

        let snapshot = |vars: &VarMap| {
            let copy = VarMap::new();
            let data = vars.data().lock().unwrap();
            let mut out = copy.data().lock().unwrap();
            for (name, var) in data.iter() {
                let t = var.as_tensor().copy().unwrap();
                out.insert(name.clone(), candle_core::Var::from_tensor(&t).unwrap());
            }
            drop(out);
            copy
        };
        let enc_before = snapshot(trainer.model().encoder_vars());
        let gen_before = snapshot(trainer.model().generator_vars());

        trainer.train_steps(1).unwrap();
        assert!(max_abs_diff(&enc_before, trainer.model().encoder_vars()) > 0.0);
        assert!(max_abs_diff(&gen_before, trainer.model().generator_vars()) > 0.0);
    }

    #[test]
    fn test_mismatched_stream_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        let data = images(8);
        let streams = pipelines(&config, &data, &data);
        config.dataset.train_size = 12;
        assert!(matches!(
            Trainer::with_data(config, streams, Device::Cpu),
            Err(IntroVaeError::Data(_))
        ));
    }

    // ========================================================================
    // Checkpoint and resume
    // ========================================================================

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.model.encoder_use_bn = true;
        config.model.generator_use_bn = true;
        config.model_path = Some(dir.path().join("ckpt"));
        let data = images(8);

        // Both runs start from the same parameters via the iteration-0 checkpoint.
        let mut interrupted =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        interrupted.save_checkpoint().unwrap();
        let mut uninterrupted =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert_eq!(uninterrupted.global_iters(), 0);
        uninterrupted.train_steps(5).unwrap();

        interrupted.train_steps(3).unwrap();
        interrupted.save_checkpoint().unwrap();
        drop(interrupted);

        let mut resumed =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert_eq!(resumed.global_iters(), 3);
        assert_eq!(resumed.state(), TrainerState::Checkpointed);
        resumed.train_steps(2).unwrap();
        assert_eq!(resumed.global_iters(), 5);

        let enc = max_abs_diff(uninterrupted.model().encoder_vars(), resumed.model().encoder_vars());
        let gen = max_abs_diff(
            uninterrupted.model().generator_vars(),
            resumed.model().generator_vars(),
        );
        assert!(enc < 1e-5, "encoder drift {enc}");
        assert!(gen < 1e-5, "generator drift {gen}");
    }

    #[test]
    fn test_save_checkpoint_requires_model_path() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let data = images(8);
        let mut trainer =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert!(matches!(
            trainer.save_checkpoint(),
            Err(IntroVaeError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_resume_from_missing_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let data = images(8);
        let mut trainer =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert!(matches!(
            trainer.resume_from(dir.path().join("model-7")),
            Err(IntroVaeError::Checkpoint(_))
        ));
        assert_eq!(trainer.global_iters(), 0);
    }

    // ========================================================================
    // Full runs
    // ========================================================================

    #[test]
    fn test_full_run_writes_artifacts() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.save_latent = true;
        config.model_path = Some(dir.path().join("ckpt"));
        config.training.checkpoint_every_epochs = 1;
        config.training.frequency = 1;
        config.training.summary_every = 2;
        let train = images(8);
        let test = images(8);

        let mut trainer =
            Trainer::with_data(config.clone(), pipelines(&config, &train, &test), Device::Cpu).unwrap();
        trainer.train().unwrap();
        assert_eq!(trainer.global_iters(), 4);
        assert_eq!(trainer.state(), TrainerState::Terminated);
        assert!(trainer.last_losses().is_some_and(StepLosses::is_finite));

        let prefix = &config.prefix;
        for name in ["original", "sampled", "reconstructed"] {
            assert!(output::artifact_path(prefix, name, 1, 2, "png").exists());
            assert!(output::artifact_path(prefix, name, 2, 4, "png").exists());
        }
        let mean = Tensor::read_npy(output::artifact_path(prefix, "test_mean", 2, 4, "npy")).unwrap();
        assert_eq!(mean.dims(), &[8, 2]);
        assert!(output::artifact_path(prefix, "train_log_var", 1, 2, "npy").exists());

        let ckpt = dir.path().join("ckpt");
        assert!(checkpoint::checkpoint_dir(&ckpt, 2).join("training_state.json").exists());
        assert_eq!(checkpoint::latest_checkpoint(&ckpt).unwrap().unwrap().0, 4);

        let events = crate::summary::read_events(
            Path::new(prefix).join(crate::summary::EVENTS_FILE),
        )
        .unwrap();
        let scalars = events
            .iter()
            .filter(|e| matches!(e, crate::summary::Event::Scalar { .. }))
            .count();
        assert_eq!(scalars, 4 * 9);
    }

    #[test]
    fn test_completed_run_resumes_to_no_op() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.model_path = Some(dir.path().join("ckpt"));
        config.training.epochs = 1;
        let data = images(8);

        let mut first =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        first.train().unwrap();
        assert_eq!(first.global_iters(), 2);

        let mut second =
            Trainer::with_data(config.clone(), pipelines(&config, &data, &data), Device::Cpu).unwrap();
        assert_eq!(second.global_iters(), 2);
        second.train().unwrap();
        assert_eq!(second.global_iters(), 2);
        assert!(second.last_losses().is_none());
        assert_eq!(second.state(), TrainerState::Terminated);
    }
}
