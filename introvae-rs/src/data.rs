//! Image batches streamed from `.npy` shards.
//!
//! A dataset directory holds `train/*.npy` and `test/*.npy`. Each shard is a
//! block of pre-shaped images, `(n, C, H, W)` or `(n, H, W)` for grayscale.
//! Shards are read once into host memory; a [`BatchStream`] then repeats the
//! images endlessly, reshuffling on every pass.
//!
//! # Example
//!
//! ```no_run
//! use introvae_rs::data::BatchStream;
//! use candle_core::Device;
//!
//! # fn main() -> introvae_rs::Result<()> {
//! let mut train = BatchStream::open("datasets/mnist/train", 60000, (1, 28, 28), 50, true, 10, &Device::Cpu)?;
//! train.init();
//! let x = train.next_batch()?;
//! assert_eq!(x.dims(), &[50, 1, 28, 28]);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::IntroVaeConfig;
use crate::error::{IntroVaeError, Result};

const SHARD_EXTENSION: &str = "npy";

/// Sorted list of the `.npy` shards in `dir`.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        IntroVaeError::data(format!("cannot read shard directory {}: {e}", dir.display()))
    })?;

    let mut shards = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == SHARD_EXTENSION) {
            shards.push(path);
        }
    }
    shards.sort();

    if shards.is_empty() {
        return Err(IntroVaeError::data(format!(
            "no *.{SHARD_EXTENSION} shards in {}",
            dir.display()
        )));
    }
    Ok(shards)
}

/// Read one shard and normalize it to `(n, C, H, W)` `f32`.
pub fn read_shard(path: &Path, shape: (usize, usize, usize)) -> Result<Tensor> {
    let raw = Tensor::read_npy(path)
        .map_err(|e| IntroVaeError::data(format!("cannot read {}: {e}", path.display())))?;

    let (c, h, w) = shape;
    let dims = raw.dims().to_vec();
    let images = match dims.as_slice() {
        [_, dc, dh, dw] if (*dc, *dh, *dw) == (c, h, w) => raw,
        [_, dh, dw] if c == 1 && (*dh, *dw) == (h, w) => raw.unsqueeze(1)?,
        dims => {
            return Err(IntroVaeError::data(format!(
                "{} has shape {dims:?}, expected (n, {c}, {h}, {w})",
                path.display()
            )))
        }
    };

    match images.dtype() {
        DType::U8 => Ok((images.to_dtype(DType::F32)? / 255.0)?),
        DType::F16 | DType::BF16 | DType::F32 | DType::F64 => Ok(images.to_dtype(DType::F32)?),
        other => Err(IntroVaeError::data(format!(
            "{} has unsupported dtype {other:?}",
            path.display()
        ))),
    }
}

/// The first `size` images found in the shards of `dir`, in shard order.
pub fn load_images(dir: &Path, size: usize, shape: (usize, usize, usize)) -> Result<Tensor> {
    let mut parts = Vec::new();
    let mut remaining = size;
    for shard in list_shards(dir)? {
        if remaining == 0 {
            break;
        }
        let images = read_shard(&shard, shape)?;
        let take = images.dim(0)?.min(remaining);
        if take > 0 {
            parts.push(images.narrow(0, 0, take)?);
            remaining -= take;
        }
    }

    if remaining > 0 {
        return Err(IntroVaeError::data(format!(
            "{} holds {} images, {size} requested",
            dir.display(),
            size - remaining
        )));
    }
    Ok(Tensor::cat(&parts, 0)?)
}

/// Endless stream of fixed-size batches over an in-memory image set.
pub struct BatchStream {
    images: Tensor,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    device: Device,
    pass: u64,
    order: Vec<u32>,
    cursor: usize,
}

impl BatchStream {
    /// Wrap an `(n, C, H, W)` host tensor.
    pub fn new(
        images: Tensor,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let n = images.dim(0)?;
        if batch_size == 0 || batch_size > n {
            return Err(IntroVaeError::data(format!(
                "batch size {batch_size} does not fit a partition of {n} images"
            )));
        }
        let mut stream = Self {
            images,
            batch_size,
            shuffle,
            seed,
            device: device.clone(),
            pass: 0,
            order: Vec::new(),
            cursor: 0,
        };
        stream.init();
        Ok(stream)
    }

    /// Load `size` images from the shards in `dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn open<P: AsRef<Path>>(
        dir: P,
        size: usize,
        shape: (usize, usize, usize),
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let images = load_images(dir.as_ref(), size, shape)?;
        Self::new(images, batch_size, shuffle, seed, device)
    }

    /// Rewind to the start of the first pass.
    pub fn init(&mut self) {
        self.seek(0);
    }

    /// Position the stream as if `examples` images had been pulled since [`BatchStream::init`].
    pub fn seek(&mut self, examples: usize) {
        let n = self.len();
        self.pass = (examples / n) as u64;
        self.cursor = examples % n;
        self.order = self.order_for_pass(self.pass);
    }

    /// Next `(batch, C, H, W)` batch on the stream's device.
    ///
    /// Batches straddle pass boundaries, so every batch is full.
    pub fn next_batch(&mut self) -> Result<Tensor> {
        let mut indices = Vec::with_capacity(self.batch_size);
        while indices.len() < self.batch_size {
            if self.cursor == self.order.len() {
                self.pass += 1;
                self.cursor = 0;
                self.order = self.order_for_pass(self.pass);
            }
            let take = (self.batch_size - indices.len()).min(self.order.len() - self.cursor);
            indices.extend_from_slice(&self.order[self.cursor..self.cursor + take]);
            self.cursor += take;
        }

        let index = Tensor::from_vec(indices, self.batch_size, self.images.device())?;
        Ok(self.images.index_select(&index, 0)?.to_device(&self.device)?)
    }

    /// Number of images in one pass.
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    /// Always false; construction rejects empty partitions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn order_for_pass(&self, pass: u64) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            rng.set_stream(pass);
            order.shuffle(&mut rng);
        }
        order
    }
}

/// The three streams a run draws from.
pub struct DataPipelines {
    /// Shuffled training images.
    pub train: BatchStream,
    /// Test images for latent dumps, in file order.
    pub test: BatchStream,
    /// Fixed training subset for latent dumps, in file order.
    pub fixed: BatchStream,
}

impl DataPipelines {
    /// Open all three streams described by `config`.
    ///
    /// The test and fixed streams are only read when latent dumps are enabled.
    pub fn open(config: &IntroVaeConfig, device: &Device) -> Result<Self> {
        let ds = &config.dataset;
        let shape = ds.original_shape();
        let batch = config.training.batch_size;
        let root = ds.data_path();
        let train_dir = root.join("train");

        let train = BatchStream::open(&train_dir, ds.train_size, shape, batch, true, config.seed, device)?;
        tracing::info!("Loaded {} training images from {}", train.len(), train_dir.display());

        let (test, fixed) = if config.save_latent {
            let test = BatchStream::open(root.join("test"), ds.test_size, shape, batch, false, config.seed, device)?;
            let fixed = BatchStream::open(&train_dir, ds.latent_cloud_size, shape, batch, false, config.seed, device)?;
            tracing::info!(
                "Loaded {} test and {} latent-cloud images",
                test.len(),
                fixed.len()
            );
            (test, fixed)
        } else {
            // Latent dumps are off; reuse the training images so the streams exist.
            let images = train.images.clone();
            (
                BatchStream::new(images.clone(), batch, false, config.seed, device)?,
                BatchStream::new(images, batch, false, config.seed, device)?,
            )
        };

        Ok(Self { train, test, fixed })
    }

    /// Rewind all three streams.
    pub fn init(&mut self) {
        self.train.init();
        self.test.init();
        self.fixed.init();
    }
}
