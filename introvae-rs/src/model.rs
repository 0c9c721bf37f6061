//! Encoder and generator networks.
//!
//! Both networks are ordered stacks of [`Layer`]s applied in sequence. The
//! encoder maps `(batch, C, H, W)` images to a flat feature vector which the
//! [`Sampler`] turns into `(z_mean, z_log_var)`; the generator maps
//! `(batch, latent_dim)` codes back to image space.
//!
//! Depth follows the image size: every stage halves the spatial resolution
//! until the bottleneck is between 4 and 7 pixels on its short side.

use candle_core::{DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear,
    VarBuilder, VarMap,
};

use crate::config::IntroVaeConfig;
use crate::error::{IntroVaeError, Result as CrateResult};

const LEAKY_SLOPE: f64 = 0.2;

/// Stage layout derived from the image shape and base filter width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkShape {
    /// Image channels.
    pub channels: usize,
    /// Image height.
    pub height: usize,
    /// Image width.
    pub width: usize,
    /// Number of down/up-sampling stages.
    pub stages: usize,
    /// Filters of the first convolution.
    pub base_filters: usize,
}

impl NetworkShape {
    /// Derive the stage layout for an image of shape `(channels, height, width)`.
    ///
    /// ```rust
    /// use introvae_rs::model::NetworkShape;
    ///
    /// let shape = NetworkShape::new((3, 64, 64), 32).unwrap();
    /// assert_eq!(shape.stages, 4);
    /// assert_eq!(shape.bottleneck(), (4, 4));
    /// assert!(NetworkShape::new((1, 30, 30), 32).is_err());
    /// ```
    pub fn new(original_shape: (usize, usize, usize), base_filters: usize) -> CrateResult<Self> {
        let (channels, height, width) = original_shape;
        let short = height.min(width);
        if short < 4 {
            return Err(IntroVaeError::config(format!(
                "image side must be at least 4, got {height}x{width}"
            )));
        }
        let stages = (short / 4).ilog2() as usize;
        let step = 1usize << stages;
        if height % step != 0 || width % step != 0 {
            return Err(IntroVaeError::config(format!(
                "image shape {height}x{width} is not divisible by {step} ({stages} pooling stages)"
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            stages,
            base_filters,
        })
    }

    /// Filter width at stage `stage`; stage 0 is the stem.
    pub fn filters(&self, stage: usize) -> usize {
        self.base_filters << stage.min(3)
    }

    /// Spatial size at the bottleneck.
    pub fn bottleneck(&self) -> (usize, usize) {
        (self.height >> self.stages, self.width >> self.stages)
    }

    /// Length of the flattened encoder output.
    pub fn flat_dim(&self) -> usize {
        let (h, w) = self.bottleneck();
        self.filters(self.stages) * h * w
    }
}

fn same_conv(in_c: usize, out_c: usize, kernel: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        ..Default::default()
    };
    conv2d(in_c, out_c, kernel, cfg, vb)
}

fn maybe_bn(use_bn: bool, features: usize, vb: VarBuilder) -> Result<Option<BatchNorm>> {
    if use_bn {
        Ok(Some(batch_norm(features, BatchNormConfig::default(), vb)?))
    } else {
        Ok(None)
    }
}

fn leaky_relu(xs: &Tensor) -> Result<Tensor> {
    xs.maximum(&(xs * LEAKY_SLOPE)?)
}

/// Two 3x3 convolutions with a skip connection.
pub struct ResidualBlock {
    conv1: Conv2d,
    bn1: Option<BatchNorm>,
    conv2: Conv2d,
    bn2: Option<BatchNorm>,
    shortcut: Option<Conv2d>,
}

impl ResidualBlock {
    /// Create a block mapping `in_c` to `out_c` channels.
    pub fn new(in_c: usize, out_c: usize, use_bn: bool, vb: VarBuilder) -> Result<Self> {
        let shortcut = if in_c != out_c {
            Some(same_conv(in_c, out_c, 1, vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: same_conv(in_c, out_c, 3, vb.pp("conv1"))?,
            bn1: maybe_bn(use_bn, out_c, vb.pp("bn1"))?,
            conv2: same_conv(out_c, out_c, 3, vb.pp("conv2"))?,
            bn2: maybe_bn(use_bn, out_c, vb.pp("bn2"))?,
            shortcut,
        })
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let skip = match &self.shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        let mut h = self.conv1.forward(xs)?;
        if let Some(bn) = &self.bn1 {
            h = bn.forward_t(&h, train)?;
        }
        h = leaky_relu(&h)?;
        h = self.conv2.forward(&h)?;
        if let Some(bn) = &self.bn2 {
            h = bn.forward_t(&h, train)?;
        }
        leaky_relu(&(h + skip)?)
    }
}

/// One step of an encoder or generator stack.
pub enum Layer {
    /// Same-padded convolution.
    Conv(Conv2d),
    /// Batch normalization over the channel axis.
    BatchNorm(BatchNorm),
    /// Leaky ReLU with slope 0.2.
    LeakyRelu,
    /// ReLU.
    Relu,
    /// 2x2 average pooling.
    AvgPool,
    /// 2x nearest-neighbour upsampling.
    Upsample,
    /// Residual block.
    Residual(ResidualBlock),
    /// Flatten everything but the batch axis.
    Flatten,
    /// Fully connected layer.
    Dense(Linear),
    /// Reshape flat features to `(channels, height, width)`.
    Reshape(usize, usize, usize),
}

impl ModuleT for Layer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Layer::Conv(conv) => conv.forward(xs),
            Layer::BatchNorm(bn) => bn.forward_t(xs, train),
            Layer::LeakyRelu => leaky_relu(xs),
            Layer::Relu => xs.relu(),
            Layer::AvgPool => xs.avg_pool2d(2),
            Layer::Upsample => {
                let (_, _, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(h * 2, w * 2)
            }
            Layer::Residual(block) => block.forward_t(xs, train),
            Layer::Flatten => xs.flatten_from(1),
            Layer::Dense(lin) => lin.forward(xs),
            Layer::Reshape(c, h, w) => {
                let b = xs.dim(0)?;
                xs.reshape((b, *c, *h, *w))
            }
        }
    }
}

fn apply_layers(layers: &[Layer], xs: &Tensor, train: bool) -> Result<Tensor> {
    layers
        .iter()
        .try_fold(xs.clone(), |h, layer| layer.forward_t(&h, train))
}

/// Build the encoder stack: image to flat features.
pub fn encoder_layers(shape: &NetworkShape, use_bn: bool, vb: VarBuilder) -> Result<Vec<Layer>> {
    let mut layers = vec![Layer::Conv(same_conv(
        shape.channels,
        shape.filters(0),
        5,
        vb.pp("stem.conv"),
    )?)];
    if use_bn {
        layers.push(Layer::BatchNorm(batch_norm(
            shape.filters(0),
            BatchNormConfig::default(),
            vb.pp("stem.bn"),
        )?));
    }
    layers.push(Layer::LeakyRelu);

    for stage in 0..shape.stages {
        let block = ResidualBlock::new(
            shape.filters(stage),
            shape.filters(stage + 1),
            use_bn,
            vb.pp(format!("stage{stage}")),
        )?;
        layers.push(Layer::Residual(block));
        layers.push(Layer::AvgPool);
    }
    layers.push(Layer::Flatten);
    Ok(layers)
}

/// Build the generator stack: latent code to image.
pub fn generator_layers(
    shape: &NetworkShape,
    latent_dim: usize,
    use_bn: bool,
    vb: VarBuilder,
) -> Result<Vec<Layer>> {
    let (h, w) = shape.bottleneck();
    let top = shape.filters(shape.stages);
    let mut layers = vec![
        Layer::Dense(linear(latent_dim, shape.flat_dim(), vb.pp("dense"))?),
        Layer::Relu,
        Layer::Reshape(top, h, w),
    ];

    for stage in (0..shape.stages).rev() {
        layers.push(Layer::Upsample);
        let block = ResidualBlock::new(
            shape.filters(stage + 1),
            shape.filters(stage),
            use_bn,
            vb.pp(format!("stage{stage}")),
        )?;
        layers.push(Layer::Residual(block));
    }
    layers.push(Layer::Conv(same_conv(
        shape.filters(0),
        shape.channels,
        5,
        vb.pp("to_image"),
    )?));
    Ok(layers)
}

/// `z = mean + exp(log_var / 2) * noise`.
pub fn reparameterize(mean: &Tensor, log_var: &Tensor, noise: &Tensor) -> Result<Tensor> {
    let std = (log_var * 0.5)?.exp()?;
    mean + (std * noise)?
}

enum LogVarHead {
    Learned(Linear),
    Fixed(f64),
}

/// Maps encoder features to the posterior moments and samples from it.
pub struct Sampler {
    mean: Linear,
    log_var: LogVarHead,
    sampling: bool,
}

impl Sampler {
    /// Create the sampling layer over `in_dim` encoder features.
    ///
    /// With `sampling_std` set the log-variance is the constant `2 ln(std)`.
    pub fn new(
        in_dim: usize,
        latent_dim: usize,
        sampling: bool,
        sampling_std: Option<f64>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mean = linear(in_dim, latent_dim, vb.pp("z_mean"))?;
        let log_var = match sampling_std {
            Some(std) => LogVarHead::Fixed(2.0 * std.ln()),
            None => LogVarHead::Learned(linear(in_dim, latent_dim, vb.pp("z_log_var"))?),
        };
        Ok(Self {
            mean,
            log_var,
            sampling,
        })
    }

    /// Posterior moments `(z_mean, z_log_var)`.
    pub fn moments(&self, features: &Tensor) -> Result<(Tensor, Tensor)> {
        let mean = self.mean.forward(features)?;
        let log_var = match &self.log_var {
            LogVarHead::Learned(lin) => lin.forward(features)?,
            LogVarHead::Fixed(value) => mean.zeros_like()?.affine(0.0, *value)?,
        };
        Ok((mean, log_var))
    }

    /// Draw `z`; returns `mean` unchanged when sampling is disabled.
    pub fn sample(&self, mean: &Tensor, log_var: &Tensor, noise: &Tensor) -> Result<Tensor> {
        if self.sampling {
            reparameterize(mean, log_var, noise)
        } else {
            Ok(mean.clone())
        }
    }
}

/// Image to posterior moments.
pub struct Encoder {
    layers: Vec<Layer>,
    sampler: Sampler,
}

impl Encoder {
    /// Flat features before the sampling layer.
    pub fn features(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        apply_layers(&self.layers, x, train)
    }

    /// `(z_mean, z_log_var)` for a batch of images.
    pub fn encode(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let h = self.features(x, train)?;
        self.sampler.moments(&h)
    }

    /// `(z, z_mean, z_log_var)` for a batch of images.
    pub fn encode_and_sample(
        &self,
        x: &Tensor,
        noise: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (mean, log_var) = self.encode(x, train)?;
        let z = self.sampler.sample(&mean, &log_var, noise)?;
        Ok((z, mean, log_var))
    }

    /// Number of layers in the stack.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

/// Latent code to image.
pub struct Generator {
    layers: Vec<Layer>,
}

impl Generator {
    /// Decode a `(batch, latent_dim)` code into `(batch, C, H, W)` images.
    pub fn generate(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        apply_layers(&self.layers, z, train)
    }

    /// Number of layers in the stack.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

/// Encoder and generator with their disjoint parameter sets.
pub struct IntroVae {
    /// Encoder network.
    pub encoder: Encoder,
    /// Generator network.
    pub generator: Generator,
    encoder_vars: VarMap,
    generator_vars: VarMap,
    shape: NetworkShape,
    latent_dim: usize,
    device: Device,
}

impl IntroVae {
    /// Build both networks with fresh parameters on `device`.
    pub fn new(config: &IntroVaeConfig, device: &Device) -> CrateResult<Self> {
        let model = &config.model;
        let shape = NetworkShape::new(config.dataset.original_shape(), model.base_filter_num)?;

        let encoder_vars = VarMap::new();
        let generator_vars = VarMap::new();
        let evb = VarBuilder::from_varmap(&encoder_vars, DType::F32, device);
        let gvb = VarBuilder::from_varmap(&generator_vars, DType::F32, device);

        let build_err = |net: &str, e: candle_core::Error| {
            IntroVaeError::Model(format!("failed to build {net}: {e}"))
        };
        let encoder = Encoder {
            layers: encoder_layers(&shape, model.encoder_use_bn, evb.pp("encoder"))
                .map_err(|e| build_err("encoder", e))?,
            sampler: Sampler::new(
                shape.flat_dim(),
                model.latent_dim,
                model.sampling,
                model.sampling_std,
                evb.pp("encoder.sampling"),
            )
            .map_err(|e| build_err("sampling layer", e))?,
        };
        let generator = Generator {
            layers: generator_layers(
                &shape,
                model.latent_dim,
                model.generator_use_bn,
                gvb.pp("generator"),
            )
            .map_err(|e| build_err("generator", e))?,
        };

        Ok(Self {
            encoder,
            generator,
            encoder_vars,
            generator_vars,
            shape,
            latent_dim: model.latent_dim,
            device: device.clone(),
        })
    }

    /// Encoder parameters.
    pub fn encoder_vars(&self) -> &VarMap {
        &self.encoder_vars
    }

    /// Generator parameters.
    pub fn generator_vars(&self) -> &VarMap {
        &self.generator_vars
    }

    /// Mutable encoder parameters, for restoring from disk.
    pub fn encoder_vars_mut(&mut self) -> &mut VarMap {
        &mut self.encoder_vars
    }

    /// Mutable generator parameters, for restoring from disk.
    pub fn generator_vars_mut(&mut self) -> &mut VarMap {
        &mut self.generator_vars
    }

    /// Stage layout.
    pub fn shape(&self) -> &NetworkShape {
        &self.shape
    }

    /// Latent dimensionality.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Scalar parameter counts `(encoder, generator)`.
    pub fn parameter_counts(&self) -> (usize, usize) {
        let count = |vars: &VarMap| vars.all_vars().iter().map(|v| v.elem_count()).sum();
        (count(&self.encoder_vars), count(&self.generator_vars))
    }
}
