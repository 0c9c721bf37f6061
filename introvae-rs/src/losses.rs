//! Loss primitives and the two IntroVAE objectives.
//!
//! The encoder objective pushes real images towards the prior while pushing
//! generated images (reconstructions and prior samples) away from it, up to
//! the hinge `margin`. The generator objective pulls its outputs towards the
//! prior as judged by the encoder. Both share a reconstruction term.

use candle_core::{Result, Tensor, D};

use crate::config::LossConfig;

/// KL divergence between `N(mean, exp(log_var))` and `N(0, I)`, averaged over the batch.
///
/// `-0.5 * sum(1 + log_var - mean^2 - exp(log_var))` summed over the latent axis.
pub fn reg_loss(mean: &Tensor, log_var: &Tensor) -> Result<Tensor> {
    let inner = ((log_var + 1.0)? - mean.sqr()?)?;
    let inner = (inner - log_var.exp()?)?;
    (inner.sum(D::Minus1)? * -0.5)?.mean_all()
}

/// Mean squared error averaged over every pixel of every image.
pub fn mse_loss(x: &Tensor, reconstruction: &Tensor) -> Result<Tensor> {
    (x - reconstruction)?.sqr()?.mean_all()
}

/// `max(0, margin - value)`.
pub fn hinge(value: &Tensor, margin: f64) -> Result<Tensor> {
    value.affine(-1.0, margin)?.relu()
}

/// Posterior moments of one encoder pass.
#[derive(Debug, Clone)]
pub struct Moments {
    /// Latent mean.
    pub mean: Tensor,
    /// Latent log-variance.
    pub log_var: Tensor,
}

impl Moments {
    /// Pair a mean with its log-variance.
    pub fn new(mean: Tensor, log_var: Tensor) -> Self {
        Self { mean, log_var }
    }

    /// Regularization loss of these moments.
    pub fn reg(&self) -> Result<Tensor> {
        reg_loss(&self.mean, &self.log_var)
    }
}

/// Encoder objective and its components.
#[derive(Debug, Clone)]
pub struct EncoderLoss {
    /// Objective minimized by the encoder optimizer.
    pub total: Tensor,
    /// Reconstruction of the input through `z`.
    pub l_ae: Tensor,
    /// Regularization of real images.
    pub l_reg_z: Tensor,
    /// Regularization of reconstructions, gradient-stopped at the generator.
    pub l_reg_zr_ng: Tensor,
    /// Regularization of prior samples, gradient-stopped at the generator.
    pub l_reg_zpp_ng: Tensor,
}

/// Generator objective and its components.
#[derive(Debug, Clone)]
pub struct GeneratorLoss {
    /// Objective minimized by the generator optimizer.
    pub total: Tensor,
    /// Reconstruction of the input from the re-fed latent.
    pub l_ae2: Tensor,
    /// Regularization of reconstructions.
    pub l_reg_zr: Tensor,
    /// Regularization of prior samples.
    pub l_reg_zpp: Tensor,
}

/// `reg(z) + alpha * hinge(reg(zr_ng)) + alpha * hinge(reg(zpp_ng)) + beta * mse(x, xr)`.
///
/// `zr_ng` and `zpp_ng` must come from generator outputs that were detached
/// before re-encoding.
pub fn encoder_loss(
    weights: &LossConfig,
    x: &Tensor,
    xr: &Tensor,
    z: &Moments,
    zr_ng: &Moments,
    zpp_ng: &Moments,
) -> Result<EncoderLoss> {
    let l_reg_z = z.reg()?;
    let l_reg_zr_ng = zr_ng.reg()?;
    let l_reg_zpp_ng = zpp_ng.reg()?;
    let l_ae = mse_loss(x, xr)?;

    let adv = ((hinge(&l_reg_zr_ng, weights.margin)? + hinge(&l_reg_zpp_ng, weights.margin)?)?
        * weights.alpha)?;
    let total = ((&l_reg_z + adv)? + (&l_ae * weights.beta)?)?;

    Ok(EncoderLoss {
        total,
        l_ae,
        l_reg_z,
        l_reg_zr_ng,
        l_reg_zpp_ng,
    })
}

/// `alpha * reg(zr) + alpha * reg(zpp) + beta * mse(x, xr_latent)`.
pub fn generator_loss(
    weights: &LossConfig,
    x: &Tensor,
    xr_latent: &Tensor,
    zr: &Moments,
    zpp: &Moments,
) -> Result<GeneratorLoss> {
    let l_reg_zr = zr.reg()?;
    let l_reg_zpp = zpp.reg()?;
    let l_ae2 = mse_loss(x, xr_latent)?;

    let adv = ((&l_reg_zr + &l_reg_zpp)? * weights.alpha)?;
    let total = (adv + (&l_ae2 * weights.beta)?)?;

    Ok(GeneratorLoss {
        total,
        l_ae2,
        l_reg_zr,
        l_reg_zpp,
    })
}
