use crate::candle_aux_linear::zero_bias_linear;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, VarBuilder};

///
/// z = mu + sqrt(exp(lnvar)) * eps
///
/// `eps_nd` is drawn by the caller, so this stays a deterministic
/// function of its inputs and gradients only flow into `mu` and `lnvar`.
///
/// # Arguments
/// * `z_mean_nd` - mean of Gaussian distribution
/// * `z_lnvar_nd` - log variance of Gaussian distribution
/// * `eps_nd` - standard normal noise of the same shape
pub fn reparameterize(z_mean_nd: &Tensor, z_lnvar_nd: &Tensor, eps_nd: &Tensor) -> Result<Tensor> {
    z_mean_nd + z_lnvar_nd.exp()?.sqrt()?.mul(&eps_nd.detach())?
}

/// Diagonal Gaussian q(z|x) produced by the encoder head
pub struct LatentGaussian {
    pub mean_nd: Tensor,
    pub lnvar_nd: Tensor,
}

impl LatentGaussian {
    pub fn std_nd(&self) -> Result<Tensor> {
        self.lnvar_nd.exp()?.sqrt()
    }

    pub fn sample(&self, eps_nd: &Tensor) -> Result<Tensor> {
        reparameterize(&self.mean_nd, &self.lnvar_nd, eps_nd)
    }
}

/// Two independent linear maps from encoder features to (mean, lnvar)
pub struct GaussianLatentHead {
    z_mean: Linear,
    z_lnvar: Linear,
}

impl GaussianLatentHead {
    /// Will create `z.mean.{weight,bias}` and `z.lnvar.{weight,bias}`
    pub fn new(n_features: usize, n_latent: usize, vs: VarBuilder) -> Result<Self> {
        Ok(Self {
            z_mean: zero_bias_linear(n_features, n_latent, vs.pp("z.mean"))?,
            z_lnvar: zero_bias_linear(n_features, n_latent, vs.pp("z.lnvar"))?,
        })
    }

    pub fn forward(&self, h_nf: &Tensor) -> Result<LatentGaussian> {
        Ok(LatentGaussian {
            mean_nd: self.z_mean.forward(h_nf)?,
            lnvar_nd: self.z_lnvar.forward(h_nf)?,
        })
    }
}

/// Parameters of p(x|z)
pub enum Reconstruction {
    /// per-pixel success probability in (0, 1)
    Bernoulli { mean_nd: Tensor },
    /// `scale_nd` is produced but not used by the loss
    Gaussian { mean_nd: Tensor, scale_nd: Tensor },
}

impl Reconstruction {
    pub fn mean(&self) -> &Tensor {
        match self {
            Self::Bernoulli { mean_nd } => mean_nd,
            Self::Gaussian { mean_nd, .. } => mean_nd,
        }
    }
}

/// Linear map(s) from decoder features to reconstruction parameters
pub enum ReconstructionHead {
    Bernoulli { x_mean: Linear },
    Gaussian { x_mean: Linear, x_scale: Linear },
}

impl ReconstructionHead {
    /// Will create `x.mean.{weight,bias}`
    pub fn bernoulli(n_features: usize, n_obs: usize, vs: VarBuilder) -> Result<Self> {
        Ok(Self::Bernoulli {
            x_mean: zero_bias_linear(n_features, n_obs, vs.pp("x.mean"))?,
        })
    }

    /// Will create `x.mean.{weight,bias}` and `x.scale.{weight,bias}`
    pub fn gaussian(n_features: usize, n_obs: usize, vs: VarBuilder) -> Result<Self> {
        Ok(Self::Gaussian {
            x_mean: zero_bias_linear(n_features, n_obs, vs.pp("x.mean"))?,
            x_scale: zero_bias_linear(n_features, n_obs, vs.pp("x.scale"))?,
        })
    }

    pub fn forward(&self, h_nf: &Tensor) -> Result<Reconstruction> {
        match self {
            Self::Bernoulli { x_mean } => Ok(Reconstruction::Bernoulli {
                mean_nd: ops::sigmoid(&x_mean.forward(h_nf)?)?,
            }),
            Self::Gaussian { x_mean, x_scale } => Ok(Reconstruction::Gaussian {
                mean_nd: x_mean.forward(h_nf)?,
                scale_nd: x_scale.forward(h_nf)?,
            }),
        }
    }
}
