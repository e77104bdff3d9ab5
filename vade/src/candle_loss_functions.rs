use crate::candle_latent_heads::{LatentGaussian, Reconstruction};
use crate::candle_mixture_prior::MixturePrior;
use candle_core::{Result, Tensor};

/// floor added to densities before taking logs
pub const DENSITY_EPS: f64 = 1e-10;

const LN_2PI: f64 = 1.8378770664093453;

/// Bernoulli log-likelihood of binary-ish data
///
/// llik(i) = sum_w x(i,w) * log(ε + m(i,w)) + (1 - x(i,w)) * log(ε + 1 - m(i,w))
///
/// * `x_nd` - data tensor (observed data)
/// * `mean_nd` - success probability (reconstruction)
///
pub fn bernoulli_likelihood(x_nd: &Tensor, mean_nd: &Tensor) -> Result<Tensor> {
    let log_m_nd = (mean_nd + DENSITY_EPS)?.log()?;
    let log_1m_nd = (mean_nd.affine(-1., 1.)? + DENSITY_EPS)?.log()?;
    let x_neg_nd = x_nd.affine(-1., 1.)?;

    (x_nd.mul(&log_m_nd)? + x_neg_nd.mul(&log_1m_nd)?)?.sum(x_nd.rank() - 1)
}

/// Squared-error log-likelihood (unit scale, constants dropped)
///
/// llik(i) = - sum_w [ x(i,w) - xhat(i,w) ]^2
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - mean tensor (reconstruction)
///
pub fn gaussian_likelihood(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.sqr()?.sum(x_nd.rank() - 1)?.neg()
}

/// log p(x|z) for either reconstruction family
pub fn reconstruction_likelihood(x_nd: &Tensor, recon: &Reconstruction) -> Result<Tensor> {
    match recon {
        Reconstruction::Bernoulli { mean_nd } => bernoulli_likelihood(x_nd, mean_nd),
        Reconstruction::Gaussian { mean_nd, .. } => gaussian_likelihood(x_nd, mean_nd),
    }
}

/// Diagonal Gaussian log-density, one value per row
///
/// log N(z; m, v) = -0.5 * [ D log(2π) + sum_d lnvar(d) + (z(d) - m(d))^2 / v(d) ]
///
/// * `z_nd` - points (n x D)
/// * `mean_nd` - means (n x D)
/// * `lnvar_nd` - log variances (n x D)
///
pub fn diag_gaussian_log_density(z_nd: &Tensor, mean_nd: &Tensor, lnvar_nd: &Tensor) -> Result<Tensor> {
    let d = z_nd.dim(z_nd.rank() - 1)? as f64;
    let quad_nd = z_nd.sub(mean_nd)?.sqr()?.div(&lnvar_nd.exp()?)?;
    let sum_n = (quad_nd + lnvar_nd)?.sum(z_nd.rank() - 1)?;
    sum_n.affine(-0.5, -0.5 * d * LN_2PI)
}

/// log p(z|c) for every sample and every cluster
///
/// The mixture tensors are broadcast against the batch that actually
/// came in, so any batch size works.
///
/// * `z_nd` - latent samples (n x D)
/// * `mu_kd` - cluster means (K x D)
/// * `lnvar_kd` - cluster log variances (K x D)
///
/// # Returns `log_p_z_c_nk` (n x K)
pub fn cluster_log_density(z_nd: &Tensor, mu_kd: &Tensor, lnvar_kd: &Tensor) -> Result<Tensor> {
    let d = z_nd.dim(1)? as f64;
    let z_n1d = z_nd.unsqueeze(1)?;
    let mu_1kd = mu_kd.unsqueeze(0)?;
    let lnvar_1kd = lnvar_kd.unsqueeze(0)?;

    let quad_nkd = z_n1d
        .broadcast_sub(&mu_1kd)?
        .sqr()?
        .broadcast_div(&lnvar_1kd.exp()?)?;
    let sum_nk = quad_nkd.broadcast_add(&lnvar_1kd)?.sum(2)?;
    sum_nk.affine(-0.5, -0.5 * d * LN_2PI)
}

/// Joint density and responsibility of the mixture
///
/// p(c,z) = π(c) N(z; μ(c), v(c)) + ε
/// γ(i,c) = p(c,z_i) / sum_c' p(c',z_i)
///
/// # Returns `(p_c_z_nk, gamma_nk)`
pub fn mixture_responsibility(z_nd: &Tensor, prior: &MixturePrior) -> Result<(Tensor, Tensor)> {
    let pi_1k = prior.weights().unsqueeze(0)?;
    let log_p_z_c_nk = cluster_log_density(z_nd, prior.means(), prior.log_variances())?;

    let p_c_z_nk = (log_p_z_c_nk.exp()?.broadcast_mul(&pi_1k)? + DENSITY_EPS)?;
    let marginal_n1 = p_c_z_nk.sum_keepdim(1)?;
    let gamma_nk = p_c_z_nk.broadcast_div(&marginal_n1)?;
    Ok((p_c_z_nk, gamma_nk))
}

/// Scalars of one evaluation of the VaDE objective
pub struct VadeLoss {
    /// negative ELBO, to be minimized
    pub cost: Tensor,
    /// batch mean of log p(x|z)
    pub reconstruction_loss: Tensor,
    /// cost - reconstruction_loss
    pub regularizer: Tensor,
    /// responsibilities (n x K)
    pub gamma_nk: Tensor,
}

/// Negative ELBO of the Gaussian-mixture VAE
///
/// cost = -( E_n[ log p(x|z) - log q(z|x) ]
///          + sum_c q(c|x) * ( E_n[ log p(z|c) ] + log p(c) - log q(c|x) ) )
///
/// where q(c|x) is approximated by the batch average of γ(·,c) rather
/// than a per-sample posterior expectation.
///
/// # Arguments
/// * `x_nd` - observed batch (n x d)
/// * `latent` - encoder's q(z|x)
/// * `z_nd` - reparameterized sample from `latent`
/// * `recon` - decoder's p(x|z)
/// * `prior` - mixture prior
pub fn vade_loss(
    x_nd: &Tensor,
    latent: &LatentGaussian,
    z_nd: &Tensor,
    recon: &Reconstruction,
    prior: &MixturePrior,
) -> Result<VadeLoss> {
    let (_, gamma_nk) = mixture_responsibility(z_nd, prior)?;

    let llik_n = reconstruction_likelihood(x_nd, recon)?;
    let log_q_z_n = diag_gaussian_log_density(z_nd, &latent.mean_nd, &latent.lnvar_nd)?;

    let log_p_z_c_nk = (cluster_log_density(z_nd, prior.means(), prior.log_variances())? + DENSITY_EPS)?;
    let log_p_c_k = prior.weights().log()?;

    let q_c_k = gamma_nk.mean(0)?;
    let log_q_c_k = q_c_k.log()?;

    let cluster_term_k = ((log_p_z_c_nk.mean(0)? + log_p_c_k)? - &log_q_c_k)?;
    let cluster_term = log_q_c_k.exp()?.mul(&cluster_term_k)?.sum_all()?;
    let sample_term = (llik_n.clone() - log_q_z_n)?.mean_all()?;

    let cost = (sample_term + cluster_term)?.neg()?;
    let reconstruction_loss = llik_n.mean_all()?;
    let regularizer = (&cost - &reconstruction_loss)?;

    Ok(VadeLoss {
        cost,
        reconstruction_loss,
        regularizer,
        gamma_nk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy_prior(k: usize, d: usize, varmap: &VarMap) -> Result<MixturePrior> {
        let mut rng = StdRng::seed_from_u64(11);
        MixturePrior::new(k, d, varmap, &mut rng, &Device::Cpu)
    }

    #[test]
    fn density_at_mean() -> Result<()> {
        let dev = Device::Cpu;
        let mu_kd = Tensor::new(&[[1f32, 2.0, 3.0], [0.0, 0.0, 0.0]], &dev)?;
        let lnvar_kd = Tensor::zeros((2, 3), DType::F32, &dev)?;
        let z_nd = Tensor::new(&[[1f32, 2.0, 3.0]], &dev)?;

        let log_p = cluster_log_density(&z_nd, &mu_kd, &lnvar_kd)?.to_vec2::<f32>()?;
        let at_mean = -1.5 * LN_2PI;
        let off_mean = at_mean - 0.5 * 14.0;
        assert!((log_p[0][0] as f64 - at_mean).abs() < 1e-5);
        assert!((log_p[0][1] as f64 - off_mean).abs() < 1e-4);

        let rowwise = diag_gaussian_log_density(&z_nd, &mu_kd.narrow(0, 0, 1)?, &lnvar_kd.narrow(0, 0, 1)?)?;
        assert!((rowwise.to_vec1::<f32>()?[0] as f64 - at_mean).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn bernoulli_floor_keeps_llik_finite() -> Result<()> {
        let dev = Device::Cpu;
        let x_nd = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &dev)?;
        let mean_nd = Tensor::new(&[[1f32, 0.0], [1.0, 0.0]], &dev)?;

        let llik = bernoulli_likelihood(&x_nd, &mean_nd)?.to_vec1::<f32>()?;
        assert!(llik[0].abs() < 1e-5);
        assert!(llik[1].is_finite() && llik[1] < -40.0);
        Ok(())
    }

    #[test]
    fn gaussian_llik_is_negative_squared_error() -> Result<()> {
        let dev = Device::Cpu;
        let x_nd = Tensor::new(&[[1f32, 2.0]], &dev)?;
        let hat_nd = Tensor::new(&[[0f32, 4.0]], &dev)?;
        let llik = gaussian_likelihood(&x_nd, &hat_nd)?.to_vec1::<f32>()?;
        assert_eq!(llik, vec![-5.0]);
        Ok(())
    }

    #[test]
    fn responsibility_rows_sum_to_one() -> Result<()> {
        let varmap = VarMap::new();
        let prior = toy_prior(5, 3, &varmap)?;
        let z_nd = (Tensor::randn(0f32, 1f32, (7, 3), &Device::Cpu)? * 3.0)?;

        let (p_c_z, gamma) = mixture_responsibility(&z_nd, &prior)?;
        assert_eq!(p_c_z.dims(), &[7, 5]);
        for row in gamma.sum(1)?.to_vec1::<f32>()? {
            assert!((row - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn far_away_latent_does_not_divide_by_zero() -> Result<()> {
        let varmap = VarMap::new();
        let prior = toy_prior(3, 2, &varmap)?;
        let z_nd = Tensor::new(&[[1e3f32, -1e3]], &Device::Cpu)?;

        let (_, gamma) = mixture_responsibility(&z_nd, &prior)?;
        let gamma = gamma.to_vec2::<f32>()?;
        assert!(gamma[0].iter().all(|g| g.is_finite()));
        assert!((gamma[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn decomposition_adds_up_and_reaches_every_parameter() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let prior = toy_prior(3, 2, &varmap)?;

        let z_mean = Var::from_tensor(&Tensor::randn(0f32, 1f32, (4, 2), &dev)?)?;
        let z_lnvar = Var::from_tensor(&Tensor::zeros((4, 2), DType::F32, &dev)?)?;
        let latent = LatentGaussian {
            mean_nd: z_mean.as_tensor().clone(),
            lnvar_nd: z_lnvar.as_tensor().clone(),
        };
        let eps = Tensor::randn(0f32, 1f32, (4, 2), &dev)?;
        let z_nd = latent.sample(&eps)?;

        let x_nd = Tensor::new(&[[1f32, 0.0, 1.0], [0.0, 0.0, 1.0], [1.0, 1.0, 1.0], [0.0, 1.0, 0.0]], &dev)?;
        let recon = Reconstruction::Bernoulli {
            mean_nd: Tensor::full(0.5f32, (4, 3), &dev)?,
        };

        let loss = vade_loss(&x_nd, &latent, &z_nd, &recon, &prior)?;
        let cost = loss.cost.to_scalar::<f32>()?;
        let recon_loss = loss.reconstruction_loss.to_scalar::<f32>()?;
        let reg = loss.regularizer.to_scalar::<f32>()?;

        assert!(cost.is_finite());
        assert!((recon_loss - 3.0 * (0.5f32).ln()).abs() < 1e-4);
        assert!((recon_loss + reg - cost).abs() < 1e-4);

        let grads = loss.cost.backward()?;
        for var in [z_mean.as_tensor(), z_lnvar.as_tensor(), prior.weights(), prior.means(), prior.log_variances()] {
            assert!(grads.get(var).is_some());
        }
        Ok(())
    }

    #[test]
    fn single_cluster_is_plain_vae_objective() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let prior = toy_prior(1, 3, &varmap)?;
        prior.set_components(
            &Tensor::zeros((1, 3), DType::F32, &dev)?,
            &Tensor::zeros((1, 3), DType::F32, &dev)?,
        )?;

        let latent = LatentGaussian {
            mean_nd: Tensor::randn(0f32, 1f32, (6, 3), &dev)?,
            lnvar_nd: Tensor::randn(0f32, 0.3f32, (6, 3), &dev)?,
        };
        let z_nd = latent.sample(&Tensor::randn(0f32, 1f32, (6, 3), &dev)?)?;
        let x_nd = Tensor::randn(0f32, 1f32, (6, 5), &dev)?;
        let recon = Reconstruction::Gaussian {
            mean_nd: Tensor::zeros((6, 5), DType::F32, &dev)?,
            scale_nd: Tensor::ones((6, 5), DType::F32, &dev)?,
        };

        let loss = vade_loss(&x_nd, &latent, &z_nd, &recon, &prior)?;

        // -E[log p(x|z)] + E[log q(z|x) - log N(z; 0, I)]
        let standard = diag_gaussian_log_density(
            &z_nd,
            &Tensor::zeros((6, 3), DType::F32, &dev)?,
            &Tensor::zeros((6, 3), DType::F32, &dev)?,
        )?;
        let log_q = diag_gaussian_log_density(&z_nd, &latent.mean_nd, &latent.lnvar_nd)?;
        let kl = (log_q - standard)?.mean_all()?.to_scalar::<f32>()?;
        let llik = gaussian_likelihood(&x_nd, recon.mean())?.mean_all()?.to_scalar::<f32>()?;

        let gamma = loss.gamma_nk.to_vec2::<f32>()?;
        assert!(gamma.iter().all(|row| (row[0] - 1.0).abs() < 1e-6));
        assert!((loss.cost.to_scalar::<f32>()? - (kl - llik)).abs() < 1e-3);
        Ok(())
    }
}
