use crate::candle_aux_linear::standard_normal;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;

/// Learnable Gaussian-mixture prior over the latent space
///
/// p(z) = Σ_c π(c) N(z; μ(c), diag(exp(lnvar(c))))
///
/// The parameters are `Var`s registered in the model's `VarMap`, so
/// the optimizer updates them together with the network weights.
pub struct MixturePrior {
    n_clusters: usize,
    n_latent: usize,
    pub(crate) pi_k: Var,
    mu_kd: Var,
    lnvar_kd: Var,
}

/// Read-only copy of the mixture parameters
pub struct MixtureParameters {
    /// mixture weights (K)
    pub weights_k: Tensor,
    /// cluster means (K x D)
    pub mean_kd: Tensor,
    /// cluster standard deviations (K x D)
    pub std_kd: Tensor,
}

impl MixturePrior {
    /// Will register these variables in `variable_map`:
    ///
    /// * `gmm.pi` - uniform weights 1/K
    /// * `gmm.mu` - K draws from N(0, I)
    /// * `gmm.lnvar` - all ones
    ///
    /// # Arguments
    /// * `n_clusters` - number of mixture components K
    /// * `n_latent` - latent dimension D
    /// * `variable_map` - where trainable variables live
    /// * `rng` - source for the initial means
    pub fn new(
        n_clusters: usize,
        n_latent: usize,
        variable_map: &VarMap,
        rng: &mut StdRng,
        dev: &Device,
    ) -> Result<Self> {
        let pi_init = Tensor::full(1f32 / n_clusters as f32, n_clusters, dev)?;
        let mu_init = standard_normal(&[n_clusters, n_latent], rng, dev)?;
        let lnvar_init = Tensor::ones((n_clusters, n_latent), DType::F32, dev)?;

        let pi_k = Var::from_tensor(&pi_init)?;
        let mu_kd = Var::from_tensor(&mu_init)?;
        let lnvar_kd = Var::from_tensor(&lnvar_init)?;

        {
            let mut data = variable_map
                .data()
                .lock()
                .map_err(|e| candle_core::Error::Msg(format!("variable map lock: {}", e)))?;
            data.insert("gmm.pi".to_string(), pi_k.clone());
            data.insert("gmm.mu".to_string(), mu_kd.clone());
            data.insert("gmm.lnvar".to_string(), lnvar_kd.clone());
        }

        Ok(Self {
            n_clusters,
            n_latent,
            pi_k,
            mu_kd,
            lnvar_kd,
        })
    }

    pub fn num_clusters(&self) -> usize {
        self.n_clusters
    }

    pub fn dim_latent(&self) -> usize {
        self.n_latent
    }

    /// mixture weights π (K)
    pub fn weights(&self) -> &Tensor {
        self.pi_k.as_tensor()
    }

    /// cluster means μ (K x D)
    pub fn means(&self) -> &Tensor {
        self.mu_kd.as_tensor()
    }

    /// cluster log-variances (K x D)
    pub fn log_variances(&self) -> &Tensor {
        self.lnvar_kd.as_tensor()
    }

    /// π ← π / Σ π
    ///
    /// The gradient step does not keep π on the simplex, so this has
    /// to run after every optimizer update.
    pub fn renormalize_weights(&self) -> Result<()> {
        let pi = self.pi_k.as_tensor().detach();
        let normalized = pi.broadcast_div(&pi.sum_keepdim(0)?)?;
        self.pi_k.set(&normalized)
    }

    /// Overwrite means and log-variances, e.g., from an external
    /// initialization such as k-means on the latent codes
    pub fn set_components(&self, mu_kd: &Tensor, lnvar_kd: &Tensor) -> Result<()> {
        self.mu_kd.set(mu_kd)?;
        self.lnvar_kd.set(lnvar_kd)
    }

    pub fn snapshot(&self) -> Result<MixtureParameters> {
        Ok(MixtureParameters {
            weights_k: self.weights().detach().copy()?,
            mean_kd: self.means().detach().copy()?,
            std_kd: self.log_variances().detach().exp()?.sqrt()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn initial_state() -> Result<()> {
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(1);
        let prior = MixturePrior::new(4, 3, &varmap, &mut rng, &Device::Cpu)?;

        assert_eq!(varmap.all_vars().len(), 3);
        assert_eq!(prior.num_clusters(), 4);
        assert_eq!(prior.dim_latent(), 3);
        assert_eq!(prior.means().dims(), &[4, 3]);

        let pi = prior.weights().to_vec1::<f32>()?;
        assert!(pi.iter().all(|&p| (p - 0.25).abs() < 1e-6));

        let lnvar = prior.log_variances().to_vec2::<f32>()?;
        assert!(lnvar.iter().flatten().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn renormalize_puts_weights_back_on_simplex() -> Result<()> {
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(2);
        let prior = MixturePrior::new(3, 2, &varmap, &mut rng, &Device::Cpu)?;

        let off_simplex = Tensor::new(&[0.5f32, 1.0, 2.5], &Device::Cpu)?;
        prior.pi_k.set(&off_simplex)?;
        prior.renormalize_weights()?;

        let pi = prior.weights().to_vec1::<f32>()?;
        assert!((pi.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((pi[2] - 0.625).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn snapshot_reports_std() -> Result<()> {
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(3);
        let prior = MixturePrior::new(2, 2, &varmap, &mut rng, &Device::Cpu)?;

        let params = prior.snapshot()?;
        let expected = (0.5f32).exp();
        for s in params.std_kd.to_vec2::<f32>()?.iter().flatten() {
            assert!((s - expected).abs() < 1e-5);
        }
        Ok(())
    }
}
