use crate::candle_aux_linear::standard_normal;
use crate::candle_inference::{ReconstructCost, VadeConfig, VadeOptimizer};
use crate::candle_latent_heads::{GaussianLatentHead, LatentGaussian, Reconstruction, ReconstructionHead};
use crate::candle_loss_functions::{mixture_responsibility, vade_loss, VadeLoss};
use crate::candle_mixture_prior::{MixtureParameters, MixturePrior};
use crate::candle_model_traits::FeatureModuleT;
use crate::vade_error::VadeError;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{weighted::WeightedIndex, Distribution};

/// Scalars observed in one training step, before the parameter update
#[derive(Clone, Copy, Debug)]
pub struct StepLoss {
    pub cost: f32,
    pub reconstruction_loss: f32,
    pub regularizer: f32,
}

/// Variational deep embedding: a VAE whose latent prior is a
/// learnable Gaussian mixture.
///
/// The model owns every trainable variable (feature modules, heads and
/// mixture) in one `VarMap`, together with the optimizer and the random
/// number generator that feeds the reparameterization noise. Training
/// and sampling take `&mut self`; deterministic inference takes `&self`.
pub struct Vade<Enc, Dec>
where
    Enc: FeatureModuleT,
    Dec: FeatureModuleT,
{
    config: VadeConfig,
    encoder: Enc,
    decoder: Dec,
    latent_head: GaussianLatentHead,
    recon_head: ReconstructionHead,
    prior: MixturePrior,
    variable_map: VarMap,
    optimizer: VadeOptimizer,
    rng: StdRng,
}

impl<Enc, Dec> Vade<Enc, Dec>
where
    Enc: FeatureModuleT,
    Dec: FeatureModuleT,
{
    /// Build a VaDE model
    ///
    /// The feature modules are created here so that their variables
    /// land in the model's `VarMap`:
    ///
    /// * `enc.net.*` - whatever `build_encoder` creates
    /// * `enc.z.{mean,lnvar}.*` - latent Gaussian heads
    /// * `dec.net.*` - whatever `build_decoder` creates
    /// * `dec.x.{mean,scale}.*` - reconstruction heads
    /// * `gmm.{pi,mu,lnvar}` - mixture prior
    ///
    /// Every weight is then redrawn from the seeded generator through
    /// the owning module's `initialize_weights`, and biases are zeroed,
    /// so two models built from the same config are identical.
    ///
    /// # Arguments
    /// * `config` - hyperparameters
    /// * `build_encoder` - encoder constructor taking `d = prod(input_shape)` inputs
    /// * `build_decoder` - decoder constructor taking `latent_dim` inputs
    pub fn build<FE, FD>(config: VadeConfig, build_encoder: FE, build_decoder: FD) -> anyhow::Result<Self>
    where
        FE: FnOnce(VarBuilder) -> candle_core::Result<Enc>,
        FD: FnOnce(VarBuilder) -> candle_core::Result<Dec>,
    {
        config.validate()?;

        let dev = config.device.clone();
        let n_input = config.num_input_vals();
        let n_latent = config.latent_dim;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, &dev);

        let encoder = build_encoder(vs.pp("enc.net"))?;
        let decoder = build_decoder(vs.pp("dec.net"))?;

        if encoder.dim_input() != n_input {
            return Err(VadeError::configuration(format!(
                "encoder takes {} inputs but input_shape {:?} flattens to {}",
                encoder.dim_input(),
                config.input_shape,
                n_input
            ))
            .into());
        }

        if decoder.dim_input() != n_latent {
            return Err(VadeError::configuration(format!(
                "decoder takes {} inputs but latent_dim is {}",
                decoder.dim_input(),
                n_latent
            ))
            .into());
        }

        let latent_head = GaussianLatentHead::new(encoder.dim_output(), n_latent, vs.pp("enc"))?;

        let recon_head = match config.reconstruct_cost {
            ReconstructCost::Bernoulli => {
                ReconstructionHead::bernoulli(decoder.dim_output(), n_input, vs.pp("dec"))?
            }
            ReconstructCost::Gaussian => {
                ReconstructionHead::gaussian(decoder.dim_output(), n_input, vs.pp("dec"))?
            }
        };

        reset_parameters(&variable_map, &encoder, &decoder, &mut rng, &dev)?;

        let prior = MixturePrior::new(config.num_clusters, n_latent, &variable_map, &mut rng, &dev)?;

        let optimizer = VadeOptimizer::new(
            config.optimizer,
            variable_map.all_vars(),
            config.learning_rate,
        )?;

        debug!(
            "VaDE: d={} -> {} -> z={} (K={}), {} variables, {:?}",
            n_input,
            encoder.dim_output(),
            n_latent,
            config.num_clusters,
            variable_map.all_vars().len(),
            config.reconstruct_cost
        );

        Ok(Self {
            config,
            encoder,
            decoder,
            latent_head,
            recon_head,
            prior,
            variable_map,
            optimizer,
            rng,
        })
    }

    pub fn config(&self) -> &VadeConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Enc {
        &self.encoder
    }

    pub fn decoder(&self) -> &Dec {
        &self.decoder
    }

    pub fn prior(&self) -> &MixturePrior {
        &self.prior
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    fn device(&self) -> &Device {
        &self.config.device
    }

    /// Accept `(n, d)` or `(n, input_shape...)`; return `(n, d)` f32
    fn flatten_input(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        let dims = x.dims();
        let n_input = self.config.num_input_vals();

        let x_nd = if dims.len() == 2 && dims[1] == n_input {
            x.clone()
        } else if dims.len() == self.config.input_shape.len() + 1
            && dims[1..] == self.config.input_shape[..]
        {
            x.flatten_from(1)?
        } else {
            return Err(VadeError::shape_mismatch(
                "network input",
                ("n", &self.config.input_shape),
                dims,
            )
            .into());
        };

        if x_nd.dim(0)? == 0 {
            return Err(VadeError::shape_mismatch("network input", "at least one row", dims).into());
        }

        Ok(x_nd.to_dtype(DType::F32)?.to_device(self.device())?)
    }

    /// Accept `(n, D)` or a single `(D)` latent vector
    fn check_latent(&self, z: &Tensor) -> anyhow::Result<Tensor> {
        let n_latent = self.config.latent_dim;
        let z_nd = match z.dims() {
            [d] if *d == n_latent => z.unsqueeze(0)?,
            [n, d] if *n > 0 && *d == n_latent => z.clone(),
            dims => {
                return Err(VadeError::shape_mismatch("latent input", ("n", n_latent), dims).into());
            }
        };
        Ok(z_nd.to_dtype(DType::F32)?.to_device(self.device())?)
    }

    fn latent(&self, x_nd: &Tensor, train: bool) -> candle_core::Result<LatentGaussian> {
        let h_nf = self.encoder.forward_t(x_nd, train)?;
        self.latent_head.forward(&h_nf)
    }

    fn reconstruction(&self, z_nd: &Tensor, train: bool) -> candle_core::Result<Reconstruction> {
        let h_nf = self.decoder.forward_t(z_nd, train)?;
        self.recon_head.forward(&h_nf)
    }

    /// Evaluate the objective on a flattened batch with given noise
    ///
    /// * `x_nd` - observed batch (n x d)
    /// * `eps_nd` - standard normal noise (n x D)
    pub fn loss_with_noise(&self, x_nd: &Tensor, eps_nd: &Tensor) -> candle_core::Result<VadeLoss> {
        let latent = self.latent(x_nd, true)?;
        let z_nd = latent.sample(eps_nd)?;
        let recon = self.reconstruction(&z_nd, true)?;
        vade_loss(x_nd, &latent, &z_nd, &recon, &self.prior)
    }

    /// Evaluate the objective on a batch, drawing fresh noise
    pub fn loss(&mut self, x: &Tensor) -> anyhow::Result<VadeLoss> {
        let x_nd = self.flatten_input(x)?;
        let n = x_nd.dim(0)?;
        let eps_nd = standard_normal(&[n, self.config.latent_dim], &mut self.rng, &self.config.device)?;
        Ok(self.loss_with_noise(&x_nd, &eps_nd)?)
    }

    /// One optimizer update on a minibatch, then π ← π / Σ π.
    ///
    /// The returned scalars are those of the forward pass that
    /// produced the gradient. The batch size may differ between calls.
    pub fn step(&mut self, x: &Tensor) -> anyhow::Result<StepLoss> {
        let loss = self.loss(x)?;

        let ret = StepLoss {
            cost: loss.cost.to_scalar::<f32>()?,
            reconstruction_loss: loss.reconstruction_loss.to_scalar::<f32>()?,
            regularizer: loss.regularizer.to_scalar::<f32>()?,
        };

        if !ret.cost.is_finite() {
            warn!("non-finite cost {} in this step", ret.cost);
        }

        self.optimizer.backward_step(&loss.cost)?;
        self.prior.renormalize_weights()?;

        Ok(ret)
    }

    /// Train on all rows of `x` for `config.num_epochs` epochs
    ///
    /// Rows are reshuffled every epoch and split into minibatches of
    /// `config.batch_size`; the last minibatch may be smaller.
    ///
    /// # Returns the average cost of each epoch
    pub fn fit(&mut self, x: &Tensor) -> anyhow::Result<Vec<f32>> {
        let x_nd = self.flatten_input(x)?;
        let n = x_nd.dim(0)?;
        let batch_size = self.config.batch_size;
        let num_epochs = self.config.num_epochs;

        let pb = ProgressBar::new(num_epochs as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let n_rows = u32::try_from(n)
            .map_err(|_| anyhow::anyhow!("{} rows exceed the u32 row index range", n))?;
        let mut rows: Vec<u32> = (0..n_rows).collect();
        let mut cost_trace = Vec::with_capacity(num_epochs);

        for epoch in 0..num_epochs {
            rows.shuffle(&mut self.rng);

            let mut cost_tot = 0f32;
            let mut num_batches = 0;

            for chunk in rows.chunks(batch_size) {
                let idx = Tensor::from_slice(chunk, chunk.len(), self.device())?;
                let x_batch = x_nd.index_select(&idx, 0)?;
                let loss = self.step(&x_batch)?;
                cost_tot += loss.cost;
                num_batches += 1;
            }

            let cost = cost_tot / num_batches as f32;
            cost_trace.push(cost);
            pb.inc(1);

            if self.config.verbose {
                info!("[{}] cost: {}", epoch + 1, cost);
            }
        }

        pb.finish_and_clear();
        Ok(cost_trace)
    }

    /// Posterior mean and standard deviation of q(z|x)
    ///
    /// # Returns `(mean_nd, std_nd)`
    pub fn encode(&self, x: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let x_nd = self.flatten_input(x)?;
        let latent = self.latent(&x_nd, false)?;
        Ok((latent.mean_nd.detach(), latent.std_nd()?.detach()))
    }

    /// Encode, sample z, decode.
    ///
    /// Bernoulli returns the success probabilities; Gaussian returns a
    /// draw `mean + scale * eps`.
    pub fn reconstruct(&mut self, x: &Tensor) -> anyhow::Result<Tensor> {
        let x_nd = self.flatten_input(x)?;
        let n = x_nd.dim(0)?;
        let dev = self.config.device.clone();

        let latent = self.latent(&x_nd, false)?;
        let eps_nd = standard_normal(&[n, self.config.latent_dim], &mut self.rng, &dev)?;
        let z_nd = latent.sample(&eps_nd)?;

        let recon = match self.reconstruction(&z_nd, false)? {
            Reconstruction::Bernoulli { mean_nd } => mean_nd,
            Reconstruction::Gaussian { mean_nd, scale_nd } => {
                let eps_nd = standard_normal(scale_nd.dims(), &mut self.rng, &dev)?;
                (mean_nd + scale_nd.mul(&eps_nd)?)?
            }
        };
        Ok(recon.detach())
    }

    /// Decode `z` if given; otherwise pick a cluster c ~ Categorical(π),
    /// draw z ~ N(μ(c), v(c)) and decode that.
    ///
    /// # Returns the reconstruction mean (n x d)
    pub fn generate(&mut self, z: Option<&Tensor>) -> anyhow::Result<Tensor> {
        match z {
            Some(z) => {
                let z_nd = self.check_latent(z)?;
                Ok(self.reconstruction(&z_nd, false)?.mean().detach())
            }
            None => {
                let cluster = self.sample_cluster()?;
                self.generate_from_cluster(cluster, 1)
            }
        }
    }

    /// Decode `num_samples` latent draws from cluster `cluster`
    pub fn generate_from_cluster(&mut self, cluster: usize, num_samples: usize) -> anyhow::Result<Tensor> {
        let num_clusters = self.config.num_clusters;
        if cluster >= num_clusters {
            return Err(VadeError::shape_mismatch("cluster index", 0..num_clusters, cluster).into());
        }
        if num_samples == 0 {
            return Err(VadeError::shape_mismatch("number of samples", "at least one", 0).into());
        }

        let dev = self.config.device.clone();
        let mu_1d = self.prior.means().narrow(0, cluster, 1)?.detach();
        let std_1d = self.prior.log_variances().narrow(0, cluster, 1)?.exp()?.sqrt()?.detach();

        let eps_nd = standard_normal(&[num_samples, self.config.latent_dim], &mut self.rng, &dev)?;
        let z_nd = eps_nd.broadcast_mul(&std_1d)?.broadcast_add(&mu_1d)?;

        Ok(self.reconstruction(&z_nd, false)?.mean().detach())
    }

    fn sample_cluster(&mut self) -> anyhow::Result<usize> {
        let weights = self.prior.weights().to_vec1::<f32>()?;

        if weights.iter().any(|&w| w < 0.0) {
            warn!("negative mixture weights {:?}; treating them as zero", weights);
        }

        let weights: Vec<f32> = weights.into_iter().map(|w| w.max(0.0)).collect();
        let disc = WeightedIndex::new(&weights)
            .map_err(|e| anyhow::anyhow!("cannot sample a cluster from {:?}: {}", weights, e))?;
        Ok(disc.sample(&mut self.rng))
    }

    /// Current (π, μ, σ) with σ = sqrt(exp(lnvar))
    pub fn mixture_parameters(&self) -> anyhow::Result<MixtureParameters> {
        Ok(self.prior.snapshot()?)
    }

    /// Cluster responsibilities γ evaluated at the posterior mean of z
    ///
    /// # Returns `gamma_nk` (n x K), rows on the simplex
    pub fn responsibility(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        let x_nd = self.flatten_input(x)?;
        let latent = self.latent(&x_nd, false)?;
        let (_, gamma_nk) = mixture_responsibility(&latent.mean_nd, &self.prior)?;
        Ok(gamma_nk.detach())
    }

    /// Hard cluster assignment `argmax_c γ(i,c)`
    pub fn predict_clusters(&self, x: &Tensor) -> anyhow::Result<Vec<usize>> {
        let gamma_nk = self.responsibility(x)?;
        Ok(gamma_nk
            .argmax(1)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|k| k as usize)
            .collect())
    }
}

/// Redraw every network variable from `rng` in name order: weights
/// through the owning module's initializer, biases as zeros.
fn reset_parameters<Enc, Dec>(
    variable_map: &VarMap,
    encoder: &Enc,
    decoder: &Dec,
    rng: &mut StdRng,
    dev: &Device,
) -> anyhow::Result<()>
where
    Enc: FeatureModuleT,
    Dec: FeatureModuleT,
{
    let data = variable_map
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();

        let init = if dims.len() < 2 {
            Tensor::zeros(dims.as_slice(), DType::F32, dev)?
        } else if name.starts_with("dec.") {
            decoder.initialize_weights(&dims, rng, dev)?
        } else {
            encoder.initialize_weights(&dims, rng, dev)?
        };

        var.set(&init)?;
    }
    Ok(())
}
