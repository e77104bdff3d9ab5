use crate::vade_error::VadeError;
use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use std::str::FromStr;

/// Likelihood family of p(x|z)
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ReconstructCost {
    Bernoulli,
    Gaussian,
}

impl FromStr for ReconstructCost {
    type Err = VadeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bernoulli" => Ok(Self::Bernoulli),
            "gaussian" => Ok(Self::Gaussian),
            _ => Err(VadeError::configuration(format!(
                "unsupported reconstruct_cost `{}`; expected `bernoulli` or `gaussian`",
                s
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OptimizerKind {
    /// Adam without weight decay
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = VadeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adam" | "adamw" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            _ => Err(VadeError::configuration(format!(
                "unsupported optimizer `{}`; expected `adam` or `sgd`",
                s
            ))),
        }
    }
}

/// Hyperparameters fixed at model construction
#[derive(Clone, Debug)]
pub struct VadeConfig {
    /// shape of one sample; the model sees it flattened
    pub input_shape: Vec<usize>,
    pub latent_dim: usize,
    pub num_clusters: usize,
    /// minibatch size used by `fit`; `step` accepts any batch size
    pub batch_size: usize,
    pub learning_rate: f32,
    pub reconstruct_cost: ReconstructCost,
    pub optimizer: OptimizerKind,
    /// reserved; not used by the objective
    pub alpha: f32,
    pub num_epochs: usize,
    pub seed: u64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl VadeConfig {
    pub fn new(input_shape: &[usize], latent_dim: usize, num_clusters: usize) -> Self {
        Self {
            input_shape: input_shape.to_vec(),
            latent_dim,
            num_clusters,
            batch_size: 100,
            learning_rate: 1e-3,
            reconstruct_cost: ReconstructCost::Bernoulli,
            optimizer: OptimizerKind::Adam,
            alpha: 1.0,
            num_epochs: 100,
            seed: 42,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_reconstruct_cost(mut self, reconstruct_cost: ReconstructCost) -> Self {
        self.reconstruct_cost = reconstruct_cost;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_device(mut self, device: candle_core::Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// number of values in one flattened sample
    pub fn num_input_vals(&self) -> usize {
        self.input_shape.iter().product()
    }

    pub fn validate(&self) -> std::result::Result<(), VadeError> {
        if self.input_shape.is_empty() || self.num_input_vals() == 0 {
            return Err(VadeError::configuration(format!(
                "input_shape must be non-empty with positive extents, got {:?}",
                self.input_shape
            )));
        }
        if self.latent_dim == 0 {
            return Err(VadeError::configuration("latent_dim must be at least 1"));
        }
        if self.num_clusters == 0 {
            return Err(VadeError::configuration("num_clusters must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(VadeError::configuration("batch_size must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(VadeError::configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// The optimizer picked by `OptimizerKind`
pub enum VadeOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl VadeOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, learning_rate: f32) -> Result<Self> {
        let lr = learning_rate as f64;
        Ok(match kind {
            OptimizerKind::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, lr)?),
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::Adam(adam) => adam.backward_step(loss),
            Self::Sgd(sgd) => sgd.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(adam) => adam.learning_rate(),
            Self::Sgd(sgd) => sgd.learning_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reconstruct_cost() {
        assert_eq!("bernoulli".parse::<ReconstructCost>(), Ok(ReconstructCost::Bernoulli));
        assert_eq!("Gaussian".parse::<ReconstructCost>(), Ok(ReconstructCost::Gaussian));
        assert!(matches!(
            "poisson".parse::<ReconstructCost>(),
            Err(VadeError::Configuration(_))
        ));
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        assert!(VadeConfig::new(&[8], 2, 3).validate().is_ok());
        assert!(VadeConfig::new(&[8], 2, 0).validate().is_err());
        assert!(VadeConfig::new(&[8], 0, 3).validate().is_err());
        assert!(VadeConfig::new(&[], 2, 3).validate().is_err());
        assert!(VadeConfig::new(&[8], 2, 3).with_batch_size(0).validate().is_err());
        assert!(VadeConfig::new(&[8], 2, 3).with_learning_rate(-1.0).validate().is_err());
    }

    #[test]
    fn adam_does_not_decay_weights() -> Result<()> {
        let var = Var::new(&[1f32, -2.0], &candle_core::Device::Cpu)?;
        let mut opt = VadeOptimizer::new(OptimizerKind::Adam, vec![var.clone()], 0.05)?;
        assert!((opt.learning_rate() - 0.05).abs() < 1e-6);

        if let VadeOptimizer::Adam(adam) = &opt {
            assert_eq!(adam.params().weight_decay, 0.0);
        }

        // zero gradient: Adam moves nothing without decay
        let loss = (var.as_tensor() * 0.0)?.sum_all()?;
        opt.backward_step(&loss)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![1f32, -2.0]);
        Ok(())
    }

    #[test]
    fn sgd_reports_its_learning_rate() -> Result<()> {
        let var = Var::new(&[0f32], &candle_core::Device::Cpu)?;
        let opt = VadeOptimizer::new(OptimizerKind::Sgd, vec![var], 0.25)?;
        assert!((opt.learning_rate() - 0.25).abs() < 1e-9);
        Ok(())
    }
}
