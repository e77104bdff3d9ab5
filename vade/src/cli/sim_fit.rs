use crate::candle_feature_feedforward::FeedForwardModule;
use crate::candle_inference::{OptimizerKind, ReconstructCost, VadeConfig};
use crate::candle_vade_inference::Vade;

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::{Args, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution, Normal};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct SimFitArgs {
    #[arg(long, default_value = "500", help = "Number of simulated samples")]
    pub num_samples: usize,

    #[arg(long, default_value = "32", help = "Number of features per sample")]
    pub num_features: usize,

    #[arg(short = 'k', long, default_value = "4", help = "Number of clusters (true and fitted)")]
    pub num_clusters: usize,

    #[arg(long, default_value = "2", help = "Latent dimension")]
    pub latent_dim: usize,

    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = vec![64, 32],
        help = "Hidden layers of the encoder (the decoder mirrors them)"
    )]
    pub encoder_layers: Vec<usize>,

    #[arg(short = 'b', long, default_value = "50")]
    pub batch_size: usize,

    #[arg(short = 'i', long, default_value = "100")]
    pub epochs: usize,

    #[arg(long, default_value = "1e-3")]
    pub learning_rate: f32,

    #[arg(long, value_enum, default_value = "adam")]
    pub optimizer: OptimizerKind,

    #[arg(long, value_enum, default_value = "bernoulli")]
    pub reconstruct_cost: ReconstructCost,

    #[arg(long, default_value = "42")]
    pub rseed: u64,

    #[arg(long, value_enum, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Simulated samples with their generating cluster
pub struct SimOut {
    pub x_nd: Tensor,
    pub labels: Vec<usize>,
}

/// Draw `n` samples from a `k`-component mixture
///
/// ```text
/// Bernoulli: x(i,j) ~ Bernoulli( p(c_i, j) ), p in {0.1, 0.9}
/// Gaussian:  x(i,j) ~ N( mu(c_i, j), 1 ), mu ~ N(0, 3^2)
/// ```
pub fn simulate_clustered_data(
    n: usize,
    d: usize,
    k: usize,
    family: ReconstructCost,
    rseed: u64,
) -> Result<SimOut> {
    let mut rng = StdRng::seed_from_u64(rseed);

    let labels: Vec<usize> = (0..n).map(|_| rng.random_range(0..k)).collect();
    let mut data = Vec::with_capacity(n * d);

    match family {
        ReconstructCost::Bernoulli => {
            let hi = Bernoulli::new(0.9)?;
            let lo = Bernoulli::new(0.1)?;
            let proto: Vec<Vec<bool>> = (0..k)
                .map(|_| (0..d).map(|_| rng.random_bool(0.5)).collect())
                .collect();
            for &c in labels.iter() {
                for &on in proto[c].iter() {
                    let x = if on { hi.sample(&mut rng) } else { lo.sample(&mut rng) };
                    data.push(if x { 1f32 } else { 0f32 });
                }
            }
        }
        ReconstructCost::Gaussian => {
            let center = Normal::new(0f32, 3f32)?;
            let noise = Normal::new(0f32, 1f32)?;
            let mu: Vec<Vec<f32>> = (0..k)
                .map(|_| (0..d).map(|_| center.sample(&mut rng)).collect())
                .collect();
            for &c in labels.iter() {
                for &m in mu[c].iter() {
                    data.push(m + noise.sample(&mut rng));
                }
            }
        }
    }

    Ok(SimOut {
        x_nd: Tensor::from_vec(data, (n, d), &Device::Cpu)?,
        labels,
    })
}

/// count(true, predicted)
pub fn contingency_table(labels: &[usize], predicted: &[usize], k: usize) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0; k]; k];
    for (&t, &p) in labels.iter().zip(predicted.iter()) {
        if t < k && p < k {
            table[t][p] += 1;
        }
    }
    table
}

pub fn run(args: &SimFitArgs) -> Result<()> {
    let device = match args.device {
        ComputeDevice::Metal => Device::new_metal(0)?,
        ComputeDevice::Cuda => Device::new_cuda(0)?,
        _ => Device::Cpu,
    };

    let sim = simulate_clustered_data(
        args.num_samples,
        args.num_features,
        args.num_clusters,
        args.reconstruct_cost,
        args.rseed,
    )?;

    info!(
        "simulated {} x {} data from {} clusters",
        args.num_samples, args.num_features, args.num_clusters
    );

    let config = VadeConfig::new(&[args.num_features], args.latent_dim, args.num_clusters)
        .with_batch_size(args.batch_size)
        .with_num_epochs(args.epochs)
        .with_learning_rate(args.learning_rate)
        .with_optimizer(args.optimizer)
        .with_reconstruct_cost(args.reconstruct_cost)
        .with_seed(args.rseed)
        .with_device(device)
        .with_verbose(args.verbose)
        .with_show_progress(true);

    let enc_layers = args.encoder_layers.clone();
    let dec_layers: Vec<usize> = args.encoder_layers.iter().rev().cloned().collect();
    let (d, k) = (args.num_features, args.latent_dim);

    let mut model = Vade::build(
        config,
        |vb| FeedForwardModule::new(d, &enc_layers, vb),
        |vb| FeedForwardModule::new(k, &dec_layers, vb),
    )?;

    let cost_trace = model.fit(&sim.x_nd)?;

    if let Some(last) = cost_trace.last() {
        info!("final cost after {} epochs: {}", cost_trace.len(), last);
    }

    let params = model.mixture_parameters()?;
    info!("mixture weights: {:?}", params.weights_k.to_vec1::<f32>()?);

    let predicted = model.predict_clusters(&sim.x_nd)?;
    let table = contingency_table(&sim.labels, &predicted, args.num_clusters);

    info!("true cluster x predicted cluster:");
    for (t, row) in table.iter().enumerate() {
        info!("[{}] {:?}", t, row);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_bernoulli_is_binary() -> Result<()> {
        let sim = simulate_clustered_data(20, 6, 3, ReconstructCost::Bernoulli, 1)?;
        assert_eq!(sim.x_nd.dims(), &[20, 6]);
        assert_eq!(sim.labels.len(), 20);
        assert!(sim.labels.iter().all(|&c| c < 3));

        let vals = sim.x_nd.to_vec2::<f32>()?;
        assert!(vals.iter().flatten().all(|&x| x == 0.0 || x == 1.0));
        Ok(())
    }

    #[test]
    fn contingency_counts_pairs() {
        let table = contingency_table(&[0, 0, 1, 2], &[1, 1, 0, 2], 3);
        assert_eq!(table, vec![vec![0, 2, 0], vec![1, 0, 0], vec![0, 0, 1]]);
    }
}
