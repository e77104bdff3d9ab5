use candle_core::{Device, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// Linear layer `h -> h W' + b` with a zero-initialized bias.
///
/// * `weight` - (out_dim x in_dim)
/// * `bias` - (out_dim)
pub fn zero_bias_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(ws, Some(bs)))
}

/// Standard normal noise of shape `dims`
pub fn standard_normal(dims: &[usize], rng: &mut StdRng, dev: &Device) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(data, dims, dev)
}

/// Glorot-style normal draw, `sd = sqrt(2 / (fan_in + fan_out))`.
///
/// `dims` follows candle's layout: `(out, in)` for linear weights and
/// `(out, in, kh, kw)` for convolution kernels.
pub fn variance_scaled_normal(dims: &[usize], rng: &mut StdRng, dev: &Device) -> Result<Tensor> {
    let (fan_out, fan_in) = match dims {
        [] => (1, 1),
        [d] => (*d, *d),
        [out_dim, in_dim, rest @ ..] => {
            let receptive: usize = rest.iter().product();
            (out_dim * receptive, in_dim * receptive)
        }
    };
    let sd = (2.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    standard_normal(dims, rng, dev)? * sd
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn variance_scaled_spread() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let w = variance_scaled_normal(&[200, 300], &mut rng, &Device::Cpu)?;
        assert_eq!(w.dims(), &[200, 300]);

        let var = w.sqr()?.mean_all()?.to_scalar::<f32>()?;
        let expected = 2.0 / 500.0;
        assert!((var - expected).abs() < 0.1 * expected, "var {}", var);
        Ok(())
    }

    #[test]
    fn seeded_noise_repeats() -> Result<()> {
        let a = standard_normal(&[3, 4], &mut StdRng::seed_from_u64(42), &Device::Cpu)?;
        let b = standard_normal(&[3, 4], &mut StdRng::seed_from_u64(42), &Device::Cpu)?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }
}
