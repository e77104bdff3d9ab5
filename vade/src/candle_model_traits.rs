use crate::candle_aux_linear::variance_scaled_normal;
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;

/// A feature transformer sitting in front of (encoder) or behind
/// (decoder) the latent space. The model only sees its output features
/// and attaches its own linear heads on top.
pub trait FeatureModuleT {
    /// Map a flattened input batch to features
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether we are in a training pass
    ///
    /// # Returns `h_nf` - features (n x f)
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor>;

    /// Flattened input width `d`
    fn dim_input(&self) -> usize;

    /// Output feature width `f`
    fn dim_output(&self) -> usize;

    /// Draw initial weights for a layer of shape `dims` (out-major).
    /// Heads the model introduces on top of this module are drawn
    /// through here as well.
    fn initialize_weights(&self, dims: &[usize], rng: &mut StdRng, dev: &Device) -> Result<Tensor> {
        variance_scaled_normal(dims, rng, dev)
    }
}
