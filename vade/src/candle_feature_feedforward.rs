use crate::candle_aux_layers::StackLayers;
use crate::candle_model_traits::FeatureModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// Fully connected ReLU stack: d -> layers[0] -> ... -> layers[L-1]
pub struct FeedForwardModule {
    n_input: usize,
    n_output: usize,
    fc: StackLayers<Linear>,
}

impl FeedForwardModule {
    /// Will create these variables under `vs`:
    ///
    /// * `fc.{}.weight` where {} is the layer index
    /// * `fc.{}.bias`
    ///
    /// # Arguments
    /// * `n_input` - flattened input width
    /// * `layers` - fully connected layers, each with the dim
    /// * `vs` - variable builder
    pub fn new(n_input: usize, layers: &[usize], vs: VarBuilder) -> Result<Self> {
        if layers.is_empty() {
            candle_core::bail!("feed-forward module needs at least one layer");
        }

        let mut fc = StackLayers::<Linear>::new();
        let mut prev_dim = n_input;
        for (j, &next_dim) in layers.iter().enumerate() {
            let _name = format!("fc.{}", j);
            fc.push_with_act(
                candle_nn::linear(prev_dim, next_dim, vs.pp(_name))?,
                Activation::Relu,
            );
            prev_dim = next_dim;
        }

        Ok(Self {
            n_input,
            n_output: prev_dim,
            fc,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.fc.len()
    }
}

impl FeatureModuleT for FeedForwardModule {
    fn forward_t(&self, x_nd: &Tensor, _train: bool) -> Result<Tensor> {
        self.fc.forward(x_nd)
    }

    fn dim_input(&self) -> usize {
        self.n_input
    }

    fn dim_output(&self) -> usize {
        self.n_output
    }
}
