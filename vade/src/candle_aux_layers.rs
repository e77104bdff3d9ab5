use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// A stack of `M` layers, each optionally followed by an activation
pub struct StackLayers<M>
where
    M: Module,
{
    layers: Vec<(M, Option<Activation>)>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.layers.iter() {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer with an activation after all the current layers
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.layers.push((layer, Some(activation)));
    }

    pub fn push(&mut self, layer: M) {
        self.layers.push((layer, None));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}
