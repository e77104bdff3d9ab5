use crate::candle_aux_layers::StackLayers;
use crate::candle_aux_linear::zero_bias_linear;
use crate::candle_model_traits::FeatureModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

const KERNEL: usize = 3;

fn conv_config(stride: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    }
}

/// spatial size after a padded 3x3 convolution
fn conv_out_size(size: usize, stride: usize) -> usize {
    (size + 2 - KERNEL) / stride + 1
}

/////////////////////////////////
// Convolutional input encoder //
/////////////////////////////////

/// Strided 3x3 convolutions over a `(channels, height, width)` image
/// that arrives flattened; each layer halves the spatial size.
pub struct ConvEncoder {
    input_shape: (usize, usize, usize),
    output_shape: (usize, usize, usize),
    conv: StackLayers<Conv2d>,
}

impl ConvEncoder {
    /// Will create `conv.{}.weight` and `conv.{}.bias` under `vs`
    ///
    /// * `input_shape` - `(channels, height, width)` of one sample
    /// * `channels` - output channels of each conv layer
    /// * `vs` - variable builder
    pub fn new(
        input_shape: (usize, usize, usize),
        channels: &[usize],
        vs: VarBuilder,
    ) -> Result<Self> {
        if channels.is_empty() {
            candle_core::bail!("conv encoder needs at least one layer");
        }

        let (mut prev_c, mut h, mut w) = input_shape;
        let mut conv = StackLayers::<Conv2d>::new();

        for (j, &next_c) in channels.iter().enumerate() {
            conv.push_with_act(
                candle_nn::conv2d(prev_c, next_c, KERNEL, conv_config(2), vs.pp(format!("conv.{}", j)))?,
                Activation::Relu,
            );
            prev_c = next_c;
            h = conv_out_size(h, 2);
            w = conv_out_size(w, 2);
        }

        Ok(Self {
            input_shape,
            output_shape: (prev_c, h, w),
            conv,
        })
    }
}

impl FeatureModuleT for ConvEncoder {
    fn forward_t(&self, x_nd: &Tensor, _train: bool) -> Result<Tensor> {
        let n = x_nd.dim(0)?;
        let (c, h, w) = self.input_shape;
        let x_nchw = x_nd.reshape((n, c, h, w))?;
        self.conv.forward(&x_nchw)?.flatten_from(1)
    }

    fn dim_input(&self) -> usize {
        let (c, h, w) = self.input_shape;
        c * h * w
    }

    fn dim_output(&self) -> usize {
        let (c, h, w) = self.output_shape;
        c * h * w
    }
}

//////////////////////////////////
// Convolutional latent decoder //
//////////////////////////////////

/// Projects a latent vector onto a `(c0, height, width)` grid and
/// refines it with same-size 3x3 convolutions.
pub struct ConvDecoder {
    n_latent: usize,
    grid_shape: (usize, usize, usize),
    n_output_channels: usize,
    project: Linear,
    conv: StackLayers<Conv2d>,
}

impl ConvDecoder {
    /// Will create `project.{weight,bias}` and `conv.{}.{weight,bias}`
    ///
    /// * `n_latent` - latent dimension
    /// * `grid_shape` - `(c0, height, width)` of the projected grid
    /// * `channels` - output channels of each conv layer
    /// * `vs` - variable builder
    pub fn new(
        n_latent: usize,
        grid_shape: (usize, usize, usize),
        channels: &[usize],
        vs: VarBuilder,
    ) -> Result<Self> {
        if channels.is_empty() {
            candle_core::bail!("conv decoder needs at least one layer");
        }

        let (c0, h, w) = grid_shape;
        let project = zero_bias_linear(n_latent, c0 * h * w, vs.pp("project"))?;

        let mut conv = StackLayers::<Conv2d>::new();
        let mut prev_c = c0;
        for (j, &next_c) in channels.iter().enumerate() {
            conv.push_with_act(
                candle_nn::conv2d(prev_c, next_c, KERNEL, conv_config(1), vs.pp(format!("conv.{}", j)))?,
                Activation::Relu,
            );
            prev_c = next_c;
        }

        Ok(Self {
            n_latent,
            grid_shape,
            n_output_channels: prev_c,
            project,
            conv,
        })
    }
}

impl FeatureModuleT for ConvDecoder {
    fn forward_t(&self, z_nk: &Tensor, _train: bool) -> Result<Tensor> {
        let n = z_nk.dim(0)?;
        let (c0, h, w) = self.grid_shape;
        let grid = self.project.forward(z_nk)?.relu()?.reshape((n, c0, h, w))?;
        self.conv.forward(&grid)?.flatten_from(1)
    }

    fn dim_input(&self) -> usize {
        self.n_latent
    }

    fn dim_output(&self) -> usize {
        let (_, h, w) = self.grid_shape;
        self.n_output_channels * h * w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn conv_encoder_halves_grid() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = ConvEncoder::new((1, 8, 8), &[4, 6], vb.pp("enc"))?;

        // 8 -> 4 -> 2
        assert_eq!(enc.dim_input(), 64);
        assert_eq!(enc.dim_output(), 6 * 2 * 2);

        let x = Tensor::rand(0f32, 1f32, (3, 64), &Device::Cpu)?;
        assert_eq!(enc.forward_t(&x, true)?.dims(), &[3, 24]);
        Ok(())
    }

    #[test]
    fn conv_decoder_keeps_grid() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dec = ConvDecoder::new(2, (3, 4, 4), &[5, 2], vb.pp("dec"))?;

        assert_eq!(dec.dim_input(), 2);
        assert_eq!(dec.dim_output(), 2 * 4 * 4);

        let z = Tensor::randn(0f32, 1f32, (3, 2), &Device::Cpu)?;
        assert_eq!(dec.forward_t(&z, false)?.dims(), &[3, 32]);
        Ok(())
    }
}
