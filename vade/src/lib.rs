pub mod candle_aux_layers;
pub mod candle_aux_linear;
pub mod candle_feature_conv;
pub mod candle_feature_feedforward;
pub mod candle_inference;
pub mod candle_latent_heads;
pub mod candle_loss_functions;
pub mod candle_mixture_prior;
pub mod candle_model_traits;
pub mod candle_vade_inference;
pub mod cli;
pub mod vade_error;

pub use candle_core;
pub use candle_nn;
