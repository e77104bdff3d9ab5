pub mod sim_fit;

use clap::{Parser, Subcommand};

pub use sim_fit::SimFitArgs;

#[derive(Parser)]
#[command(name = "vade")]
#[command(about = "Variational deep embedding: clustering with a Gaussian-mixture VAE")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate clustered data and fit a VaDE model on it
    SimFit(SimFitArgs),
}
