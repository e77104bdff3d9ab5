use anyhow::Result;
use clap::Parser;
use vade::cli::{sim_fit, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::SimFit(args) => {
            sim_fit::run(args)?;
        }
    }

    Ok(())
}
