use clap::Parser;

use meds_patch::cli::{Cli, Commands};
use meds_patch::commands;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Correct {
            fit_results,
            meds_file,
            options,
        } => {
            commands::correct_file(&fit_results, &meds_file, &options)?;
        }
        Commands::Fit {
            meds_file,
            output,
            fitter,
            bands,
            no_epoch_data,
        } => {
            commands::fit_file(&meds_file, &output, &fitter, &bands, no_epoch_data)?;
        }
        Commands::ShowCatalog { meds_file } => {
            commands::show_catalog(&meds_file)?;
        }
    }

    Ok(())
}
