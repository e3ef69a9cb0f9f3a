use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "meds-patch")]
#[command(about = "Correct multi-epoch galaxy cutout files using prior fits", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Subtract neighbor models and patch bad pixels, in place
    Correct {
        /// Fit results from a prior multi-object fitting run
        fit_results: String,

        /// Cutout file to correct
        meds_file: String,

        #[command(flatten)]
        options: CorrectOptions,
    },

    /// Fit a model to every object and write a fit-results file
    Fit {
        /// Cutout file to fit
        meds_file: String,

        /// Where to write the fit results
        output: String,

        /// Fitter to use (gauss)
        #[arg(long, default_value = "gauss")]
        fitter: String,

        /// Comma-separated band names used to resolve the file's band
        #[arg(long, default_value = "g,r,i,z")]
        bands: String,

        /// Skip the per-epoch output rows
        #[arg(long)]
        no_epoch_data: bool,
    },

    /// Print the catalog of a cutout file
    ShowCatalog {
        /// Cutout file to inspect
        meds_file: String,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct CorrectOptions {
    /// Leave bad pixels unpatched (flags are still set)
    #[arg(long)]
    pub no_replace_bad: bool,

    /// Weight at or below this value counts as bad
    #[arg(long, default_value = "0.0")]
    pub min_weight: f64,

    /// Comma-separated band names used to resolve the file's band
    #[arg(long, default_value = "g,r,i,z")]
    pub bands: String,

    /// Model family used in the prior fit (cm, gauss)
    #[arg(long, default_value = "cm")]
    pub model: String,

    /// Open attempts for a file an extractor may still be settling
    #[arg(long, default_value = "10")]
    pub open_attempts: u32,
}
