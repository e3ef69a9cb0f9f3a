use anyhow::{Context, Result};
use std::path::Path;

use crate::bands::resolve_band;
use crate::cli::CorrectOptions;
use crate::corrector::{Corrector, CorrectorConfig};
use crate::fitres::FitResults;
use crate::meds_file::MedsFile;
use crate::render::{GalaxyModel, GaussRenderer};

/// Run the correction pass over one cutout file, in place.
pub fn correct_file(fit_results: &str, meds_file: &str, options: &CorrectOptions) -> Result<()> {
    let band_names: Vec<&str> = options.bands.split(',').map(|s| s.trim()).collect();
    let band = resolve_band(meds_file, &band_names)?;
    let model: GalaxyModel = options
        .model
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let results = FitResults::load(Path::new(fit_results))?;
    tracing::info!(
        "loaded {} fits, {} neighbor rows, {} epoch rows from {}",
        results.fits.len(),
        results.nbrs.len(),
        results.epochs.len(),
        fit_results
    );

    let mut store = MedsFile::open_rw_retry(Path::new(meds_file), options.open_attempts)
        .with_context(|| format!("Failed to open cutout file: {}", meds_file))?;

    let config = CorrectorConfig {
        replace_bad: !options.no_replace_bad,
        min_weight: options.min_weight,
        band,
        model,
    };
    let corrector = Corrector::new(config, GaussRenderer::new(results));
    let stats = corrector
        .correct(&mut store)
        .with_context(|| format!("Correction failed for {}", meds_file))?;

    println!(
        "Corrected {} cutouts across {} objects ({} skipped)",
        stats.cutouts_corrected, stats.objects, stats.objects_skipped
    );
    println!(
        "Patched {} bad pixels, flagged {} neighbor-masked pixels, {} cutouts without a central model",
        stats.pixels_patched, stats.pixels_nbrs_masked, stats.cen_model_missing
    );
    Ok(())
}
