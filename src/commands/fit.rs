use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::bands::resolve_band;
use crate::fitres::{EpochFit, FitResults, GalaxyFit};
use crate::fitter::{FitRow, FitSchema, FitValue, FitterKind, MultiBandObsList, Observation, DEFVAL};
use crate::gauss_fitter::FIT_NO_ATTEMPT;
use crate::meds::EpochStore;
use crate::meds_file::MedsFile;

/// Fit every object in a cutout file and write a fit-results file.
///
/// The store carries no sky geometry, so epoch rows are written with a
/// unit pixel scale; a downstream consumer with real astrometry can
/// rescale them.
pub fn fit_file(
    meds_file: &str,
    output: &str,
    fitter_name: &str,
    bands: &str,
    no_epoch_data: bool,
) -> Result<()> {
    let band_names: Vec<&str> = bands.split(',').map(|s| s.trim()).collect();
    let nband = band_names.len();
    let band = resolve_band(meds_file, &band_names)?;
    let kind: FitterKind = fitter_name.parse().map_err(|e: String| anyhow!(e))?;
    let mut fitter = kind.create(nband);

    let mut store = MedsFile::open_ro(Path::new(meds_file))
        .with_context(|| format!("Failed to open cutout file: {}", meds_file))?;
    let catalog = store.catalog().to_vec();
    let schema = fitter.fit_data_schema(true, false);

    let mut fits = Vec::with_capacity(catalog.len());
    let mut epochs = Vec::new();
    let mut nfit = 0usize;

    for (mindex, entry) in catalog.iter().enumerate() {
        if entry.ncutout <= 1 || entry.box_size == 0 {
            tracing::info!(
                "skipping object {}: ncutout {} box_size {}",
                entry.id,
                entry.ncutout,
                entry.box_size
            );
            fits.push(no_attempt_fit(entry.id, entry.number, nband));
            continue;
        }

        let mut mb = MultiBandObsList::new(entry.id, nband);
        for icut in 1..entry.ncutout as usize {
            let image = store.get_image(mindex, icut)?;
            let weight = store.get_weight(mindex, icut)?;
            mb.push(Observation::new(image, weight, band, icut));
        }

        fitter
            .fit(&mut mb, false, !no_epoch_data)
            .with_context(|| format!("Fit failed hard for object {}", entry.id))?;

        let row = mb
            .meta
            .fit_data
            .first()
            .ok_or_else(|| anyhow!("fitter attached no result row for object {}", entry.id))?;
        fits.push(galaxy_fit_from_row(row, &schema, entry.id, entry.number, entry)?);
        nfit += 1;

        if !no_epoch_data {
            for obs in mb.iter_all() {
                if obs.meta.fit_flags != 0 {
                    continue;
                }
                epochs.push(EpochFit {
                    id: entry.id,
                    band: obs.band,
                    cutout_index: obs.cutout_index,
                    pixel_scale: 1.0,
                    row: entry.cutout_row.get(obs.cutout_index).copied().unwrap_or(0.0),
                    col: entry.cutout_col.get(obs.cutout_index).copied().unwrap_or(0.0),
                    psf_t: None,
                });
            }
        }
    }

    let results = FitResults::new(fits, Vec::new(), epochs);
    results.save(Path::new(output))?;
    println!(
        "Fit {} of {} objects, wrote {} epoch rows to {}",
        nfit,
        catalog.len(),
        results.epochs.len(),
        output
    );
    Ok(())
}

fn no_attempt_fit(id: i64, number: i32, nband: usize) -> GalaxyFit {
    GalaxyFit {
        id,
        number,
        flags: FIT_NO_ATTEMPT as u32,
        row: 0.0,
        col: 0.0,
        g1: 0.0,
        g2: 0.0,
        t: DEFVAL,
        fracdev: 0.0,
        flux: vec![DEFVAL; nband],
    }
}

fn galaxy_fit_from_row(
    row: &FitRow,
    schema: &FitSchema,
    id: i64,
    number: i32,
    entry: &crate::meds::CatalogEntry,
) -> Result<GalaxyFit> {
    let flags = match row.get(schema, "flags") {
        Some(FitValue::I32(f)) => *f as u32,
        other => return Err(anyhow!("bad flags column for object {}: {:?}", id, other)),
    };
    let flux = match row.get(schema, "flux") {
        Some(FitValue::F64Array(f)) => f.clone(),
        other => return Err(anyhow!("bad flux column for object {}: {:?}", id, other)),
    };
    let t = match row.get(schema, "t") {
        Some(FitValue::F64(t)) => *t,
        other => return Err(anyhow!("bad t column for object {}: {:?}", id, other)),
    };
    Ok(GalaxyFit {
        id,
        number,
        flags,
        row: entry.cutout_row.first().copied().unwrap_or(0.0),
        col: entry.cutout_col.first().copied().unwrap_or(0.0),
        g1: 0.0,
        g2: 0.0,
        t,
        fracdev: 0.0,
        flux,
    })
}
