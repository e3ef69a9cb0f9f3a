//! Persisted fit results consumed by the corrector.
//!
//! A results file has three sections: per-object galaxy fits, neighbor
//! associations, and per-epoch rows. The whole file is read into memory
//! once, up front, and indexed by object id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};

/// Flag value meaning a fit never ran or failed outright.
pub const FIT_FAILED: u32 = 1;

/// Best-fit parameters for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalaxyFit {
    pub id: i64,
    /// Segmentation label of this object
    pub number: i32,
    /// Zero for a usable fit
    pub flags: u32,
    /// Object position in coadd pixel coordinates
    pub row: f64,
    pub col: f64,
    /// Ellipticity components
    pub g1: f64,
    pub g2: f64,
    /// Size parameter, the trace of the covariance in pixels squared
    pub t: f64,
    /// Bulge fraction for composite models
    pub fracdev: f64,
    /// Flux per band
    pub flux: Vec<f64>,
}

/// One neighbor association: `nbr_id` contaminates cutouts of `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbrAssoc {
    pub id: i64,
    pub nbr_id: i64,
}

/// Per-epoch fit information for one object cutout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochFit {
    pub id: i64,
    pub band: usize,
    pub cutout_index: usize,
    /// Linear size of a pixel on the sky, arcsec per pixel
    pub pixel_scale: f64,
    /// Object center within this cutout
    pub row: f64,
    pub col: f64,
    /// Seeing size added to the object size for this epoch, if known
    #[serde(default)]
    pub psf_t: Option<f64>,
}

/// All three sections of a fit-results file, with id indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitResults {
    pub fits: Vec<GalaxyFit>,
    pub nbrs: Vec<NbrAssoc>,
    pub epochs: Vec<EpochFit>,
    #[serde(skip)]
    by_id: HashMap<i64, usize>,
    #[serde(skip)]
    by_epoch: HashMap<(i64, usize, usize), usize>,
}

impl FitResults {
    pub fn new(fits: Vec<GalaxyFit>, nbrs: Vec<NbrAssoc>, epochs: Vec<EpochFit>) -> Self {
        let mut results = FitResults {
            fits,
            nbrs,
            epochs,
            by_id: HashMap::new(),
            by_epoch: HashMap::new(),
        };
        results.reindex();
        results
    }

    /// Read a results file wholesale.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open fit results: {}", path.display()))?;
        let mut results: FitResults = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse fit results: {}", path.display()))?;
        results.reindex();
        Ok(results)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create fit results: {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write fit results: {}", path.display()))?;
        Ok(())
    }

    fn reindex(&mut self) {
        self.by_id = self
            .fits
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id, i))
            .collect();
        self.by_epoch = self
            .epochs
            .iter()
            .enumerate()
            .map(|(i, e)| ((e.id, e.band, e.cutout_index), i))
            .collect();
    }

    pub fn get(&self, id: i64) -> Option<&GalaxyFit> {
        self.by_id.get(&id).map(|&i| &self.fits[i])
    }

    pub fn epoch(&self, id: i64, band: usize, cutout_index: usize) -> Option<&EpochFit> {
        self.by_epoch
            .get(&(id, band, cutout_index))
            .map(|&i| &self.epochs[i])
    }

    /// Ids of the neighbors associated with an object.
    pub fn nbr_ids(&self, id: i64) -> Vec<i64> {
        self.nbrs
            .iter()
            .filter(|n| n.id == id)
            .map(|n| n.nbr_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit(id: i64, flags: u32) -> GalaxyFit {
        GalaxyFit {
            id,
            number: id as i32,
            flags,
            row: 100.0,
            col: 100.0,
            g1: 0.0,
            g2: 0.0,
            t: 4.0,
            fracdev: 0.0,
            flux: vec![10.0, 20.0],
        }
    }

    #[test]
    fn test_lookups() {
        let results = FitResults::new(
            vec![fit(1, 0), fit(2, FIT_FAILED)],
            vec![NbrAssoc { id: 1, nbr_id: 2 }],
            vec![EpochFit {
                id: 1,
                band: 0,
                cutout_index: 1,
                pixel_scale: 0.26,
                row: 15.5,
                col: 15.5,
                psf_t: None,
            }],
        );
        assert_eq!(results.get(1).unwrap().flags, 0);
        assert_eq!(results.get(2).unwrap().flags, FIT_FAILED);
        assert!(results.get(3).is_none());
        assert_eq!(results.nbr_ids(1), vec![2]);
        assert!(results.nbr_ids(2).is_empty());
        assert!(results.epoch(1, 0, 1).is_some());
        assert!(results.epoch(1, 1, 1).is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut path = std::env::temp_dir();
        path.push(format!("meds-patch-{}-fitres.json", std::process::id()));

        let results = FitResults::new(
            vec![fit(7, 0)],
            vec![NbrAssoc { id: 7, nbr_id: 8 }],
            vec![EpochFit {
                id: 7,
                band: 1,
                cutout_index: 2,
                pixel_scale: 0.26,
                row: 15.5,
                col: 15.5,
                psf_t: Some(1.5),
            }],
        );
        results.save(&path).unwrap();
        let loaded = FitResults::load(&path).unwrap();
        assert_eq!(loaded.fits.len(), 1);
        // indexes are rebuilt on load
        assert_eq!(loaded.get(7).unwrap().t, 4.0);
        assert_eq!(loaded.epoch(7, 1, 2).unwrap().psf_t, Some(1.5));
        std::fs::remove_file(&path).unwrap();
    }
}
