//! The pixel correction pass.
//!
//! For every single-epoch cutout of every object, subtract the rendered
//! flux of neighboring objects, flag zero-weight pixels, patch bad pixels
//! with the central-object model, and write the mutated planes back in
//! place. The coadd cutout at index 0 is never touched.

use tracing::{debug, info, warn};

use crate::badpix::{CEN_MODEL_MISSING, NBRS_MASKED, ZERO_WEIGHT};
use crate::cutout::Cutout;
use crate::errors::MedsResult;
use crate::meds::{CatalogEntry, EpochStore};
use crate::render::{GalaxyModel, ModelRenderer};

/// Options for a correction pass.
#[derive(Debug, Clone)]
pub struct CorrectorConfig {
    /// Replace pixels with mask bits set, or with zero weight, with the
    /// central model. When the central model is missing those pixels are
    /// flagged instead.
    pub replace_bad: bool,
    /// Weight at or below this value counts as bad
    pub min_weight: f64,
    /// Band index of the file being corrected
    pub band: usize,
    /// Model family used in the prior fit
    pub model: GalaxyModel,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        CorrectorConfig {
            replace_bad: true,
            min_weight: 0.0,
            band: 0,
            model: GalaxyModel::default(),
        }
    }
}

/// Counters reported after a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionStats {
    /// Catalog rows visited
    pub objects: usize,
    /// Objects skipped for having no epochs or an empty box
    pub objects_skipped: usize,
    /// Cutouts read, corrected and written back
    pub cutouts_corrected: usize,
    /// Bad pixels overwritten with the central model
    pub pixels_patched: usize,
    /// Cutouts whose bad pixels could not be patched
    pub cen_model_missing: usize,
    /// Pixels flagged for an unusable neighbor
    pub pixels_nbrs_masked: usize,
}

/// Runs the correction pass against any store and renderer.
pub struct Corrector<R> {
    config: CorrectorConfig,
    renderer: R,
}

impl<R: ModelRenderer> Corrector<R> {
    pub fn new(config: CorrectorConfig, renderer: R) -> Self {
        Corrector { config, renderer }
    }

    pub fn config(&self) -> &CorrectorConfig {
        &self.config
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Correct every object in the store, mutating it in place.
    ///
    /// Any renderer or store error aborts the whole pass; cutouts written
    /// before the failure stay written.
    pub fn correct<S: EpochStore>(&self, store: &mut S) -> MedsResult<CorrectionStats> {
        let nobj = store.catalog().len();
        let mut stats = CorrectionStats::default();

        for mindex in 0..nobj {
            let entry = store.entry(mindex)?.clone();
            info!("{}/{}  {}", mindex + 1, nobj, entry.id);

            if entry.ncutout > 1 && entry.box_size > 0 {
                for icut in 1..entry.ncutout as usize {
                    debug!("  cutout {}/{}", icut + 1, entry.ncutout);
                    self.correct_cutout(store, &entry, mindex, icut, &mut stats)?;
                }
            } else {
                info!(
                    "    not writing ncutout: {} box_size: {}",
                    entry.ncutout, entry.box_size
                );
                stats.objects_skipped += 1;
            }
            stats.objects += 1;
        }
        Ok(stats)
    }

    fn correct_cutout<S: EpochStore>(
        &self,
        store: &mut S,
        entry: &CatalogEntry,
        mindex: usize,
        icut: usize,
        stats: &mut CorrectionStats,
    ) -> MedsResult<()> {
        // interpolation failures fall back to the stored map
        let seg = match store.interpolate_coadd_seg(mindex, icut) {
            Ok(seg) => seg,
            Err(e) => {
                debug!("  seg interpolation failed ({}), using stored seg", e);
                store.get_seg(mindex, icut)?
            }
        };

        let rendered = self.renderer.render_nbrs(
            entry.id,
            icut,
            &seg,
            self.config.model,
            self.config.band,
            true,
        )?;

        let (cen_img, nbrs_img, nbrs_mask, pixel_scale) = match rendered {
            Some(r) => {
                if r.cen_img.is_none() {
                    info!("    bad central fit");
                }
                (r.cen_img, Some(r.nbrs_img), Some(r.nbrs_mask), r.pixel_scale)
            }
            None => {
                debug!("    no nbrs, rendering central");
                let central = self.renderer.render_central(
                    entry.id,
                    entry,
                    icut,
                    self.config.model,
                    self.config.band,
                    entry.box_size as usize,
                )?;
                match central {
                    Some(c) => (Some(c.image), None, None, c.pixel_scale),
                    None => (None, None, None, 0.0),
                }
            }
        };

        let mut img = store.get_image(mindex, icut)?;
        let mut weight = store.get_weight(mindex, icut)?;
        let mut bmask = store.get_bmask(mindex, icut)?;

        self.apply(
            &mut img,
            &mut weight,
            &mut bmask,
            cen_img.as_ref(),
            nbrs_img.as_ref(),
            nbrs_mask.as_ref(),
            pixel_scale,
            icut,
            stats,
        );

        // all three planes go back regardless of what changed
        store.put_image(mindex, icut, &img)?;
        store.put_weight(mindex, icut, &weight)?;
        store.put_bmask(mindex, icut, &bmask)?;
        stats.cutouts_corrected += 1;
        Ok(())
    }

    /// The in-memory part of the correction, on already-read planes.
    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        img: &mut Cutout<f32>,
        weight: &mut Cutout<f32>,
        bmask: &mut Cutout<u32>,
        cen_img: Option<&Cutout<f32>>,
        nbrs_img: Option<&Cutout<f32>>,
        nbrs_mask: Option<&Cutout<f32>>,
        pixel_scale: f64,
        icut: usize,
        stats: &mut CorrectionStats,
    ) {
        let min_weight = self.config.min_weight as f32;
        let area = (pixel_scale * pixel_scale) as f32;
        let npix = img.npix();

        if let Some(nbrs) = nbrs_img {
            // skip pixels at or below the weight floor: cutouts crossing a
            // chip edge carry regions the model never covered
            let img_px = img.as_mut_slice();
            let wt_px = weight.as_slice();
            for i in 0..npix {
                if wt_px[i] > min_weight {
                    img_px[i] -= nbrs.as_slice()[i] * area;
                }
            }
            if let Some(mask) = nbrs_mask {
                // a failed neighbor fit zeroes the weight under it
                let wt_px = weight.as_mut_slice();
                for i in 0..npix {
                    wt_px[i] *= mask.as_slice()[i];
                }
            }
        }

        // the cutout maker did not always set mask bits when it zeroed
        // the weight, so set them here
        for i in 0..npix {
            if weight.as_slice()[i] <= min_weight {
                ZERO_WEIGHT.set_in(&mut bmask.as_mut_slice()[i]);
            }
        }

        if self.config.replace_bad {
            let bad: Vec<usize> = (0..npix)
                .filter(|&i| bmask.as_slice()[i] != 0 || weight.as_slice()[i] <= min_weight)
                .collect();
            if !bad.is_empty() {
                match cen_img {
                    None => {
                        warn!(
                            "    could not replace bad pixels for cutout {}, no central model",
                            icut
                        );
                        for &i in &bad {
                            CEN_MODEL_MISSING.set_in(&mut bmask.as_mut_slice()[i]);
                        }
                        stats.cen_model_missing += 1;
                    }
                    Some(cen) => {
                        debug!(
                            "    setting {} bad bmask/wt pixels in cutout {} to central model",
                            bad.len(),
                            icut
                        );
                        for &i in &bad {
                            img.as_mut_slice()[i] = cen.as_slice()[i] * area;
                        }
                        stats.pixels_patched += bad.len();
                    }
                }
            }
        }

        if let Some(mask) = nbrs_mask {
            let mut flagged = 0usize;
            for i in 0..npix {
                if mask.as_slice()[i] != 1.0 {
                    NBRS_MASKED.set_in(&mut bmask.as_mut_slice()[i]);
                    flagged += 1;
                }
            }
            if flagged > 0 {
                debug!(
                    "    modifying {} bmask pixels in cutout {} for nbrs_mask",
                    flagged, icut
                );
                stats.pixels_nbrs_masked += flagged;
            }
        }
    }
}
