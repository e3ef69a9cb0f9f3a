//! Model rendering contract and a Gaussian-profile implementation.
//!
//! The corrector only depends on the [`ModelRenderer`] trait. The
//! [`GaussRenderer`] here draws elliptical Gaussian profiles from persisted
//! fit parameters; it is a stand-in for a full multi-object-fitting
//! renderer and can be swapped out without touching the correction pass.

use std::fmt;
use std::str::FromStr;

use crate::cutout::Cutout;
use crate::errors::{MedsError, MedsResult};
use crate::fitres::{EpochFit, FitResults, GalaxyFit};
use crate::meds::CatalogEntry;

/// Galaxy model family used for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GalaxyModel {
    /// Composite bulge plus disk model
    #[default]
    CModel,
    /// Single Gaussian
    Gauss,
}

impl FromStr for GalaxyModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cm" | "cmodel" => Ok(GalaxyModel::CModel),
            "gauss" | "gaussian" => Ok(GalaxyModel::Gauss),
            _ => Err(format!("Unknown galaxy model: {}", s)),
        }
    }
}

impl fmt::Display for GalaxyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GalaxyModel::CModel => write!(f, "cm"),
            GalaxyModel::Gauss => write!(f, "gauss"),
        }
    }
}

/// Result of rendering an object together with its neighbors.
#[derive(Debug, Clone)]
pub struct Rendered {
    /// Central-object flux image; absent when the central fit failed.
    /// Missing central is a recoverable condition, not an error.
    pub cen_img: Option<Cutout<f32>>,
    /// Combined flux of all usable neighbors
    pub nbrs_img: Cutout<f32>,
    /// Per-pixel validity: 0 where an unusable neighbor covers the pixel
    pub nbrs_mask: Cutout<f32>,
    /// Neighbors that contributed to this render
    pub nbr_ids: Vec<i64>,
    /// Arcsec per pixel for this epoch
    pub pixel_scale: f64,
}

/// Result of a central-only render.
#[derive(Debug, Clone)]
pub struct RenderedCentral {
    pub image: Cutout<f32>,
    pub pixel_scale: f64,
}

/// Rendering contract consumed by the correction pass.
///
/// `Ok(None)` means no renderable result exists, which is a normal
/// outcome. Errors are reserved for conditions the caller cannot proceed
/// past.
pub trait ModelRenderer {
    /// Render the neighbors of an object into its cutout frame.
    ///
    /// `total` requests a single combined neighbor image. Returns
    /// `Ok(None)` when the object has no neighbors.
    fn render_nbrs(
        &self,
        object_id: i64,
        icut: usize,
        seg: &Cutout<i32>,
        model: GalaxyModel,
        band: usize,
        total: bool,
    ) -> MedsResult<Option<Rendered>>;

    /// Render only the central object into a cutout of side `size`.
    fn render_central(
        &self,
        object_id: i64,
        entry: &CatalogEntry,
        icut: usize,
        model: GalaxyModel,
        band: usize,
        size: usize,
    ) -> MedsResult<Option<RenderedCentral>>;
}

/// Renders elliptical Gaussian profiles from persisted fit results.
pub struct GaussRenderer {
    results: FitResults,
}

/// Bulge size relative to the disk in the composite model.
const BULGE_T_RATIO: f64 = 0.5;

impl GaussRenderer {
    pub fn new(results: FitResults) -> Self {
        GaussRenderer { results }
    }

    pub fn results(&self) -> &FitResults {
        &self.results
    }

    /// Add one object's profile into `img`, centered at `(row, col)`.
    ///
    /// The image is in surface-brightness units; multiplying by the squared
    /// pixel scale recovers flux per pixel.
    fn add_model(
        img: &mut Cutout<f32>,
        fit: &GalaxyFit,
        model: GalaxyModel,
        band: usize,
        center: (f64, f64),
        epoch: &EpochFit,
    ) -> bool {
        let Some(&flux) = fit.flux.get(band) else {
            return false;
        };
        if fit.t <= 0.0 || flux <= 0.0 {
            return false;
        }
        let area = epoch.pixel_scale * epoch.pixel_scale;
        let components: &[(f64, f64)] = match model {
            GalaxyModel::Gauss => &[(1.0, 1.0)],
            GalaxyModel::CModel => &[(0.0, 1.0), (1.0, BULGE_T_RATIO)],
        };
        for &(bulge_weight, t_ratio) in components {
            let weight = match model {
                GalaxyModel::Gauss => 1.0,
                GalaxyModel::CModel => {
                    if bulge_weight > 0.0 {
                        fit.fracdev
                    } else {
                        1.0 - fit.fracdev
                    }
                }
            };
            if weight <= 0.0 {
                continue;
            }
            let t = fit.t * t_ratio + epoch.psf_t.unwrap_or(0.0);
            add_gaussian(
                img,
                weight * flux / area,
                center,
                fit.g1,
                fit.g2,
                t,
            );
        }
        true
    }

    fn epoch(&self, id: i64, band: usize, icut: usize) -> Option<&EpochFit> {
        self.results.epoch(id, band, icut)
    }
}

/// Accumulate a normalized elliptical Gaussian times `flux` into `img`.
fn add_gaussian(img: &mut Cutout<f32>, flux: f64, center: (f64, f64), g1: f64, g2: f64, t: f64) {
    let irr = 0.5 * t * (1.0 - g1);
    let icc = 0.5 * t * (1.0 + g1);
    let irc = 0.5 * t * g2;
    let det = irr * icc - irc * irc;
    if det <= 0.0 {
        return;
    }
    let norm = flux / (2.0 * std::f64::consts::PI * det.sqrt());
    let size = img.size();
    for row in 0..size {
        for col in 0..size {
            let dr = row as f64 - center.0;
            let dc = col as f64 - center.1;
            let quad = (icc * dr * dr - 2.0 * irc * dr * dc + irr * dc * dc) / det;
            let value = norm * (-0.5 * quad).exp();
            let current = img.get(row, col);
            img.set(row, col, current + value as f32);
        }
    }
}

impl ModelRenderer for GaussRenderer {
    fn render_nbrs(
        &self,
        object_id: i64,
        icut: usize,
        seg: &Cutout<i32>,
        model: GalaxyModel,
        band: usize,
        total: bool,
    ) -> MedsResult<Option<Rendered>> {
        if !total {
            return Err(MedsError::Render(
                "per-neighbor images are not supported, request a total render".to_string(),
            ));
        }
        let Some(obj) = self.results.get(object_id) else {
            return Ok(None);
        };
        let nbr_ids = self.results.nbr_ids(object_id);
        if nbr_ids.is_empty() {
            return Ok(None);
        }
        let Some(epoch) = self.epoch(object_id, band, icut) else {
            return Ok(None);
        };

        let size = seg.size();
        let mut nbrs_img = Cutout::filled(size, 0.0f32);
        let mut nbrs_mask = Cutout::filled(size, 1.0f32);
        let mut rendered_ids = Vec::new();

        for nbr_id in nbr_ids {
            let Some(nbr) = self.results.get(nbr_id) else {
                continue;
            };
            if nbr.flags == 0 {
                let center = (
                    epoch.row + (nbr.row - obj.row),
                    epoch.col + (nbr.col - obj.col),
                );
                if Self::add_model(&mut nbrs_img, nbr, model, band, center, epoch) {
                    rendered_ids.push(nbr_id);
                }
            } else {
                // unusable fit: flag this neighbor's own pixels instead
                for row in 0..size {
                    for col in 0..size {
                        if seg.get(row, col) == nbr.number {
                            nbrs_mask.set(row, col, 0.0);
                        }
                    }
                }
                rendered_ids.push(nbr_id);
            }
        }

        let cen_img = if obj.flags == 0 {
            let mut img = Cutout::filled(size, 0.0f32);
            if Self::add_model(&mut img, obj, model, band, (epoch.row, epoch.col), epoch) {
                Some(img)
            } else {
                None
            }
        } else {
            None
        };

        Ok(Some(Rendered {
            cen_img,
            nbrs_img,
            nbrs_mask,
            nbr_ids: rendered_ids,
            pixel_scale: epoch.pixel_scale,
        }))
    }

    fn render_central(
        &self,
        object_id: i64,
        entry: &CatalogEntry,
        icut: usize,
        model: GalaxyModel,
        band: usize,
        size: usize,
    ) -> MedsResult<Option<RenderedCentral>> {
        let Some(obj) = self.results.get(object_id) else {
            return Ok(None);
        };
        if obj.flags != 0 {
            return Ok(None);
        }
        let Some(epoch) = self.epoch(object_id, band, icut) else {
            return Ok(None);
        };
        if entry.cutout_row.len() <= icut || entry.cutout_col.len() <= icut {
            return Ok(None);
        }
        let center = (entry.cutout_row[icut], entry.cutout_col[icut]);
        let mut img = Cutout::filled(size, 0.0f32);
        if !Self::add_model(&mut img, obj, model, band, center, epoch) {
            return Ok(None);
        }
        Ok(Some(RenderedCentral {
            image: img,
            pixel_scale: epoch.pixel_scale,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitres::{EpochFit, FitResults, GalaxyFit, NbrAssoc, FIT_FAILED};

    const SIZE: usize = 32;
    const SCALE: f64 = 0.26;

    fn fit(id: i64, flags: u32, row: f64, col: f64) -> GalaxyFit {
        GalaxyFit {
            id,
            number: id as i32,
            flags,
            row,
            col,
            g1: 0.0,
            g2: 0.0,
            t: 4.0,
            fracdev: 0.3,
            flux: vec![100.0],
        }
    }

    fn epoch(id: i64) -> EpochFit {
        EpochFit {
            id,
            band: 0,
            cutout_index: 1,
            pixel_scale: SCALE,
            row: SIZE as f64 / 2.0,
            col: SIZE as f64 / 2.0,
            psf_t: None,
        }
    }

    fn entry(id: i64) -> CatalogEntry {
        CatalogEntry {
            id,
            number: id as i32,
            ncutout: 2,
            box_size: SIZE as u32,
            start_row: vec![0, (SIZE * SIZE) as u64],
            cutout_row: vec![SIZE as f64 / 2.0; 2],
            cutout_col: vec![SIZE as f64 / 2.0; 2],
        }
    }

    #[test]
    fn test_model_from_str() {
        assert_eq!("cm".parse::<GalaxyModel>().unwrap(), GalaxyModel::CModel);
        assert_eq!("CMODEL".parse::<GalaxyModel>().unwrap(), GalaxyModel::CModel);
        assert_eq!("gauss".parse::<GalaxyModel>().unwrap(), GalaxyModel::Gauss);
        assert!("exp".parse::<GalaxyModel>().is_err());
    }

    #[test]
    fn test_no_nbrs_returns_none() {
        let renderer = GaussRenderer::new(FitResults::new(
            vec![fit(1, 0, 100.0, 100.0)],
            vec![],
            vec![epoch(1)],
        ));
        let seg = Cutout::filled(SIZE, 0i32);
        let res = renderer
            .render_nbrs(1, 1, &seg, GalaxyModel::CModel, 0, true)
            .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_nbr_render_scaled_flux() {
        // neighbor centered on the stamp so nearly all its flux lands in it
        let renderer = GaussRenderer::new(FitResults::new(
            vec![fit(1, 0, 100.0, 100.0), fit(2, 0, 100.0, 100.0)],
            vec![NbrAssoc { id: 1, nbr_id: 2 }],
            vec![epoch(1)],
        ));
        let seg = Cutout::filled(SIZE, 0i32);
        let res = renderer
            .render_nbrs(1, 1, &seg, GalaxyModel::Gauss, 0, true)
            .unwrap()
            .unwrap();
        assert_eq!(res.nbr_ids, vec![2]);
        assert!((res.pixel_scale - SCALE).abs() < 1e-12);
        // image times pixel area integrates back to the catalog flux
        let total = res.nbrs_img.total() * SCALE * SCALE;
        assert!((total - 100.0).abs() / 100.0 < 0.01, "total {}", total);
        // mask untouched for a usable neighbor
        assert!(res.nbrs_mask.iter().all(|&v| v == 1.0));
        assert!(res.cen_img.is_some());
    }

    #[test]
    fn test_failed_nbr_masks_its_seg_pixels() {
        let renderer = GaussRenderer::new(FitResults::new(
            vec![fit(1, 0, 100.0, 100.0), fit(2, FIT_FAILED, 101.0, 100.0)],
            vec![NbrAssoc { id: 1, nbr_id: 2 }],
            vec![epoch(1)],
        ));
        let mut seg = Cutout::filled(SIZE, 0i32);
        seg.set(3, 4, 2);
        seg.set(3, 5, 2);
        let res = renderer
            .render_nbrs(1, 1, &seg, GalaxyModel::CModel, 0, true)
            .unwrap()
            .unwrap();
        // no flux from the failed neighbor
        assert!(res.nbrs_img.iter().all(|&v| v == 0.0));
        assert_eq!(res.nbrs_mask.get(3, 4), 0.0);
        assert_eq!(res.nbrs_mask.get(3, 5), 0.0);
        assert_eq!(res.nbrs_mask.get(0, 0), 1.0);
    }

    #[test]
    fn test_failed_central_is_recoverable_none() {
        let renderer = GaussRenderer::new(FitResults::new(
            vec![fit(1, FIT_FAILED, 100.0, 100.0), fit(2, 0, 100.0, 100.0)],
            vec![NbrAssoc { id: 1, nbr_id: 2 }],
            vec![epoch(1)],
        ));
        let seg = Cutout::filled(SIZE, 0i32);
        let res = renderer
            .render_nbrs(1, 1, &seg, GalaxyModel::CModel, 0, true)
            .unwrap()
            .unwrap();
        assert!(res.cen_img.is_none());

        let central = renderer
            .render_central(1, &entry(1), 1, GalaxyModel::CModel, 0, SIZE)
            .unwrap();
        assert!(central.is_none());
    }

    #[test]
    fn test_render_central() {
        let renderer = GaussRenderer::new(FitResults::new(
            vec![fit(1, 0, 100.0, 100.0)],
            vec![],
            vec![epoch(1)],
        ));
        let central = renderer
            .render_central(1, &entry(1), 1, GalaxyModel::CModel, 0, SIZE)
            .unwrap()
            .unwrap();
        let total = central.image.total() * SCALE * SCALE;
        assert!((total - 100.0).abs() / 100.0 < 0.02, "total {}", total);
        // peak at the stamp center
        let peak = central.image.get(SIZE / 2, SIZE / 2);
        assert!(central.image.iter().all(|&v| v <= peak));
    }

    #[test]
    fn test_total_required() {
        let renderer = GaussRenderer::new(FitResults::new(vec![], vec![], vec![]));
        let seg = Cutout::filled(4, 0i32);
        assert!(renderer
            .render_nbrs(1, 1, &seg, GalaxyModel::CModel, 0, false)
            .is_err());
    }

    #[test]
    fn test_missing_epoch_returns_none() {
        let renderer = GaussRenderer::new(FitResults::new(
            vec![fit(1, 0, 100.0, 100.0), fit(2, 0, 100.0, 100.0)],
            vec![NbrAssoc { id: 1, nbr_id: 2 }],
            vec![], // no epoch data at all
        ));
        let seg = Cutout::filled(SIZE, 0i32);
        assert!(renderer
            .render_nbrs(1, 1, &seg, GalaxyModel::CModel, 0, true)
            .unwrap()
            .is_none());
        assert!(renderer
            .render_central(1, &entry(1), 1, GalaxyModel::CModel, 0, SIZE)
            .unwrap()
            .is_none());
    }
}
