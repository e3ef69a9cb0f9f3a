//! End-to-end tests for the correction pass.
//!
//! A scripted renderer drives the corrector through every branch against
//! an in-memory store; a final test runs the real Gaussian renderer over
//! an on-disk container.

#[cfg(test)]
mod tests {
    use crate::badpix::{CEN_MODEL_MISSING, NBRS_MASKED, ZERO_WEIGHT};
    use crate::corrector::{Corrector, CorrectorConfig};
    use crate::cutout::Cutout;
    use crate::errors::{MedsError, MedsResult};
    use crate::fitres::{EpochFit, FitResults, GalaxyFit, NbrAssoc};
    use crate::meds::{CatalogEntry, EpochStore, MemStore};
    use crate::meds_file::MedsFile;
    use crate::render::{GalaxyModel, GaussRenderer, ModelRenderer, Rendered, RenderedCentral};

    const SIZE: usize = 2;
    const SCALE: f64 = 2.0;
    const AREA: f32 = (SCALE * SCALE) as f32;

    /// Returns the same scripted render for every cutout.
    struct ScriptedRenderer {
        nbrs: Option<Rendered>,
        central: Option<RenderedCentral>,
        fail: bool,
        calls: std::cell::Cell<usize>,
    }

    impl ScriptedRenderer {
        fn new(nbrs: Option<Rendered>, central: Option<RenderedCentral>) -> Self {
            ScriptedRenderer {
                nbrs,
                central,
                fail: false,
                calls: std::cell::Cell::new(0),
            }
        }

        fn failing() -> Self {
            ScriptedRenderer {
                nbrs: None,
                central: None,
                fail: true,
                calls: std::cell::Cell::new(0),
            }
        }
    }

    impl ModelRenderer for ScriptedRenderer {
        fn render_nbrs(
            &self,
            _object_id: i64,
            _icut: usize,
            _seg: &Cutout<i32>,
            _model: GalaxyModel,
            _band: usize,
            _total: bool,
        ) -> MedsResult<Option<Rendered>> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(MedsError::Render("scripted failure".to_string()));
            }
            Ok(self.nbrs.clone())
        }

        fn render_central(
            &self,
            _object_id: i64,
            _entry: &CatalogEntry,
            _icut: usize,
            _model: GalaxyModel,
            _band: usize,
            _size: usize,
        ) -> MedsResult<Option<RenderedCentral>> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(MedsError::Render("scripted failure".to_string()));
            }
            Ok(self.central.clone())
        }
    }

    fn entry(id: i64, ncutout: u32, box_size: u32) -> CatalogEntry {
        let npix = (box_size as u64) * (box_size as u64);
        let n = ncutout.max(1) as usize;
        CatalogEntry {
            id,
            number: id as i32,
            ncutout,
            box_size,
            start_row: (0..n as u64).map(|i| i * npix).collect(),
            cutout_row: vec![(box_size as f64 - 1.0) / 2.0; n],
            cutout_col: vec![(box_size as f64 - 1.0) / 2.0; n],
        }
    }

    /// One object, one coadd plus one epoch, 2x2 cutouts.
    fn store_with(image: [f32; 4], weight: [f32; 4], bmask: [u32; 4]) -> MemStore {
        let mut store = MemStore::from_catalog(vec![entry(1, 2, SIZE as u32)]).unwrap();
        {
            let (img, wt, bm, _) = store.planes_mut();
            img[4..8].copy_from_slice(&image);
            wt[4..8].copy_from_slice(&weight);
            bm[4..8].copy_from_slice(&bmask);
        }
        store
    }

    fn rendered(
        cen: Option<[f32; 4]>,
        nbrs: [f32; 4],
        mask: [f32; 4],
    ) -> Rendered {
        Rendered {
            cen_img: cen.map(|c| Cutout::new(SIZE, c.to_vec()).unwrap()),
            nbrs_img: Cutout::new(SIZE, nbrs.to_vec()).unwrap(),
            nbrs_mask: Cutout::new(SIZE, mask.to_vec()).unwrap(),
            nbr_ids: vec![2],
            pixel_scale: SCALE,
        }
    }

    fn config(replace_bad: bool) -> CorrectorConfig {
        CorrectorConfig {
            replace_bad,
            min_weight: 0.0,
            band: 0,
            model: GalaxyModel::CModel,
        }
    }

    fn epoch_image(store: &mut MemStore) -> Vec<f32> {
        store.get_image(0, 1).unwrap().into_vec()
    }

    fn epoch_bmask(store: &mut MemStore) -> Vec<u32> {
        store.get_bmask(0, 1).unwrap().into_vec()
    }

    #[test]
    fn test_exact_neighbor_subtraction() {
        // all weights above threshold, fully valid mask: pure subtraction
        let mut store = store_with([10.0, 20.0, 30.0, 40.0], [5.0; 4], [0; 4]);
        let renderer = ScriptedRenderer::new(
            Some(rendered(Some([0.0; 4]), [1.0, 2.0, 3.0, 4.0], [1.0; 4])),
            None,
        );
        let corrector = Corrector::new(config(false), renderer);
        corrector.correct(&mut store).unwrap();

        let img = epoch_image(&mut store);
        let expected = [
            10.0 - 1.0 * AREA,
            20.0 - 2.0 * AREA,
            30.0 - 3.0 * AREA,
            40.0 - 4.0 * AREA,
        ];
        assert_eq!(img, expected);
        // nothing was bad, so no flags
        assert!(epoch_bmask(&mut store).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_worked_example() {
        // weight [5,5,0,5], min_weight 0, neighbor [1,1,1,1], scale 2:
        // pixels 0,1,3 lose 4 flux, pixel 2 untouched, ZERO_WEIGHT at 2
        let mut store = store_with([10.0; 4], [5.0, 5.0, 0.0, 5.0], [0; 4]);
        let renderer =
            ScriptedRenderer::new(Some(rendered(None, [1.0; 4], [1.0; 4])), None);
        let corrector = Corrector::new(config(false), renderer);
        corrector.correct(&mut store).unwrap();

        assert_eq!(epoch_image(&mut store), [6.0, 6.0, 10.0, 6.0]);
        let bm = epoch_bmask(&mut store);
        assert_eq!(bm[2], ZERO_WEIGHT.bits());
        assert_eq!(bm[0], 0);
        assert_eq!(bm[1], 0);
        assert_eq!(bm[3], 0);
    }

    #[test]
    fn test_zero_weight_flag_set_regardless() {
        // even with no neighbors and no central model, low weight is flagged
        let mut store = store_with([1.0; 4], [0.0, 1.0, 0.0, 1.0], [0; 4]);
        let renderer = ScriptedRenderer::new(None, None);
        let corrector = Corrector::new(config(false), renderer);
        corrector.correct(&mut store).unwrap();

        let bm = epoch_bmask(&mut store);
        assert!(BadPixCheck(bm[0]).has(ZERO_WEIGHT.bits()));
        assert_eq!(bm[1], 0);
        assert!(BadPixCheck(bm[2]).has(ZERO_WEIGHT.bits()));
        assert_eq!(bm[3], 0);
        // image untouched
        assert_eq!(epoch_image(&mut store), [1.0; 4]);
    }

    struct BadPixCheck(u32);
    impl BadPixCheck {
        fn has(&self, bits: u32) -> bool {
            self.0 & bits == bits
        }
    }

    #[test]
    fn test_patch_with_central_model() {
        // pixel 1 has a preexisting mask bit, pixel 2 has zero weight;
        // both take the scaled central value, good pixels keep theirs
        let mut store = store_with([10.0; 4], [5.0, 5.0, 0.0, 5.0], [0, 8, 0, 0]);
        let renderer = ScriptedRenderer::new(
            None,
            Some(RenderedCentral {
                image: Cutout::new(SIZE, vec![0.5, 0.6, 0.7, 0.8]).unwrap(),
                pixel_scale: SCALE,
            }),
        );
        let corrector = Corrector::new(config(true), renderer);
        let stats = corrector.correct(&mut store).unwrap();

        let img = epoch_image(&mut store);
        assert_eq!(img[0], 10.0);
        assert_eq!(img[1], 0.6 * AREA);
        assert_eq!(img[2], 0.7 * AREA);
        assert_eq!(img[3], 10.0);
        assert_eq!(stats.pixels_patched, 2);
        // the preexisting bit survives
        let bm = epoch_bmask(&mut store);
        assert!(BadPixCheck(bm[1]).has(8));
    }

    #[test]
    fn test_patch_without_central_flags_instead() {
        let mut store = store_with([10.0; 4], [5.0, 5.0, 0.0, 5.0], [0, 8, 0, 0]);
        let renderer = ScriptedRenderer::new(None, None);
        let corrector = Corrector::new(config(true), renderer);
        let stats = corrector.correct(&mut store).unwrap();

        // values unchanged
        assert_eq!(epoch_image(&mut store), [10.0; 4]);
        let bm = epoch_bmask(&mut store);
        assert!(BadPixCheck(bm[1]).has(CEN_MODEL_MISSING.bits()));
        assert!(BadPixCheck(bm[2]).has(CEN_MODEL_MISSING.bits()));
        assert!(BadPixCheck(bm[2]).has(ZERO_WEIGHT.bits()));
        assert_eq!(bm[0], 0);
        assert_eq!(bm[3], 0);
        assert_eq!(stats.cen_model_missing, 1);
        assert_eq!(stats.pixels_patched, 0);
    }

    #[test]
    fn test_no_replace_bad_leaves_values() {
        // replace_bad off: flags accumulate but no pixel value changes
        // beyond the neighbor subtraction
        let mut store = store_with([10.0; 4], [5.0, 0.0, 5.0, 5.0], [4, 0, 0, 0]);
        let renderer = ScriptedRenderer::new(
            Some(rendered(Some([9.0; 4]), [1.0; 4], [1.0; 4])),
            None,
        );
        let corrector = Corrector::new(config(false), renderer);
        let stats = corrector.correct(&mut store).unwrap();

        let img = epoch_image(&mut store);
        // subtraction applies where weight > 0, including masked pixel 0
        assert_eq!(img, [6.0, 10.0, 6.0, 6.0]);
        assert_eq!(stats.pixels_patched, 0);
        let bm = epoch_bmask(&mut store);
        assert!(BadPixCheck(bm[1]).has(ZERO_WEIGHT.bits()));
        assert!(!BadPixCheck(bm[0]).has(CEN_MODEL_MISSING.bits()));
    }

    #[test]
    fn test_nbrs_mask_flags_and_weight_zeroing() {
        // mask 0 at pixel 3: weight zeroed there, NBRS_MASKED set there only
        let mut store = store_with([10.0; 4], [5.0; 4], [0; 4]);
        let renderer = ScriptedRenderer::new(
            Some(rendered(Some([0.5; 4]), [1.0; 4], [1.0, 1.0, 1.0, 0.0])),
            None,
        );
        let corrector = Corrector::new(config(true), renderer);
        let stats = corrector.correct(&mut store).unwrap();

        let bm = epoch_bmask(&mut store);
        assert!(BadPixCheck(bm[3]).has(NBRS_MASKED.bits()));
        assert!(BadPixCheck(bm[3]).has(ZERO_WEIGHT.bits()));
        assert!(!BadPixCheck(bm[0]).has(NBRS_MASKED.bits()));
        assert!(!BadPixCheck(bm[1]).has(NBRS_MASKED.bits()));
        assert!(!BadPixCheck(bm[2]).has(NBRS_MASKED.bits()));
        assert_eq!(stats.pixels_nbrs_masked, 1);

        let wt = store.get_weight(0, 1).unwrap().into_vec();
        assert_eq!(wt, [5.0, 5.0, 5.0, 0.0]);
        // pixel 3 went bad after the mask multiply, so it was patched
        let img = epoch_image(&mut store);
        assert_eq!(img[3], 0.5 * AREA);
    }

    #[test]
    fn test_trivial_entries_never_touched() {
        // one single-cutout object and one empty-box object: no reads,
        // no renders, no writes
        let mut store = MemStore::from_catalog(vec![
            entry(1, 1, SIZE as u32),
            entry(2, 3, 0),
        ])
        .unwrap();
        {
            let (img, _, _, _) = store.planes_mut();
            for (i, v) in img.iter_mut().enumerate() {
                *v = i as f32;
            }
        }
        let before = store.clone();
        let renderer = ScriptedRenderer::new(None, None);
        let corrector = Corrector::new(config(true), renderer);
        let stats = corrector.correct(&mut store).unwrap();

        assert_eq!(stats.objects, 2);
        assert_eq!(stats.objects_skipped, 2);
        assert_eq!(stats.cutouts_corrected, 0);
        assert_eq!(corrector_calls(&corrector), 0);
        assert_eq!(store.planes().0, before.planes().0);
        assert_eq!(store.planes().1, before.planes().1);
        assert_eq!(store.planes().2, before.planes().2);
    }

    fn corrector_calls(corrector: &Corrector<ScriptedRenderer>) -> usize {
        // the scripted renderer records every render request
        corrector_renderer(corrector).calls.get()
    }

    fn corrector_renderer<'a>(
        corrector: &'a Corrector<ScriptedRenderer>,
    ) -> &'a ScriptedRenderer {
        corrector.renderer()
    }

    #[test]
    fn test_render_error_aborts_pass() {
        let mut store = store_with([10.0; 4], [5.0; 4], [0; 4]);
        let corrector = Corrector::new(config(true), ScriptedRenderer::failing());
        assert!(corrector.correct(&mut store).is_err());
    }

    #[test]
    fn test_all_planes_written_back() {
        // a no-op render still rewrites image, weight and bmask
        let mut store = store_with([10.0; 4], [5.0; 4], [0; 4]);
        let renderer = ScriptedRenderer::new(None, None);
        let corrector = Corrector::new(config(false), renderer);
        let stats = corrector.correct(&mut store).unwrap();
        assert_eq!(stats.cutouts_corrected, 1);
        assert_eq!(epoch_image(&mut store), [10.0; 4]);
    }

    /// Full pipeline: on-disk container plus the Gaussian renderer.
    #[test]
    fn test_disk_pipeline_with_gauss_renderer() {
        let size = 16usize;
        let npix = (size * size) as u64;
        let cat = vec![CatalogEntry {
            id: 1,
            number: 1,
            ncutout: 2,
            box_size: size as u32,
            start_row: vec![0, npix],
            cutout_row: vec![7.5; 2],
            cutout_col: vec![7.5; 2],
        }];
        let mut mem = MemStore::from_catalog(cat).unwrap();
        {
            let (img, wt, _, _) = mem.planes_mut();
            for v in img.iter_mut() {
                *v = 100.0;
            }
            for v in wt.iter_mut() {
                *v = 10.0;
            }
        }

        let mut path = std::env::temp_dir();
        path.push(format!("meds-patch-{}-pipeline.bin", std::process::id()));
        MedsFile::create(&path, &mem).unwrap();

        // a bright neighbor two pixels off center, well fit
        let scale = 0.5;
        let results = FitResults::new(
            vec![
                GalaxyFit {
                    id: 1,
                    number: 1,
                    flags: 0,
                    row: 100.0,
                    col: 100.0,
                    g1: 0.0,
                    g2: 0.0,
                    t: 2.0,
                    fracdev: 0.0,
                    flux: vec![50.0],
                },
                GalaxyFit {
                    id: 2,
                    number: 2,
                    flags: 0,
                    row: 102.0,
                    col: 100.0,
                    g1: 0.0,
                    g2: 0.0,
                    t: 2.0,
                    fracdev: 0.0,
                    flux: vec![200.0],
                },
            ],
            vec![NbrAssoc { id: 1, nbr_id: 2 }],
            vec![EpochFit {
                id: 1,
                band: 0,
                cutout_index: 1,
                pixel_scale: scale,
                row: 7.5,
                col: 7.5,
                psf_t: None,
            }],
        );

        let corrector = Corrector::new(
            CorrectorConfig {
                replace_bad: true,
                min_weight: 0.0,
                band: 0,
                model: GalaxyModel::Gauss,
            },
            GaussRenderer::new(results),
        );

        {
            let mut store = MedsFile::open(&path).unwrap();
            let stats = corrector.correct(&mut store).unwrap();
            assert_eq!(stats.cutouts_corrected, 1);
        }

        let mut reopened = MedsFile::open(&path).unwrap();
        let img = reopened.get_image(0, 1).unwrap();
        // neighbor flux came out: total dropped by about the neighbor's
        // flux that lands in the stamp
        let total_before = 100.0 * (size * size) as f64;
        let total_after = img.total();
        let removed = total_before - total_after;
        assert!(
            (removed - 200.0).abs() / 200.0 < 0.05,
            "removed {}",
            removed
        );
        // coadd cutout untouched
        let coadd = reopened.get_image(0, 0).unwrap();
        assert!(coadd.iter().all(|&v| v == 100.0));
        // no pixel was bad, so no flags anywhere
        let bm = reopened.get_bmask(0, 1).unwrap();
        assert!(bm.iter().all(|&b| b == 0));

        std::fs::remove_file(&path).unwrap();
    }
}
