//! Multi-epoch cutout store contract.
//!
//! A store holds a catalog of objects plus four flat pixel planes. Every
//! cutout of an object lives at the same flat pixel offset in all four
//! planes, so reads and writes address identical footprints. The coadd
//! cutout is always index 0; indices 1 and up are single epochs.

use serde::{Deserialize, Serialize};

use crate::cutout::Cutout;
use crate::errors::{MedsError, MedsResult};

/// One catalog row. Immutable once the store is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Unique object identifier
    pub id: i64,
    /// Label used for this object in segmentation maps
    pub number: i32,
    /// Number of cutouts, including the coadd at index 0
    pub ncutout: u32,
    /// Side length of every cutout for this object
    pub box_size: u32,
    /// Flat pixel offset of each cutout within a plane
    pub start_row: Vec<u64>,
    /// Object center row within each cutout
    pub cutout_row: Vec<f64>,
    /// Object center column within each cutout
    pub cutout_col: Vec<f64>,
}

impl CatalogEntry {
    /// Flat pixel range of one cutout, validated against the entry.
    pub fn flat_range(&self, icut: usize) -> MedsResult<std::ops::Range<usize>> {
        if icut >= self.ncutout as usize || icut >= self.start_row.len() {
            return Err(MedsError::CutoutOutOfRange {
                object_id: self.id,
                icut,
                ncutout: self.ncutout,
            });
        }
        let npix = (self.box_size as usize) * (self.box_size as usize);
        let start = self.start_row[icut] as usize;
        Ok(start..start + npix)
    }
}

/// Read/write access to a multi-epoch cutout store.
///
/// Reads return freshly owned cutouts; writes overwrite exactly the
/// footprint the corresponding read came from. The segmentation plane is
/// read-only.
pub trait EpochStore {
    fn catalog(&self) -> &[CatalogEntry];

    fn get_image(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>>;
    fn get_weight(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>>;
    fn get_bmask(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<u32>>;
    fn get_seg(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<i32>>;

    fn put_image(&mut self, mindex: usize, icut: usize, cutout: &Cutout<f32>) -> MedsResult<()>;
    fn put_weight(&mut self, mindex: usize, icut: usize, cutout: &Cutout<f32>) -> MedsResult<()>;
    fn put_bmask(&mut self, mindex: usize, icut: usize, cutout: &Cutout<u32>) -> MedsResult<()>;

    /// Catalog row for an object index.
    fn entry(&self, mindex: usize) -> MedsResult<&CatalogEntry> {
        self.catalog()
            .get(mindex)
            .ok_or(MedsError::ObjectOutOfRange(mindex))
    }

    /// Segmentation map for an epoch cutout, resampled from the coadd.
    ///
    /// The coadd segmentation (cutout 0) is shifted so the object centers
    /// line up and resampled with nearest-neighbor lookup. Pixels that fall
    /// outside the coadd stamp get label 0.
    fn interpolate_coadd_seg(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<i32>> {
        let entry = self.entry(mindex)?.clone();
        if entry.cutout_row.len() <= icut || entry.cutout_col.len() <= icut {
            return Err(MedsError::SegInterp(format!(
                "object {} has no center for cutout {}",
                entry.id, icut
            )));
        }
        let coadd_seg = self.get_seg(mindex, 0)?;
        let size = coadd_seg.size();

        let drow = entry.cutout_row[0] - entry.cutout_row[icut];
        let dcol = entry.cutout_col[0] - entry.cutout_col[icut];

        let mut seg = Cutout::filled(size, 0i32);
        for row in 0..size {
            for col in 0..size {
                let crow = (row as f64 + drow).round();
                let ccol = (col as f64 + dcol).round();
                if crow >= 0.0 && crow < size as f64 && ccol >= 0.0 && ccol < size as f64 {
                    seg.set(row, col, coadd_seg.get(crow as usize, ccol as usize));
                }
            }
        }
        Ok(seg)
    }
}

/// An in-memory store, mirroring the on-disk plane layout.
///
/// Used by the tests and by embedders that assemble cutouts themselves.
#[derive(Debug, Clone)]
pub struct MemStore {
    catalog: Vec<CatalogEntry>,
    image: Vec<f32>,
    weight: Vec<f32>,
    bmask: Vec<u32>,
    seg: Vec<i32>,
}

impl MemStore {
    /// Allocate zeroed planes sized to hold every cutout in the catalog.
    pub fn from_catalog(catalog: Vec<CatalogEntry>) -> MedsResult<Self> {
        let mut npix_total = 0usize;
        for entry in &catalog {
            for icut in 0..entry.ncutout as usize {
                let range = entry.flat_range(icut)?;
                npix_total = npix_total.max(range.end);
            }
        }
        Ok(MemStore {
            catalog,
            image: vec![0.0; npix_total],
            weight: vec![0.0; npix_total],
            bmask: vec![0; npix_total],
            seg: vec![0; npix_total],
        })
    }

    pub fn npix_total(&self) -> usize {
        self.image.len()
    }

    pub fn planes(&self) -> (&[f32], &[f32], &[u32], &[i32]) {
        (&self.image, &self.weight, &self.bmask, &self.seg)
    }

    /// Raw mutable planes, for assembling test fixtures.
    pub fn planes_mut(&mut self) -> (&mut [f32], &mut [f32], &mut [u32], &mut [i32]) {
        (
            &mut self.image,
            &mut self.weight,
            &mut self.bmask,
            &mut self.seg,
        )
    }

    pub fn into_parts(self) -> (Vec<CatalogEntry>, Vec<f32>, Vec<f32>, Vec<u32>, Vec<i32>) {
        (self.catalog, self.image, self.weight, self.bmask, self.seg)
    }

    /// Build a store from preexisting planes, validating their lengths.
    pub fn from_planes(
        catalog: Vec<CatalogEntry>,
        image: Vec<f32>,
        weight: Vec<f32>,
        bmask: Vec<u32>,
        seg: Vec<i32>,
    ) -> MedsResult<Self> {
        let store = MemStore::from_catalog(catalog)?;
        let npix = store.npix_total();
        for (name, len) in [
            ("image", image.len()),
            ("weight", weight.len()),
            ("bmask", bmask.len()),
            ("seg", seg.len()),
        ] {
            if len < npix {
                return Err(MedsError::CorruptHeader(format!(
                    "{} plane has {} pixels, catalog needs {}",
                    name, len, npix
                )));
            }
        }
        Ok(MemStore {
            catalog: store.catalog,
            image,
            weight,
            bmask,
            seg,
        })
    }

    fn range(&self, mindex: usize, icut: usize) -> MedsResult<std::ops::Range<usize>> {
        self.catalog
            .get(mindex)
            .ok_or(MedsError::ObjectOutOfRange(mindex))?
            .flat_range(icut)
    }

    fn read_plane<T: Copy>(
        &self,
        plane: &[T],
        mindex: usize,
        icut: usize,
    ) -> MedsResult<Cutout<T>> {
        let range = self.range(mindex, icut)?;
        let size = self.catalog[mindex].box_size as usize;
        Cutout::new(size, plane[range].to_vec())
    }

    fn write_plane<T: Copy>(
        range: std::ops::Range<usize>,
        plane: &mut [T],
        cutout: &Cutout<T>,
    ) -> MedsResult<()> {
        if cutout.npix() != range.len() {
            return Err(MedsError::BadCutoutShape {
                expected: range.len(),
                got: cutout.npix(),
            });
        }
        plane[range].copy_from_slice(cutout.as_slice());
        Ok(())
    }
}

impl EpochStore for MemStore {
    fn catalog(&self) -> &[CatalogEntry] {
        &self.catalog
    }

    fn get_image(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>> {
        self.read_plane(&self.image, mindex, icut)
    }

    fn get_weight(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>> {
        self.read_plane(&self.weight, mindex, icut)
    }

    fn get_bmask(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<u32>> {
        self.read_plane(&self.bmask, mindex, icut)
    }

    fn get_seg(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<i32>> {
        self.read_plane(&self.seg, mindex, icut)
    }

    fn put_image(&mut self, mindex: usize, icut: usize, cutout: &Cutout<f32>) -> MedsResult<()> {
        let range = self.range(mindex, icut)?;
        Self::write_plane(range, &mut self.image, cutout)
    }

    fn put_weight(&mut self, mindex: usize, icut: usize, cutout: &Cutout<f32>) -> MedsResult<()> {
        let range = self.range(mindex, icut)?;
        Self::write_plane(range, &mut self.weight, cutout)
    }

    fn put_bmask(&mut self, mindex: usize, icut: usize, cutout: &Cutout<u32>) -> MedsResult<()> {
        let range = self.range(mindex, icut)?;
        Self::write_plane(range, &mut self.bmask, cutout)
    }
}
