//! File-backed cutout store.
//!
//! The container is deliberately simple: a magic tag and version, a JSON
//! header carrying the catalog, then the four pixel planes as contiguous
//! little-endian 4-byte arrays. A cutout sits at the same flat pixel offset
//! in every plane, so an in-place write touches exactly the footprint the
//! read came from.
//!
//! Layout:
//!
//! ```text
//! [0..4)   magic  b"MCUT"
//! [4..8)   version u32
//! [8..12)  header length u32
//! [12..)   JSON header (catalog, total pixel count per plane)
//! then     image f32 | weight f32 | bmask u32 | seg i32
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use crate::cutout::{Cutout, CutoutPlane};
use crate::errors::{MedsError, MedsResult};
use crate::meds::{CatalogEntry, EpochStore, MemStore};

const MAGIC: [u8; 4] = *b"MCUT";
const VERSION: u32 = 1;
const ELEM_SIZE: u64 = 4;

/// Delay between reopen attempts.
const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MedsHeader {
    catalog: Vec<CatalogEntry>,
    /// Pixels per plane
    npix: u64,
}

/// Shared plane addressing and I/O over any read-write-seek handle.
struct RawStore<F> {
    io: F,
    header: MedsHeader,
    /// File offset where the image plane starts
    origin: u64,
}

impl<F: Read + Write + Seek> RawStore<F> {
    fn open(mut io: F) -> MedsResult<Self> {
        io.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        io.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(MedsError::BadMagic(magic));
        }
        let version = io.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(MedsError::UnsupportedVersion(version));
        }
        let header_len = io.read_u32::<LittleEndian>()? as usize;
        let mut header_buf = vec![0u8; header_len];
        io.read_exact(&mut header_buf)?;
        let header: MedsHeader = serde_json::from_slice(&header_buf)
            .map_err(|e| MedsError::CorruptHeader(e.to_string()))?;
        let origin = (4 + 4 + 4 + header_len) as u64;
        Ok(RawStore { io, header, origin })
    }

    fn seek_to(&mut self, plane: CutoutPlane, mindex: usize, icut: usize) -> MedsResult<usize> {
        let entry = self
            .header
            .catalog
            .get(mindex)
            .ok_or(MedsError::ObjectOutOfRange(mindex))?;
        let range = entry.flat_range(icut)?;
        if range.end as u64 > self.header.npix {
            return Err(MedsError::CorruptHeader(format!(
                "cutout {} of object {} runs past plane end",
                icut, entry.id
            )));
        }
        let offset = self.origin
            + (plane.index() as u64 * self.header.npix + range.start as u64) * ELEM_SIZE;
        self.io.seek(SeekFrom::Start(offset))?;
        Ok(range.len())
    }

    fn box_size(&self, mindex: usize) -> usize {
        self.header.catalog[mindex].box_size as usize
    }

    fn get_f32(&mut self, plane: CutoutPlane, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>> {
        let npix = self.seek_to(plane, mindex, icut)?;
        let mut buf = vec![0f32; npix];
        self.io.read_f32_into::<LittleEndian>(&mut buf)?;
        Cutout::new(self.box_size(mindex), buf)
    }

    fn get_u32(&mut self, plane: CutoutPlane, mindex: usize, icut: usize) -> MedsResult<Cutout<u32>> {
        let npix = self.seek_to(plane, mindex, icut)?;
        let mut buf = vec![0u32; npix];
        self.io.read_u32_into::<LittleEndian>(&mut buf)?;
        Cutout::new(self.box_size(mindex), buf)
    }

    fn get_i32(&mut self, plane: CutoutPlane, mindex: usize, icut: usize) -> MedsResult<Cutout<i32>> {
        let npix = self.seek_to(plane, mindex, icut)?;
        let mut buf = vec![0i32; npix];
        self.io.read_i32_into::<LittleEndian>(&mut buf)?;
        Cutout::new(self.box_size(mindex), buf)
    }

    fn check_footprint(npix: usize, cutout_npix: usize) -> MedsResult<()> {
        if npix != cutout_npix {
            return Err(MedsError::BadCutoutShape {
                expected: npix,
                got: cutout_npix,
            });
        }
        Ok(())
    }

    fn put_f32(
        &mut self,
        plane: CutoutPlane,
        mindex: usize,
        icut: usize,
        cutout: &Cutout<f32>,
    ) -> MedsResult<()> {
        let npix = self.seek_to(plane, mindex, icut)?;
        Self::check_footprint(npix, cutout.npix())?;
        for &v in cutout.as_slice() {
            self.io.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    fn put_u32(
        &mut self,
        plane: CutoutPlane,
        mindex: usize,
        icut: usize,
        cutout: &Cutout<u32>,
    ) -> MedsResult<()> {
        let npix = self.seek_to(plane, mindex, icut)?;
        Self::check_footprint(npix, cutout.npix())?;
        for &v in cutout.as_slice() {
            self.io.write_u32::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

macro_rules! impl_epoch_store {
    ($ty:ty) => {
        impl EpochStore for $ty {
            fn catalog(&self) -> &[CatalogEntry] {
                &self.raw.header.catalog
            }

            fn get_image(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>> {
                self.raw.get_f32(CutoutPlane::Image, mindex, icut)
            }

            fn get_weight(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<f32>> {
                self.raw.get_f32(CutoutPlane::Weight, mindex, icut)
            }

            fn get_bmask(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<u32>> {
                self.raw.get_u32(CutoutPlane::Bmask, mindex, icut)
            }

            fn get_seg(&mut self, mindex: usize, icut: usize) -> MedsResult<Cutout<i32>> {
                self.raw.get_i32(CutoutPlane::Seg, mindex, icut)
            }

            fn put_image(
                &mut self,
                mindex: usize,
                icut: usize,
                cutout: &Cutout<f32>,
            ) -> MedsResult<()> {
                self.raw.put_f32(CutoutPlane::Image, mindex, icut, cutout)
            }

            fn put_weight(
                &mut self,
                mindex: usize,
                icut: usize,
                cutout: &Cutout<f32>,
            ) -> MedsResult<()> {
                self.raw.put_f32(CutoutPlane::Weight, mindex, icut, cutout)
            }

            fn put_bmask(
                &mut self,
                mindex: usize,
                icut: usize,
                cutout: &Cutout<u32>,
            ) -> MedsResult<()> {
                self.raw.put_u32(CutoutPlane::Bmask, mindex, icut, cutout)
            }
        }
    };
}

/// Owning handle to a cutout file. Closes the file when dropped.
pub struct MedsFile {
    raw: RawStore<File>,
}

impl_epoch_store!(MedsFile);

impl MedsFile {
    /// Open a container read-write.
    pub fn open(path: &Path) -> MedsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(MedsFile {
            raw: RawStore::open(file)?,
        })
    }

    /// Open a container read-only. Writes will fail at the OS level.
    pub fn open_ro(path: &Path) -> MedsResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(MedsFile {
            raw: RawStore::open(file)?,
        })
    }

    /// Open read-write, retrying while the file is still being settled by
    /// an external writer.
    ///
    /// A freshly extracted file may be absent or truncated for a short
    /// window after the writer closes it. Instead of a blind delay, open
    /// and validate the header, retrying a bounded number of times.
    pub fn open_rw_retry(path: &Path, max_attempts: u32) -> MedsResult<Self> {
        let mut last_err = MedsError::CorruptHeader("no attempts made".to_string());
        for attempt in 1..=max_attempts.max(1) {
            match Self::open(path) {
                Ok(store) => return Ok(store),
                Err(e) => {
                    tracing::debug!(
                        "open attempt {}/{} for {} failed: {}",
                        attempt,
                        max_attempts,
                        path.display(),
                        e
                    );
                    last_err = e;
                }
            }
            if attempt < max_attempts {
                std::thread::sleep(RETRY_DELAY);
            }
        }
        Err(last_err)
    }

    /// Write a new container from in-memory planes.
    pub fn create(path: &Path, store: &MemStore) -> MedsResult<()> {
        let (image, weight, bmask, seg) = store.planes();
        let header = MedsHeader {
            catalog: store.catalog().to_vec(),
            npix: image.len() as u64,
        };
        let header_buf = serde_json::to_vec(&header)
            .map_err(|e| MedsError::CorruptHeader(e.to_string()))?;

        let mut file = File::create(path)?;
        file.write_all(&MAGIC)?;
        file.write_u32::<LittleEndian>(VERSION)?;
        file.write_u32::<LittleEndian>(header_buf.len() as u32)?;
        file.write_all(&header_buf)?;
        for &v in image {
            file.write_f32::<LittleEndian>(v)?;
        }
        for &v in weight {
            file.write_f32::<LittleEndian>(v)?;
        }
        for &v in bmask {
            file.write_u32::<LittleEndian>(v)?;
        }
        for &v in seg {
            file.write_i32::<LittleEndian>(v)?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Borrowed handle over an already-open file.
///
/// The caller keeps ownership of the `File`; dropping a `MedsRef` releases
/// the borrow and nothing else. This is the handle to use when some outer
/// scope opened the file and will close it later.
pub struct MedsRef<'a> {
    raw: RawStore<&'a mut File>,
}

impl_epoch_store!(MedsRef<'_>);

impl<'a> MedsRef<'a> {
    pub fn new(file: &'a mut File) -> MedsResult<Self> {
        Ok(MedsRef {
            raw: RawStore::open(file)?,
        })
    }
}
