//! Error types for store access, rendering and correction.

use std::fmt;
use std::io;

/// Errors raised by the store, renderer and corrector layers.
#[derive(Debug)]
pub enum MedsError {
    /// I/O error
    Io(io::Error),
    /// File does not start with the expected magic
    BadMagic([u8; 4]),
    /// Container version is not supported
    UnsupportedVersion(u32),
    /// Container header could not be decoded
    CorruptHeader(String),
    /// No band token matched the given path
    BandNotFound(String),
    /// Cutout index out of range for an object
    CutoutOutOfRange { object_id: i64, icut: usize, ncutout: u32 },
    /// Catalog row index out of range
    ObjectOutOfRange(usize),
    /// Cutout data does not form a square of the expected size
    BadCutoutShape { expected: usize, got: usize },
    /// Segmentation interpolation could not be performed
    SegInterp(String),
    /// Renderer failed in a non-recoverable way
    Render(String),
}

impl fmt::Display for MedsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MedsError::Io(e) => write!(f, "I/O error: {}", e),
            MedsError::BadMagic(m) => write!(f, "Bad container magic: {:?}", m),
            MedsError::UnsupportedVersion(v) => write!(f, "Unsupported container version: {}", v),
            MedsError::CorruptHeader(msg) => write!(f, "Corrupt container header: {}", msg),
            MedsError::BandNotFound(path) => {
                write!(f, "Could not find band for file '{}'", path)
            }
            MedsError::CutoutOutOfRange { object_id, icut, ncutout } => write!(
                f,
                "Cutout {} out of range for object {} (ncutout {})",
                icut, object_id, ncutout
            ),
            MedsError::ObjectOutOfRange(i) => write!(f, "Object row {} out of range", i),
            MedsError::BadCutoutShape { expected, got } => write!(
                f,
                "Cutout data length {} does not match box size {} squared",
                got, expected
            ),
            MedsError::SegInterp(msg) => write!(f, "Segmentation interpolation failed: {}", msg),
            MedsError::Render(msg) => write!(f, "Render failed: {}", msg),
        }
    }
}

impl std::error::Error for MedsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MedsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MedsError {
    fn from(error: io::Error) -> Self {
        MedsError::Io(error)
    }
}

/// Result type for store and correction operations.
pub type MedsResult<T> = Result<T, MedsError>;
