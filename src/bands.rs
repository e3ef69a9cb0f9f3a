//! Band resolution from file naming conventions.
//!
//! Survey cutout files carry the band as a hyphen-delimited token in the
//! filename (for example `DES0347-5540-r-meds.bin`). The resolver returns
//! the index of the band in the configured band list.

use crate::errors::{MedsError, MedsResult};

/// Bands used when none are configured.
pub const DEFAULT_BAND_NAMES: [&str; 4] = ["g", "r", "i", "z"];

/// Find the band index for a file path.
///
/// Band names are tried in list order and matched as `-<band>-`, so a path
/// mentioning several band tokens resolves to the earliest one in the list.
pub fn resolve_band(path: &str, band_names: &[&str]) -> MedsResult<usize> {
    for (index, name) in band_names.iter().enumerate() {
        let token = format!("-{}-", name);
        if path.contains(&token) {
            return Ok(index);
        }
    }
    Err(MedsError::BandNotFound(path.to_string()))
}
