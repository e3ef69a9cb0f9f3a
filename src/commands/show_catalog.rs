use anyhow::{Context, Result};
use std::path::Path;

use crate::meds::EpochStore;
use crate::meds_file::MedsFile;

/// Print the catalog of a cutout file as a table.
pub fn show_catalog(meds_file: &str) -> Result<()> {
    let store = MedsFile::open_ro(Path::new(meds_file))
        .with_context(|| format!("Failed to open cutout file: {}", meds_file))?;

    println!(
        "{:<14} {:<10} {:<10} {:<10} {:<12}",
        "ID", "Number", "Ncutout", "Box Size", "Start Row"
    );
    println!("{:-<60}", "");

    for entry in store.catalog() {
        let start = entry
            .start_row
            .first()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<10} {:<10} {:<10} {:<12}",
            entry.id, entry.number, entry.ncutout, entry.box_size, start
        );
    }

    println!("\nTotal: {} objects", store.catalog().len());
    Ok(())
}
