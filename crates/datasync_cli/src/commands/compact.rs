//! Compact command implementation.

use datasync_storage::FileBackend;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }

    println!("Compacting store at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let backend = FileBackend::open(path)?;
    println!("Compaction Analysis:");
    println!("  Batch records: {}", backend.record_count());
    println!("  Live entries:  {}", backend.entry_count());
    println!("  Size before:   {} bytes", backend.file_size());

    if dry_run {
        return Ok(());
    }
    if backend.record_count() <= 1 {
        println!();
        println!("No compaction needed - store is a single snapshot");
        return Ok(());
    }

    let (before, after) = backend.compact()?;
    println!("  Size after:    {} bytes", after);
    println!(
        "  Space saved:   {} bytes ({:.1}%)",
        before.saturating_sub(after),
        if before > 0 {
            (before.saturating_sub(after) as f64 / before as f64) * 100.0
        } else {
            0.0
        }
    );
    println!();
    println!("✓ Compaction complete");
    Ok(())
}
