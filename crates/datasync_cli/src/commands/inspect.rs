//! Inspect command implementation.

use datasync_engine::{LocalStore, KEYSTORE_NAMESPACE};
use datasync_server::DatabaseController;
use datasync_storage::{FileBackend, KeyValueBackend};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// What the store belongs to: `device`, `server` or `empty`.
    pub kind: &'static str,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of batch records in the file.
    pub batch_records: u64,
    /// Number of live entries.
    pub entries: usize,
    /// Device stores: records per type.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeStats>,
    /// Device stores: number of unsynchronized keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_count: Option<usize>,
    /// Device stores: the unsynchronized keys, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<PendingChange>>,
    /// Server stores: registered devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<usize>,
    /// Server stores: accounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts: Option<usize>,
}

/// Statistics for one record type.
#[derive(Debug, Serialize)]
pub struct TypeStats {
    /// Type name.
    pub type_name: String,
    /// Live records.
    pub records: usize,
    /// Tombstones.
    pub tombstones: usize,
}

/// One unsynchronized key.
#[derive(Debug, Serialize)]
pub struct PendingChange {
    /// Printable key.
    pub key: String,
    /// `Changed` or `Deleted`.
    pub state: String,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_pending: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    let file = Arc::new(FileBackend::open(path)?);
    let result = inspect(&file, show_pending)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn inspect(
    file: &Arc<FileBackend>,
    show_pending: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let backend: Arc<dyn KeyValueBackend> = Arc::clone(file) as Arc<dyn KeyValueBackend>;
    let mut result = InspectResult {
        path: file.path().display().to_string(),
        kind: "empty",
        file_size: file.file_size(),
        batch_records: file.record_count(),
        entries: file.entry_count(),
        types: Vec::new(),
        pending_count: None,
        pending: None,
        devices: None,
        accounts: None,
    };
    if result.entries == 0 {
        return Ok(result);
    }

    if !backend.scan_prefix(KEYSTORE_NAMESPACE, &[])?.is_empty() {
        result.kind = "device";
        let store = LocalStore::new(backend);
        result.types = store
            .type_summaries()?
            .into_iter()
            .map(|s| TypeStats {
                type_name: s.type_name,
                records: s.records,
                tombstones: s.tombstones,
            })
            .collect();
        let changes = store.change_log().list_local_changes()?;
        result.pending_count = Some(changes.len());
        if show_pending {
            result.pending = Some(
                changes
                    .into_iter()
                    .map(|c| PendingChange {
                        key: c.key.to_string(),
                        state: format!("{:?}", c.state),
                    })
                    .collect(),
            );
        }
    } else {
        result.kind = "server";
        let database = DatabaseController::open(backend)?;
        result.devices = Some(database.device_count()?);
        result.accounts = Some(database.account_count()?);
    }
    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("Datasync Store Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!("Kind: {}", result.kind);
    println!();
    println!("File:");
    println!("  Size:          {} bytes", result.file_size);
    println!("  Batch records: {}", result.batch_records);
    println!("  Live entries:  {}", result.entries);

    if let (Some(devices), Some(accounts)) = (result.devices, result.accounts) {
        println!();
        println!("Server:");
        println!("  Devices:  {devices}");
        println!("  Accounts: {accounts}");
    }

    if !result.types.is_empty() {
        println!();
        println!("Types:");
        println!("  {:<24} {:>10} {:>12}", "Type", "Records", "Tombstones");
        for t in &result.types {
            println!("  {:<24} {:>10} {:>12}", t.type_name, t.records, t.tombstones);
        }
    }

    if let Some(count) = result.pending_count {
        println!();
        println!("Pending changes: {count}");
    }
    if let Some(pending) = &result.pending {
        for change in pending {
            println!("  {:<8} {}", change.state, change.key);
        }
    }
}
