//! File Storage Primitives
//!
//! Atomic JSON persistence shared by the schedule store, the approval log,
//! and the usage tracker. Writes go to a temp file in the same directory
//! followed by a rename, so a crash mid-write never corrupts the file.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Write `content` to `path` atomically (temp file + rename). Creates the
/// parent directory if needed.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .context("storage path has no parent directory")?;
    if !parent.exists() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create storage dir: {}", parent.display()))?;
    }

    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        Uuid::new_v4().simple(),
    ));

    let write_result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create temp file: {}", tmp.display()))?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    write_result
}

/// Serialize `value` as pretty JSON and write it atomically to `path`.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize state")?;
    atomic_write(path, &json)
}

/// Load JSON state from `path`. A missing or unparseable file degrades to
/// the default value rather than failing startup.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                warn!("corrupt state file {}, starting empty: {}", path.display(), e);
                T::default()
            }
        },
        Err(e) => {
            warn!("unreadable state file {}, starting empty: {}", path.display(), e);
            T::default()
        }
    }
}

/// Append one JSON line to a JSONL log, creating the file if needed.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let line = serde_json::to_string(record).context("failed to serialize record")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log: {}", path.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read every record from a JSONL log. Blank lines are skipped; a missing
/// file reads as empty. Unparseable lines are skipped with a warning so one
/// bad record cannot take the whole log down.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read log: {}", path.display()))?;
    let mut records = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("skipping bad record in {}: {}", path.display(), e),
        }
    }
    Ok(records)
}

/// Rewrite a JSONL log in full (atomic), used for status-change compaction.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut content = String::new();
    for record in records {
        content.push_str(&serde_json::to_string(record)?);
        content.push('\n');
    }
    atomic_write(path, &content)
}
