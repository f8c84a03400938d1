use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;
use crate::ledger::SizeLedger;

/// Extensions listed as conversion outputs
const OUTPUT_EXTENSIONS: &[&str] = &["webm", "mp4", "mkv"];

/// A finished output file with its compression figures
#[derive(Debug, Clone, Serialize)]
pub struct OutputEntry {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    /// Size of the input at conversion time, or `size_bytes` when unknown
    pub original_size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Percentage saved relative to the original; negative when the output grew
pub fn reduction_percent(original_size: u64, new_size: u64) -> i64 {
    if original_size == 0 {
        return 0;
    }
    let ratio = new_size as u128 * 100 / original_size as u128;
    100 - i64::try_from(ratio).unwrap_or(i64::MAX - 100)
}

impl OutputEntry {
    pub fn reduction_percent(&self) -> i64 {
        reduction_percent(self.original_size_bytes, self.size_bytes)
    }

    pub fn formatted_size(&self) -> String {
        format_size(self.size_bytes, DECIMAL)
    }

    pub fn formatted_original_size(&self) -> String {
        format_size(self.original_size_bytes, DECIMAL)
    }
}

fn is_output_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| OUTPUT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// List non-empty outputs directly inside `dir`, newest first.
///
/// A missing directory lists as empty.
pub fn list_outputs(dir: &Path, ledger: &SizeLedger) -> Result<Vec<OutputEntry>> {
    if !dir.exists() {
        debug!("Output directory does not exist yet: {}", dir.display());
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !entry.file_type().is_file() || !is_output_file(path) {
            continue;
        }

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        if meta.len() == 0 {
            continue;
        }

        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        entries.push(OutputEntry {
            path: path.to_path_buf(),
            name: entry.file_name().to_string_lossy().to_string(),
            size_bytes: meta.len(),
            original_size_bytes: ledger.get(path).unwrap_or(meta.len()),
            modified,
        });
    }

    entries.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(entries)
}

/// Delete an output file and forget its original size.
///
/// The ledger entry is dropped even when the file is already gone.
pub fn delete_output(path: &Path, ledger: &mut SizeLedger) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => info!("Deleted output: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Output already gone: {}", path.display());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to delete output: {}", path.display())),
    }

    if ledger.remove(path).is_some() {
        ledger.save().context("Failed to persist ledger")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn write_with_mtime(path: &Path, len: usize, age_secs: u64) {
        fs::write(path, vec![7u8; len]).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
    }

    #[test]
    fn test_list_filters_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("state").join("converted_files");
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("nested")).unwrap();

        write_with_mtime(&out.join("old_converted.webm"), 100, 300);
        write_with_mtime(&out.join("new_converted.webm"), 50, 10);
        write_with_mtime(&out.join("clip.MKV"), 20, 100);
        write_with_mtime(&out.join("notes.txt"), 20, 5);
        write_with_mtime(&out.join("nested").join("deep.webm"), 20, 5);
        fs::write(out.join("empty.webm"), b"").unwrap();

        let mut ledger = SizeLedger::new(ledger_path);
        ledger.put(&out.join("new_converted.webm"), 200).unwrap();

        let listed = list_outputs(&out, &ledger).unwrap();
        let names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["new_converted.webm", "clip.MKV", "old_converted.webm"]);

        assert_eq!(listed[0].original_size_bytes, 200);
        assert_eq!(listed[0].reduction_percent(), 75);
        // No ledger entry: original falls back to the file's own size
        assert_eq!(listed[2].original_size_bytes, 100);
        assert_eq!(listed[2].reduction_percent(), 0);
    }

    #[test]
    fn test_missing_dir_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SizeLedger::new(dir.path().join("converted_files"));
        assert!(list_outputs(&dir.path().join("nope"), &ledger).unwrap().is_empty());
    }

    #[test]
    fn test_reduction_percent_when_output_grew() {
        let entry = OutputEntry {
            path: PathBuf::from("/o.webm"),
            name: "o.webm".to_string(),
            size_bytes: 150,
            original_size_bytes: 100,
            modified: Utc::now(),
        };
        assert_eq!(entry.reduction_percent(), -50);
        assert_eq!(reduction_percent(0, 10), 0);
        assert_eq!(entry.formatted_size(), "150 B");
    }

    #[test]
    fn test_delete_removes_file_and_ledger_entry() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("converted_files");
        let output = dir.path().join("a.webm");
        fs::write(&output, b"data").unwrap();

        let mut ledger = SizeLedger::new(&record);
        ledger.put(&output, 1_000).unwrap();
        ledger.save().unwrap();

        delete_output(&output, &mut ledger).unwrap();
        assert!(!output.exists());
        assert_eq!(ledger.get(&output), None);
        assert_eq!(SizeLedger::load(&record).unwrap().get(&output), None);

        // Second delete of the same path is harmless
        delete_output(&output, &mut ledger).unwrap();
    }
}
