use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use thiserror::Error;

/// File name of the single persisted ledger record
pub const LEDGER_RECORD_NAME: &str = "converted_files";

const RECORD_SEPARATOR: char = '|';
const FIELD_SEPARATOR: char = ',';

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write ledger {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("path cannot be stored in the ledger (contains '|'): {0}")]
    UnencodablePath(String),
}

/// Durable mapping from converted output path to the size of its original input.
///
/// The whole ledger lives in one record: entries joined by `|`, each entry
/// `path,size`. Malformed entries are skipped on load rather than failing it.
#[derive(Debug, Clone, Default)]
pub struct SizeLedger {
    record_path: PathBuf,
    entries: HashMap<String, u64>,
}

impl SizeLedger {
    /// Empty ledger that will persist to `record_path`
    pub fn new(record_path: impl Into<PathBuf>) -> Self {
        Self {
            record_path: record_path.into(),
            entries: HashMap::new(),
        }
    }

    /// Load the ledger from `record_path`; a missing record is an empty ledger
    pub fn load(record_path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let record_path = record_path.into();
        let raw = match fs::read_to_string(&record_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(LedgerError::Read { path: record_path, source }),
        };

        let entries = decode(&raw);
        debug!("Loaded {} ledger entries from {}", entries.len(), record_path.display());
        Ok(Self { record_path, entries })
    }

    /// Persist every entry, replacing the previous record atomically
    pub fn save(&self) -> Result<(), LedgerError> {
        let write_err = |source| LedgerError::Write { path: self.record_path.clone(), source };

        if let Some(parent) = self.record_path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut tmp = self.record_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, encode(&self.entries)).map_err(write_err)?;
        fs::rename(&tmp, &self.record_path).map_err(write_err)?;
        Ok(())
    }

    /// Record the original size for an output path; last write wins
    pub fn put(&mut self, path: &Path, size: u64) -> Result<(), LedgerError> {
        let key = path.to_string_lossy().into_owned();
        if key.contains(RECORD_SEPARATOR) {
            return Err(LedgerError::UnencodablePath(key));
        }
        self.entries.insert(key, size);
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<u64> {
        self.entries.get(path.to_string_lossy().as_ref()).copied()
    }

    pub fn get_all(&self) -> &HashMap<String, u64> {
        &self.entries
    }

    /// Drop an entry; only used when the output itself is deleted on request
    pub fn remove(&mut self, path: &Path) -> Option<u64> {
        self.entries.remove(path.to_string_lossy().as_ref())
    }
}

fn encode(entries: &HashMap<String, u64>) -> String {
    entries
        .iter()
        .map(|(path, size)| format!("{}{}{}", path, FIELD_SEPARATOR, size))
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}

fn decode(raw: &str) -> HashMap<String, u64> {
    let mut entries = HashMap::new();

    for record in raw.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty()) {
        // Size is after the last comma, so paths may contain commas
        let parsed = record
            .rsplit_once(FIELD_SEPARATOR)
            .filter(|(path, _)| !path.is_empty())
            .and_then(|(path, size)| size.trim().parse::<u64>().ok().map(|s| (path, s)));

        match parsed {
            Some((path, size)) => {
                entries.insert(path.to_string(), size);
            }
            None => warn!("Skipping malformed ledger entry: {:?}", record),
        }
    }

    entries
}
