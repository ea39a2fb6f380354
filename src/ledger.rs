/// Processed ledger: the JSON list of source file names that made it all the
/// way through (render verified, duration matched, size accepted).
///
/// Lives next to the sources (`<input_dir>/.processed_videos.json`). Deleting
/// it makes every video eligible again.
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ProcessedLedger {
    path: PathBuf,
    names: Vec<String>,
}

impl ProcessedLedger {
    /// Load the ledger. A missing file is an empty ledger; an unreadable or
    /// malformed one is reported and replaced by an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let names = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<String>>(&contents) {
                Ok(names) => {
                    tracing::info!(count = names.len(), "loaded processed ledger");
                    names
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "could not parse processed ledger, starting fresh"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "could not read processed ledger, starting fresh"
                );
                Vec::new()
            }
        };
        Self { path, names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `name` as processed and persist the ledger.
    pub fn mark(&mut self, name: &str) -> Result<(), LedgerError> {
        if self.contains(name) {
            return Ok(());
        }
        self.names.push(name.to_string());
        if let Err(e) = self.save() {
            // Keep memory in line with disk so a later save can't record it
            self.names.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Atomically rewrite the ledger file.
    fn save(&self) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(&self.names)
            .map_err(|e| LedgerError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let write_err = |e: std::io::Error| LedgerError::Write {
            path: self.path.clone(),
            source: e,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// Errors from persisting the ledger.
#[derive(Debug)]
pub enum LedgerError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Serialize { source } => write!(f, "failed to serialize ledger: {source}"),
            LedgerError::Write { path, source } => {
                write!(f, "failed to write ledger {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Serialize { source } => Some(source),
            LedgerError::Write { source, .. } => Some(source),
        }
    }
}
