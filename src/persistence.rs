//! Append-only storage of analysis runs, keyed by project fingerprint.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error_handler::PersistenceError;
use crate::orchestrator::{AnalysisResults, RunStatus};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Store a finished run. A run id is written at most once.
    async fn save_run(&self, fingerprint: &str, results: &AnalysisResults) -> Result<(), PersistenceError>;

    /// Most recent COMPLETED run for the fingerprint, if any.
    async fn load_latest_completed(&self, fingerprint: &str) -> Result<Option<AnalysisResults>, PersistenceError>;
}

/// One JSON file per run under `<dir>/<fingerprint>/<run_id>.json`.
pub struct FileRunStore {
    directory: PathBuf,
}

impl FileRunStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn run_dir(&self, fingerprint: &str) -> PathBuf {
        self.directory.join(fingerprint)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save_run(&self, fingerprint: &str, results: &AnalysisResults) -> Result<(), PersistenceError> {
        let dir = self.run_dir(fingerprint);
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let path = dir.join(format!("{}.json", results.run.run_id));
        let content = serde_json::to_string_pretty(results)?;
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(PersistenceError::DuplicateRun(results.run.run_id.clone()));
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        file.write_all(content.as_bytes()).await.map_err(io_error(&path))?;
        file.flush().await.map_err(io_error(&path))?;
        debug!(path = %path.display(), "run stored");
        Ok(())
    }

    async fn load_latest_completed(&self, fingerprint: &str) -> Result<Option<AnalysisResults>, PersistenceError> {
        let dir = self.run_dir(fingerprint);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut latest: Option<AnalysisResults> = None;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await.map_err(io_error(&path))?;
            let results: AnalysisResults = match serde_json::from_str(&content) {
                Ok(results) => results,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable stored run");
                    continue;
                }
            };
            if results.run.status != RunStatus::Completed {
                continue;
            }
            if latest
                .as_ref()
                .map_or(true, |current| results.run.timestamp > current.run.timestamp)
            {
                latest = Some(results);
            }
        }
        Ok(latest)
    }
}

/// In-process store, used when caching is disabled on disk and in tests.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, Vec<AnalysisResults>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_count(&self, fingerprint: &str) -> usize {
        self.runs.lock().await.get(fingerprint).map_or(0, Vec::len)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, fingerprint: &str, results: &AnalysisResults) -> Result<(), PersistenceError> {
        let mut runs = self.runs.lock().await;
        let stored = runs.entry(fingerprint.to_string()).or_default();
        if stored.iter().any(|r| r.run.run_id == results.run.run_id) {
            return Err(PersistenceError::DuplicateRun(results.run.run_id.clone()));
        }
        stored.push(results.clone());
        Ok(())
    }

    async fn load_latest_completed(&self, fingerprint: &str) -> Result<Option<AnalysisResults>, PersistenceError> {
        let runs = self.runs.lock().await;
        Ok(runs.get(fingerprint).and_then(|stored| {
            stored
                .iter()
                .filter(|r| r.run.status == RunStatus::Completed)
                .max_by_key(|r| r.run.timestamp)
                .cloned()
        }))
    }
}

/// sha256 over the canonical project root and, for each selected file in
/// sorted order, its relative path, size and modification time.
pub async fn compute_fingerprint(root: &Path, selected_files: &[PathBuf]) -> std::io::Result<String> {
    let root = fs::canonicalize(root).await?;
    let mut files: Vec<&PathBuf> = selected_files.iter().collect();
    files.sort();
    files.dedup();

    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    for file in files {
        let relative = file.strip_prefix(&root).unwrap_or(file);
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        match fs::metadata(root.join(relative)).await {
            Ok(metadata) => {
                hasher.update(metadata.len().to_le_bytes());
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                hasher.update(modified.to_le_bytes());
            }
            Err(_) => hasher.update(b"missing"),
        }
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}
