use super::PerformanceBaseline;
use crate::error::{DiagnosticError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// File name timestamp; lexical order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

fn file_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?P<name>.+)-(?P<timestamp>\d{8}T\d{9}Z)\.json$").ok())
        .as_ref()
}

/// Collapse every run of characters outside `[A-Za-z0-9_.-]` into one `_` so
/// a name is safe as a file stem.
pub fn sanitize_name(name: &str) -> Result<String> {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            sanitized.push(c);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }
    let sanitized = sanitized.trim_matches(|c| c == '_' || c == '.');
    if sanitized.is_empty() {
        return Err(DiagnosticError::invalid_input(format!(
            "baseline name '{name}' has no usable characters"
        )));
    }
    Ok(sanitized.to_string())
}

/// `(name, timestamp)` parsed from a baseline file name.
fn parse_file_name(file_name: &str) -> Option<(String, String)> {
    let captures = file_name_pattern()?.captures(file_name)?;
    Some((
        captures.name("name")?.as_str().to_string(),
        captures.name("timestamp")?.as_str().to_string(),
    ))
}

/// Persistence for captured baselines.
#[async_trait]
pub trait BaselineStore: Send + Sync + std::fmt::Debug {
    /// Persist a new snapshot, returning where it was written.
    async fn save(&self, baseline: &PerformanceBaseline) -> Result<String>;

    /// Newest baseline captured under `name`.
    async fn load_latest_by_name(&self, name: &str) -> Result<Option<PerformanceBaseline>>;

    /// Newest baseline whose target hash matches.
    async fn load_latest_for_target(&self, target_hash: &str) -> Result<Option<PerformanceBaseline>>;

    /// Every readable baseline, newest first.
    async fn list(&self) -> Result<Vec<PerformanceBaseline>>;
}

#[derive(Debug, Clone)]
struct StoredFile {
    path: PathBuf,
    name: String,
    timestamp: String,
}

/// One JSON file per capture under a directory. Writes are serialized
/// through a per-store gate and never overwrite an existing file.
#[derive(Debug)]
pub struct FileBaselineStore {
    directory: PathBuf,
    write_gate: Mutex<()>,
}

impl FileBaselineStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Baseline files, newest first.
    async fn stored_files(&self) -> Result<Vec<StoredFile>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some((name, timestamp)) = parse_file_name(file_name) {
                files.push(StoredFile {
                    path: entry.path(),
                    name,
                    timestamp,
                });
            }
        }

        files.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(files)
    }

    async fn read(path: &Path) -> Result<PerformanceBaseline> {
        let content = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}

#[async_trait]
impl BaselineStore for FileBaselineStore {
    async fn save(&self, baseline: &PerformanceBaseline) -> Result<String> {
        let stem = sanitize_name(&baseline.name)?;
        let file_name = format!("{stem}-{}.json", baseline.captured_at.format(TIMESTAMP_FORMAT));
        let path = self.directory.join(&file_name);
        let content = serde_json::to_vec_pretty(baseline)?;

        let _guard = self.write_gate.lock().await;
        tokio::fs::create_dir_all(&self.directory).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&content).await?;
        file.flush().await?;

        info!("Saved baseline '{}' to {}", baseline.name, path.display());
        Ok(path.display().to_string())
    }

    async fn load_latest_by_name(&self, name: &str) -> Result<Option<PerformanceBaseline>> {
        let stem = sanitize_name(name)?;
        for file in self.stored_files().await? {
            if file.name != stem {
                continue;
            }
            debug!("Loading baseline {}", file.path.display());
            match Self::read(&file.path).await {
                Ok(baseline) => return Ok(Some(baseline)),
                Err(e) => warn!("Skipping unreadable baseline {}: {}", file.path.display(), e),
            }
        }
        Ok(None)
    }

    async fn load_latest_for_target(&self, target_hash: &str) -> Result<Option<PerformanceBaseline>> {
        for file in self.stored_files().await? {
            match Self::read(&file.path).await {
                Ok(baseline) if baseline.target_hash == target_hash => return Ok(Some(baseline)),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable baseline {}: {}", file.path.display(), e),
            }
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<PerformanceBaseline>> {
        let mut baselines = Vec::new();
        for file in self.stored_files().await? {
            match Self::read(&file.path).await {
                Ok(baseline) => baselines.push(baseline),
                Err(e) => warn!("Skipping unreadable baseline {}: {}", file.path.display(), e),
            }
        }
        Ok(baselines)
    }
}
