use crate::errors::{AppError, AppResult};
use crate::models::PatientId;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use uuid::Uuid;

pub const NOTES_DIR: &str = "notes";

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("valid blob segment regex"));

/// Relative, traversal-free path into the blob surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobPath(String);

impl BlobPath {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(AppError::Validation("blob path must not be empty".to_string()));
        }
        for segment in trimmed.split('/') {
            if segment == "." || segment == ".." || !SEGMENT_RE.is_match(segment) {
                return Err(AppError::Validation(format!("invalid blob path segment '{}'", segment)));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// `notes/Note_{patient}_{yyyyMMddHHmmss}.txt`, with `_{n}` before the
    /// extension for the n-th note of the same patient in the same second.
    pub fn note_artifact(patient_id: PatientId, at: DateTime<Utc>, attempt: u32) -> Self {
        let stamp = at.format("%Y%m%d%H%M%S");
        let name = if attempt <= 1 {
            format!("Note_{}_{}.txt", patient_id, stamp)
        } else {
            format!("Note_{}_{}_{}.txt", patient_id, stamp, attempt)
        };
        Self(format!("{}/{}", NOTES_DIR, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BlobListing {
    pub path: BlobPath,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Path-addressable byte storage without transactions.
pub trait BlobSurface: Send + Sync {
    fn write(&self, path: &BlobPath, bytes: &[u8]) -> AppResult<()>;
    fn read(&self, path: &BlobPath) -> AppResult<Vec<u8>>;
    /// Deleting a missing path succeeds.
    fn delete(&self, path: &BlobPath) -> AppResult<()>;
    fn exists(&self, path: &BlobPath) -> AppResult<bool>;
    fn list(&self, prefix: &str) -> AppResult<Vec<BlobListing>>;
}

#[derive(Debug, Clone)]
pub struct FsBlobSurface {
    root: PathBuf,
}

impl FsBlobSurface {
    pub fn new(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| AppError::Persistence(error.to_string()))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &BlobPath) -> PathBuf {
        path.as_str().split('/').fold(self.root.clone(), |acc, segment| acc.join(segment))
    }
}

impl BlobSurface for FsBlobSurface {
    fn write(&self, path: &BlobPath, bytes: &[u8]) -> AppResult<()> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| AppError::Internal(format!("blob path '{}' has no parent", path)))?;
        fs::create_dir_all(parent).map_err(|error| AppError::Persistence(error.to_string()))?;

        let staging = parent.join(format!(".{}.{}.tmp", path.file_name(), Uuid::new_v4().simple()));
        let written = fs::File::create(&staging)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&staging, &target));
        if let Err(error) = written {
            let _ = fs::remove_file(&staging);
            return Err(AppError::Persistence(error.to_string()));
        }
        Ok(())
    }

    fn read(&self, path: &BlobPath) -> AppResult<Vec<u8>> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("blob '{}' not found", path)))
            }
            Err(error) => Err(AppError::Persistence(error.to_string())),
        }
    }

    fn delete(&self, path: &BlobPath) -> AppResult<()> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(AppError::Persistence(error.to_string())),
        }
    }

    fn exists(&self, path: &BlobPath) -> AppResult<bool> {
        Ok(self.resolve(path).is_file())
    }

    fn list(&self, prefix: &str) -> AppResult<Vec<BlobListing>> {
        let prefix = BlobPath::parse(prefix)?;
        let dir = self.resolve(&prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(AppError::Persistence(error.to_string())),
        };

        let mut listings = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| AppError::Persistence(error.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().map_err(|error| AppError::Persistence(error.to_string()))?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(path) = BlobPath::parse(&format!("{}/{}", prefix, file_name)) else {
                tracing::warn!(file = %file_name, "skipping blob with unexpected name");
                continue;
            };
            listings.push(BlobListing {
                path,
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        listings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listings)
    }
}
