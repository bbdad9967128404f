use crate::errors::{AppError, AppResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DATA_DIR_ENV: &str = "DOCNOTES_DATA_DIR";
const LOG_FILTER_ENV: &str = "DOCNOTES_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadPolicy {
    /// Same rule as viewing a note: the author, or an admin.
    AuthorOrAdmin,
    /// Any caller holding the doctor role may fetch any artifact.
    AnyDoctor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub artifacts_dir: String,
    pub log_dir: String,
    pub log_filter: String,
    pub patients_page_size: u32,
    pub min_note_chars: usize,
    pub create_requires_assignment: bool,
    pub download_policy: DownloadPolicy,
    pub rewrite_artifact_on_update: bool,
    pub orphan_grace_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_file: "docnotes.sqlite".to_string(),
            artifacts_dir: "artifacts".to_string(),
            log_dir: "logs".to_string(),
            log_filter: "info".to_string(),
            patients_page_size: 5,
            min_note_chars: 5,
            create_requires_assignment: true,
            download_policy: DownloadPolicy::AuthorOrAdmin,
            rewrite_artifact_on_update: false,
            orphan_grace_seconds: 300,
        }
    }
}

impl AppConfig {
    /// Reads a YAML config file; keys that are absent keep their defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `data_dir`, mostly for embedding and tests.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
            if !filter.trim().is_empty() {
                self.log_filter = filter;
            }
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.patients_page_size == 0 {
            return Err(AppError::Validation("patients-page-size must be at least 1".to_string()));
        }
        if self.min_note_chars == 0 {
            return Err(AppError::Validation("min-note-chars must be at least 1".to_string()));
        }
        if self.database_file.trim().is_empty() || self.artifacts_dir.trim().is_empty() {
            return Err(AppError::Validation(
                "database-file and artifacts-dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.data_dir.join(&self.artifacts_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, DownloadPolicy};

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("docnotes.yaml");
        std::fs::write(
            &path,
            "patients-page-size: 10\ndownload-policy: any-doctor\n",
        )
        .expect("write config");

        let config = AppConfig::load(&path).expect("load config");
        assert_eq!(config.patients_page_size, 10);
        assert_eq!(config.download_policy, DownloadPolicy::AnyDoctor);
        assert_eq!(config.min_note_chars, 5);
        assert!(config.create_requires_assignment);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let config = AppConfig {
            patients_page_size: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_paths_hang_off_data_dir() {
        let config = AppConfig::with_data_dir("/srv/docnotes");
        assert_eq!(config.database_path().to_string_lossy(), "/srv/docnotes/docnotes.sqlite");
        assert_eq!(config.artifacts_root().to_string_lossy(), "/srv/docnotes/artifacts");
    }
}
