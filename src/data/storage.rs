//! Metadata sinks.
//!
//! The I/Q samples themselves never pass through this process; the recorder
//! archives them straight to the network drive. What lands here is the
//! per-file header describing how to read them back.

use crate::config::StorageConfig;
use crate::core::FileCycle;
use crate::error::AppResult;
use crate::metadata::FileMetadata;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Destination for the metadata of completed file cycles.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    /// Store the header for one completed cycle.
    async fn persist(&mut self, cycle: &FileCycle, metadata: &FileMetadata) -> AppResult<()>;

    /// Remove leftovers of interrupted writes. Returns how many were removed.
    async fn purge_partial(&mut self) -> AppResult<usize>;
}

// ============================================================================
// JSON header writer
// ============================================================================

/// Writes `<dir>/<file name>.<header extension>` as pretty JSON.
#[derive(Clone, Debug)]
pub struct JsonHeaderWriter {
    dir: PathBuf,
    header_extension: String,
    partial_extension: String,
}

impl JsonHeaderWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            header_extension: "wvh".to_string(),
            partial_extension: "wsm".to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            dir: config.metadata_dir.clone(),
            header_extension: config.header_extension.clone(),
            partial_extension: config.partial_extension.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header_path(&self, file_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_name, self.header_extension))
    }

    /// Load a previously written header.
    pub async fn read(&self, file_name: &str) -> AppResult<FileMetadata> {
        let text = tokio::fs::read_to_string(self.header_path(file_name)).await?;
        FileMetadata::from_json(&text)
    }
}

#[async_trait]
impl MetadataSink for JsonHeaderWriter {
    async fn persist(&mut self, cycle: &FileCycle, metadata: &FileMetadata) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.header_path(&cycle.file_name);
        let json = metadata.to_json_pretty()?;
        tokio::fs::write(&path, json).await?;
        debug!("metadata for file {} written to '{}'", cycle.file_number, path.display());
        Ok(())
    }

    async fn purge_partial(&mut self) -> AppResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_partial = path
                .extension()
                .is_some_and(|ext| ext == self.partial_extension.as_str());
            if !is_partial {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not remove '{}': {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("removed {} partial file(s) from '{}'", removed, self.dir.display());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::AcquisitionParameters;
    use chrono::{FixedOffset, TimeZone};
    use tempfile::tempdir;

    fn cycle() -> FileCycle {
        let offset = FixedOffset::east_opt(3600).unwrap();
        let at = offset.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
        FileCycle::begin(1, at)
    }

    #[tokio::test]
    async fn test_persist_creates_directory_and_header() {
        let dir = tempdir().unwrap();
        let mut writer = JsonHeaderWriter::new(dir.path().join("headers"));
        let params = AcquisitionParameters::new(245e6, 5e6, -45.0, 2.0).unwrap();
        let cycle = cycle();
        let metadata = FileMetadata::new(&params, &cycle);

        writer.persist(&cycle, &metadata).await.unwrap();

        let path = writer.header_path("20240517_093000");
        assert!(path.ends_with("headers/20240517_093000.wvh"));
        assert_eq!(writer.read(&cycle.file_name).await.unwrap(), metadata);
    }

    #[tokio::test]
    async fn test_purge_only_touches_partial_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.wsm"), b"x").unwrap();
        std::fs::write(dir.path().join("b.wsm"), b"x").unwrap();
        std::fs::write(dir.path().join("a.wvh"), b"{}").unwrap();

        let mut writer = JsonHeaderWriter::new(dir.path());
        assert_eq!(writer.purge_partial().await.unwrap(), 2);
        assert!(dir.path().join("a.wvh").exists());
        assert!(!dir.path().join("a.wsm").exists());
    }

    #[tokio::test]
    async fn test_purge_of_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let mut writer = JsonHeaderWriter::new(dir.path().join("never-created"));
        assert_eq!(writer.purge_partial().await.unwrap(), 0);
    }
}
