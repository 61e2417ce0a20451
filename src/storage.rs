//! Local durable staging for artifacts awaiting upload.
//!
//! Each artifact is staged as two files in the staging directory: the body
//! (exactly the bytes that will be uploaded) and a `.meta.json` sidecar. The
//! body is written first and the sidecar last, both via write-to-temp then
//! rename, so a sidecar only exists for a complete body. On start-up
//! [`LocalStore::recover`] rebuilds every staged artifact from its sidecar;
//! screenshot bodies stay on disk and are read only when uploaded.
//! Artifacts that fail permanently are moved to `failed/` instead of deleted.

use crate::artifact::{Artifact, ArtifactId, ArtifactKind, ArtifactPayload, ImageData, LogRecord};
use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const META_SUFFIX: &str = ".meta.json";
const TMP_SUFFIX: &str = ".tmp";
const FAILED_DIR: &str = "failed";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("staged file missing: {0:?}")]
    NotFound(PathBuf),
    #[error("corrupt staging metadata {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_path_buf())
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Sidecar describing a staged artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagedMeta {
    id: ArtifactId,
    kind: ArtifactKind,
    created_at: Timestamp,
    attempts: u32,
    file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<LogRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl StagedMeta {
    fn of(artifact: &Artifact) -> Self {
        let record = match &artifact.payload {
            ArtifactPayload::LogRecord(record) => Some(record.clone()),
            ArtifactPayload::Screenshot(_) => None,
        };
        Self {
            id: artifact.id,
            kind: artifact.kind(),
            created_at: artifact.created_at.clone(),
            attempts: artifact.attempts,
            file_name: artifact.file_name(),
            record,
            failure: None,
        }
    }
}

/// Summary of a staged artifact, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedSummary {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub file_name: String,
    pub attempts: u32,
    pub size_bytes: u64,
}

/// The staging directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a staging directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let failed = root.join(FAILED_DIR);
        std::fs::create_dir_all(&failed).map_err(|e| StorageError::io(&failed, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    fn body_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    fn meta_path(&self, file_name: &str) -> PathBuf {
        self.root.join(format!("{file_name}{META_SUFFIX}"))
    }

    /// Durably write the artifact's body and sidecar.
    ///
    /// An artifact whose image bytes were already released must have its body
    /// on disk; only the sidecar is rewritten then.
    pub fn stage(&self, artifact: &Artifact) -> Result<PathBuf, StorageError> {
        let file_name = artifact.file_name();
        let body = self.body_path(&file_name);
        match artifact.payload.encode() {
            Some(bytes) => write_atomic(&body, &bytes)?,
            None if body.exists() => {}
            None => return Err(StorageError::NotFound(body)),
        }
        self.write_meta(&StagedMeta::of(artifact))?;
        Ok(body)
    }

    fn write_meta(&self, meta: &StagedMeta) -> Result<(), StorageError> {
        let path = self.meta_path(&meta.file_name);
        let json = serde_json::to_vec_pretty(meta).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json)
    }

    /// Read the staged body of an artifact.
    pub fn read(&self, artifact: &Artifact) -> Result<Vec<u8>, StorageError> {
        let path = self.body_path(&artifact.file_name());
        std::fs::read(&path).map_err(|e| StorageError::io(&path, e))
    }

    pub fn contains(&self, artifact: &Artifact) -> bool {
        self.meta_path(&artifact.file_name()).exists()
    }

    /// Persist the attempt counter so it survives a restart.
    pub fn record_attempts(&self, artifact: &Artifact) -> Result<(), StorageError> {
        if !self.contains(artifact) {
            return Err(StorageError::NotFound(self.meta_path(&artifact.file_name())));
        }
        self.write_meta(&StagedMeta::of(artifact))
    }

    /// Release the staged copy once the remote store has confirmed it.
    pub fn remove(&self, artifact: &Artifact) -> Result<(), StorageError> {
        let file_name = artifact.file_name();
        // Sidecar first: without it the body is no longer considered pending.
        remove_if_exists(&self.meta_path(&file_name))?;
        remove_if_exists(&self.body_path(&file_name))
    }

    /// Move a permanently failed artifact out of the pending set.
    pub fn quarantine(&self, artifact: &Artifact, failure: &str) -> Result<PathBuf, StorageError> {
        let file_name = artifact.file_name();
        let failed = self.failed_dir();

        let mut meta = StagedMeta::of(artifact);
        meta.failure = Some(failure.to_string());
        let failed_meta = failed.join(format!("{file_name}{META_SUFFIX}"));
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| StorageError::Corrupt {
            path: failed_meta.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&failed_meta, &json)?;

        let body = self.body_path(&file_name);
        let target = failed.join(&file_name);
        if body.exists() {
            std::fs::rename(&body, &target).map_err(|e| StorageError::io(&body, e))?;
        }
        remove_if_exists(&self.meta_path(&file_name))?;
        Ok(target)
    }

    /// Rebuild every staged artifact not yet confirmed uploaded, oldest first.
    ///
    /// Leftover temp files are removed; bodies without a sidecar are moved to
    /// `failed/` since they cannot be described.
    pub fn recover(&self) -> Result<Vec<Artifact>, StorageError> {
        let mut recovered = Vec::new();

        for path in self.list_files()? {
            let name = file_name_of(&path);
            if name.ends_with(TMP_SUFFIX) {
                remove_if_exists(&path)?;
                continue;
            }
            if !name.ends_with(META_SUFFIX) {
                let meta = self.meta_path(&name);
                if !meta.exists() {
                    tracing::warn!(file = %name, "staged body without metadata, moving to failed/");
                    let target = self.failed_dir().join(&name);
                    std::fs::rename(&path, &target).map_err(|e| StorageError::io(&path, e))?;
                }
                continue;
            }

            match self.load_meta(&path) {
                Ok(artifact) => recovered.push(artifact),
                Err(StorageError::NotFound(body)) => {
                    tracing::warn!(meta = ?path, body = ?body, "staged metadata without body, dropping");
                    remove_if_exists(&path)?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable staging metadata, moving to failed/");
                    let target = self.failed_dir().join(&name);
                    std::fs::rename(&path, &target).map_err(|e| StorageError::io(&path, e))?;
                }
            }
        }

        sort_oldest_first(&mut recovered);
        Ok(recovered)
    }

    /// Staged artifacts, oldest first, without touching anything on disk.
    ///
    /// Safe while the agent runs: temp files and half-described entries are
    /// skipped rather than cleaned up.
    pub fn scan(&self) -> Result<Vec<Artifact>, StorageError> {
        let mut staged = Vec::new();
        for path in self.list_files()? {
            if !file_name_of(&path).ends_with(META_SUFFIX) {
                continue;
            }
            match self.load_meta(&path) {
                Ok(artifact) => staged.push(artifact),
                Err(e) => tracing::debug!(meta = ?path, error = %e, "skipping staged entry"),
            }
        }
        sort_oldest_first(&mut staged);
        Ok(staged)
    }

    /// List staged artifacts without loading bodies.
    pub fn pending(&self) -> Result<Vec<StagedSummary>, StorageError> {
        let mut pending = Vec::new();
        for path in self.list_files()? {
            let name = file_name_of(&path);
            if !name.ends_with(META_SUFFIX) {
                continue;
            }
            let meta = read_meta(&path)?;
            let size_bytes = std::fs::metadata(self.body_path(&meta.file_name))
                .map(|m| m.len())
                .unwrap_or(0);
            pending.push(StagedSummary {
                id: meta.id,
                kind: meta.kind,
                file_name: meta.file_name,
                attempts: meta.attempts,
                size_bytes,
            });
        }
        pending.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(pending)
    }

    fn list_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| StorageError::io(&self.root, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.root, e))?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn load_meta(&self, meta_path: &Path) -> Result<Artifact, StorageError> {
        let meta = read_meta(meta_path)?;
        let body = self.body_path(&meta.file_name);
        if !body.exists() {
            return Err(StorageError::NotFound(body));
        }
        let payload = match meta.kind {
            ArtifactKind::Screenshot => ArtifactPayload::Screenshot(ImageData::Staged),
            ArtifactKind::LogRecord => {
                let record = meta.record.clone().ok_or_else(|| StorageError::Corrupt {
                    path: meta_path.to_path_buf(),
                    reason: "log artifact without record".to_string(),
                })?;
                ArtifactPayload::LogRecord(record)
            }
        };
        let artifact = Artifact {
            id: meta.id,
            payload,
            created_at: meta.created_at,
            attempts: meta.attempts,
        };
        if artifact.file_name() != meta.file_name {
            return Err(StorageError::Corrupt {
                path: meta_path.to_path_buf(),
                reason: format!("file name mismatch: {}", meta.file_name),
            });
        }
        Ok(artifact)
    }
}

fn sort_oldest_first(artifacts: &mut [Artifact]) {
    artifacts.sort_by(|a, b| a.created_at.utc().cmp(&b.created_at.utc()));
}

fn read_meta(path: &Path) -> Result<StagedMeta, StorageError> {
    let bytes = std::fs::read(path).map_err(|e| StorageError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Write via a temp file and rename so readers never see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = PathBuf::from(format!("{}{TMP_SUFFIX}", path.display()));
    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| StorageError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StorageError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::core::{Evidence, SuspicionReason, Verdict};
    use chrono::Utc;

    fn log_artifact(clock: &Clock) -> Artifact {
        let verdict = Verdict {
            is_suspicious: true,
            reason: SuspicionReason::HighPointerSpeed,
            evidence: Evidence::default(),
            evaluated_at: Utc::now(),
        };
        Artifact::log_record(LogRecord::from_verdict(&verdict, clock, "test-host"))
    }

    #[test]
    fn test_stage_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let clock = Clock::system();
        let artifact = Artifact::screenshot(vec![9, 8, 7], &clock);

        let path = store.stage(&artifact).unwrap();
        assert!(path.exists());
        assert!(store.contains(&artifact));
        assert_eq!(store.read(&artifact).unwrap(), vec![9, 8, 7]);

        store.remove(&artifact).unwrap();
        assert!(!store.contains(&artifact));
        assert!(matches!(
            store.read(&artifact),
            Err(StorageError::NotFound(_))
        ));
        // Removing twice is fine.
        store.remove(&artifact).unwrap();
    }

    #[test]
    fn test_recover_rebuilds_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let clock = Clock::system();

        let mut shot = Artifact::screenshot(vec![1, 2, 3], &clock);
        let log = log_artifact(&clock);
        store.stage(&shot).unwrap();
        store.stage(&log).unwrap();
        shot.attempts = 3;
        store.record_attempts(&shot).unwrap();

        let recovered = store.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        let found_shot = recovered.iter().find(|a| a.id == shot.id).unwrap();
        assert_eq!(found_shot.attempts, 3);
        assert_eq!(found_shot.payload, ArtifactPayload::Screenshot(ImageData::Staged));
        assert_eq!(store.read(found_shot).unwrap(), vec![1, 2, 3]);
        let found_log = recovered.iter().find(|a| a.id == log.id).unwrap();
        assert_eq!(found_log, &log);
    }

    #[test]
    fn test_recover_cleans_partial_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        std::fs::write(dir.path().join("screenshot_x.png.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("screenshot_orphan.png"), b"body").unwrap();

        assert!(store.recover().unwrap().is_empty());
        assert!(!dir.path().join("screenshot_x.png.tmp").exists());
        assert!(store.failed_dir().join("screenshot_orphan.png").exists());
    }

    #[test]
    fn test_scan_leaves_in_progress_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let clock = Clock::system();
        let artifact = Artifact::screenshot(vec![5; 32], &clock);
        store.stage(&artifact).unwrap();
        std::fs::write(dir.path().join("screenshot_y.png.tmp"), b"writing").unwrap();

        let staged = store.scan().unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].id, artifact.id);
        assert!(dir.path().join("screenshot_y.png.tmp").exists());
    }

    #[test]
    fn test_restage_after_release_keeps_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let clock = Clock::system();
        let artifact = Artifact::screenshot(vec![4, 4], &clock);
        store.stage(&artifact).unwrap();

        let mut released = artifact.clone().into_staged();
        released.attempts = 2;
        store.stage(&released).unwrap();
        assert_eq!(store.read(&released).unwrap(), vec![4, 4]);

        store.remove(&released).unwrap();
        assert!(matches!(store.stage(&released), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_quarantine_moves_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let clock = Clock::system();
        let artifact = log_artifact(&clock);
        store.stage(&artifact).unwrap();

        let target = store.quarantine(&artifact, "403 forbidden").unwrap();
        assert!(target.exists());
        assert!(!store.contains(&artifact));
        assert!(store.recover().unwrap().is_empty());

        let meta = std::fs::read_to_string(
            store
                .failed_dir()
                .join(format!("{}{META_SUFFIX}", artifact.file_name())),
        )
        .unwrap();
        assert!(meta.contains("403 forbidden"));
    }

    #[test]
    fn test_pending_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let clock = Clock::system();
        let artifact = Artifact::screenshot(vec![0; 16], &clock);
        store.stage(&artifact).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, artifact.id);
        assert_eq!(pending[0].size_bytes, 16);
    }
}
