//! Versioned artifact store with an append-only audit log.
//!
//! Layout under the root directory:
//!
//! ```text
//! model_v{N}.json   one file per published artifact
//! current.json      {"version": N, "updated_at": ...}
//! audit.jsonl       one AuditRecord per line
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ModelArtifact;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Published,
    Rejected,
    Reverted,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub version: u64,
    pub previous: Option<u64>,
    pub validation_score: Option<f64>,
    pub checksum: Option<String>,
    pub reason: Option<String>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, artifact: &ModelArtifact, previous: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            action,
            version: artifact.version,
            previous,
            validation_score: artifact.validation_score,
            checksum: Some(artifact.checksum()),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, version: u64) -> PathBuf {
        self.root.join(format!("model_v{version}.json"))
    }

    pub fn save(&self, artifact: &ModelArtifact) -> Result<(), StoreError> {
        let path = self.artifact_path(artifact.version);
        write_atomic(&path, &serde_json::to_vec_pretty(artifact)?)
    }

    pub fn load(&self, version: u64) -> Result<Option<ModelArtifact>, StoreError> {
        let path = self.artifact_path(version);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| io(&path, e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Saved artifact versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| io(&self.root, e))? {
            let entry = entry.map_err(|e| io(&self.root, e))?;
            let name = entry.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix("model_v"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(v) = version {
                out.push(v);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Delete every saved artifact not in `keep`. The current version is
    /// never deleted. Returns the removed versions.
    pub fn prune(&self, keep: &[u64]) -> Result<Vec<u64>, StoreError> {
        let current = self.current_version()?;
        let mut removed = Vec::new();
        for v in self.versions()? {
            if keep.contains(&v) || current == Some(v) {
                continue;
            }
            let path = self.artifact_path(v);
            fs::remove_file(&path).map_err(|e| io(&path, e))?;
            removed.push(v);
        }
        Ok(removed)
    }

    pub fn set_current(&self, version: u64) -> Result<(), StoreError> {
        let ptr = CurrentPointer { version, updated_at: Utc::now() };
        write_atomic(&self.root.join("current.json"), &serde_json::to_vec(&ptr)?)
    }

    pub fn current_version(&self) -> Result<Option<u64>, StoreError> {
        let path = self.root.join("current.json");
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| io(&path, e))?;
        let ptr: CurrentPointer = serde_json::from_slice(&bytes)?;
        Ok(Some(ptr.version))
    }

    pub fn audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let path = self.root.join("audit.jsonl");
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io(&path, e))?;
        f.write_all(line.as_bytes()).map_err(|e| io(&path, e))
    }

    pub fn audit_log(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let path = self.root.join("audit.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).map_err(|e| io(&path, e))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StoreError::from))
            .collect()
    }
}

fn io(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io { path: path.display().to_string(), source }
}

/// Write to a sibling temp file then rename, so readers never see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(|e| io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> ArtifactStore {
        ArtifactStore::open(std::env::temp_dir().join(format!("edge-store-{}", uuid::Uuid::new_v4()))).unwrap()
    }

    fn artifact(version: u64) -> ModelArtifact {
        let mut a = ModelArtifact::bootstrap();
        a.version = version;
        a.validation_score = Some(0.7);
        a
    }

    #[test]
    fn test_save_load_and_pointer() {
        let s = temp_store();
        assert_eq!(s.current_version().unwrap(), None);
        s.save(&artifact(3)).unwrap();
        s.save(&artifact(1)).unwrap();
        s.set_current(3).unwrap();
        assert_eq!(s.versions().unwrap(), vec![1, 3]);
        assert_eq!(s.current_version().unwrap(), Some(3));
        assert_eq!(s.load(3).unwrap().unwrap().version, 3);
        assert!(s.load(2).unwrap().is_none());
        let _ = fs::remove_dir_all(s.root());
    }

    #[test]
    fn test_audit_log_appends() {
        let s = temp_store();
        let a = artifact(2);
        s.audit(&AuditRecord::new(AuditAction::Published, &a, Some(1))).unwrap();
        s.audit(&AuditRecord::new(AuditAction::Reverted, &a, Some(1)).with_reason("3 failures")).unwrap();
        let log = s.audit_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, AuditAction::Published);
        assert_eq!(log[1].reason.as_deref(), Some("3 failures"));
        assert_eq!(log[0].checksum, Some(a.checksum()));
        let _ = fs::remove_dir_all(s.root());
    }

    #[test]
    fn test_prune_keeps_listed_and_current() {
        let s = temp_store();
        for v in 1..=5 {
            s.save(&artifact(v)).unwrap();
        }
        s.set_current(2).unwrap();
        let removed = s.prune(&[4, 5]).unwrap();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(s.versions().unwrap(), vec![2, 4, 5]);
        assert!(s.prune(&[]).unwrap().len() == 2);
        assert_eq!(s.versions().unwrap(), vec![2]);
        let _ = fs::remove_dir_all(s.root());
    }
}
