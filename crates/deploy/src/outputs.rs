//! Persisted stack outputs, one JSON document per deployable unit keyed by
//! stage.
//!
//! Tooling reads these records to find a stage's bucket or distribution
//! without querying the control plane. The orchestrator itself never trusts a
//! record for destructive work: it always acts on a live stack read.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{DeployError, types::StackOutputs};

/// Outputs of one stage of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutputs {
    pub outputs: StackOutputs,
    /// RFC 3339 timestamp of the last write.
    pub last_updated: String,
    /// Fingerprint of the descriptor that produced these outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Every stage recorded for a unit.
pub type OutputsRecord = BTreeMap<String, DeploymentOutputs>;

/// JSON-file store for [`DeploymentOutputs`].
///
/// Read-modify-write cycles hold an exclusive advisory lock on a sibling
/// `.lock` file, and the document is replaced through a rename so a crash
/// never leaves it half written.
#[derive(Debug, Clone)]
pub struct OutputsStore {
    path: PathBuf,
}

impl OutputsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stage. A missing or unparsable document reads as empty.
    pub fn load(&self) -> OutputsRecord {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return OutputsRecord::new(),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read outputs file, starting fresh"
                );
                return OutputsRecord::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Outputs file is corrupt, starting fresh"
                );
                OutputsRecord::new()
            }
        }
    }

    pub fn get(&self, stage: &str) -> Option<DeploymentOutputs> {
        self.load().remove(stage)
    }

    /// Replace the record of `stage`, leaving other stages untouched.
    pub fn save(
        &self,
        stage: &str,
        outputs: StackOutputs,
        fingerprint: Option<String>,
    ) -> Result<(), DeployError> {
        let _lock = self.lock()?;

        let mut record = self.load();
        record.insert(
            stage.to_string(),
            DeploymentOutputs {
                outputs,
                last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                fingerprint,
            },
        );
        self.write(&record)?;

        tracing::debug!(path = %self.path.display(), stage, "Outputs saved");
        Ok(())
    }

    /// Drop the record of `stage`. Returns whether one existed.
    pub fn remove(&self, stage: &str) -> Result<bool, DeployError> {
        let _lock = self.lock()?;

        let mut record = self.load();
        if record.remove(stage).is_none() {
            return Ok(false);
        }
        self.write(&record)?;

        tracing::debug!(path = %self.path.display(), stage, "Outputs removed");
        Ok(true)
    }

    fn write(&self, record: &OutputsRecord) -> Result<(), DeployError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> Result<LockGuard, DeployError> {
        let lock_path = self.path.with_extension("lock");
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&lock_path)?;
        file.lock_exclusive()?;
        Ok(LockGuard { file })
    }
}

/// Releases the advisory lock when dropped.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
