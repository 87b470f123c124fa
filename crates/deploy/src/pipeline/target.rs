//! Deployment targets and their per-run state.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    DeployError, InvalidationOutcome, OutputsStore, SyncReport,
    invalidation::INVALIDATE_ALL,
    types::{StackDescriptor, StackOutputs},
};

/// Default output keys published by site templates.
pub const DEFAULT_BUCKET_OUTPUT: &str = "BucketName";
pub const DEFAULT_ROLE_OUTPUT: &str = "DeployRoleArn";
pub const DEFAULT_DISTRIBUTION_OUTPUT: &str = "DistributionId";

/// Static assets published after a stack is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTarget {
    /// Local build output mirrored to the bucket.
    pub build_dir: PathBuf,
    /// Stack output holding the bucket name.
    #[serde(default = "default_bucket_output")]
    pub bucket_output: String,
    /// Stack output holding the role assumed for the upload.
    #[serde(default = "default_role_output")]
    pub role_output: String,
    /// Stack output holding the distribution id. No invalidation when unset.
    #[serde(default = "default_distribution_output")]
    pub distribution_output: Option<String>,
    #[serde(default = "default_invalidation_paths")]
    pub invalidation_paths: Vec<String>,
    /// Empty the bucket before the stack is removed.
    #[serde(default = "default_true")]
    pub purge_on_remove: bool,
}

impl AssetTarget {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            bucket_output: default_bucket_output(),
            role_output: default_role_output(),
            distribution_output: default_distribution_output(),
            invalidation_paths: default_invalidation_paths(),
            purge_on_remove: true,
        }
    }
}

fn default_bucket_output() -> String {
    DEFAULT_BUCKET_OUTPUT.to_string()
}

fn default_role_output() -> String {
    DEFAULT_ROLE_OUTPUT.to_string()
}

fn default_distribution_output() -> Option<String> {
    Some(DEFAULT_DISTRIBUTION_OUTPUT.to_string())
}

fn default_invalidation_paths() -> Vec<String> {
    vec![INVALIDATE_ALL.to_string()]
}

fn default_true() -> bool {
    true
}

/// One deployable unit resolved for a stage.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    /// Unit name, used in reports.
    pub name: String,
    pub stack: StackDescriptor,
    /// Where this unit's outputs are persisted.
    pub outputs: OutputsStore,
    pub assets: Option<AssetTarget>,
}

/// Position of a target in its pipeline run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetState {
    NotStarted,
    StackApplying,
    StackApplied,
    CredentialsAcquired,
    AssetsSyncing,
    AssetsSynced,
    CacheInvalidating,
    StackDestroying,
    Done,
    Failed,
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Done | TargetState::Failed)
    }
}

/// Outcome of one target.
#[derive(Debug)]
pub struct TargetReport {
    pub name: String,
    /// `Done` or `Failed`.
    pub state: TargetState,
    /// Last state reached before failing.
    pub failed_at: Option<TargetState>,
    pub error: Option<DeployError>,
    pub outputs: StackOutputs,
    pub sync: Option<SyncReport>,
    pub invalidation: Option<InvalidationOutcome>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl TargetReport {
    pub fn is_done(&self) -> bool {
        self.state == TargetState::Done
    }
}

/// Outcome of a batch, one entry per target in input order.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub targets: Vec<TargetReport>,
}

impl PipelineReport {
    /// True when every target reached `Done`.
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(TargetReport::is_done)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| t.state == TargetState::Failed)
    }

    pub fn get(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.name == name)
    }
}
