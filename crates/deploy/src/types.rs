//! Data model shared by the orchestrator components.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use derive_more::{Deref, DerefMut, From};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::DeployError;

/// Where the control plane reads an infrastructure template from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    /// A template file on the local filesystem, sent as the template body.
    File(PathBuf),
    /// A template already hosted where the control plane can fetch it.
    Url(Url),
}

impl fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateSource::File(path) => write!(f, "{}", path.display()),
            TemplateSource::Url(url) => write!(f, "{}", url),
        }
    }
}

/// A deployable unit for one stage.
///
/// Built by the caller before each deployment and never mutated while it is
/// being applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDescriptor {
    /// Stack name, unique per stage.
    pub name: String,
    /// Reference to the infrastructure template.
    pub template: TemplateSource,
    /// Template parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Flags the control plane requires the caller to acknowledge.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Identity the control plane assumes while applying the template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_role: Option<String>,
}

impl StackDescriptor {
    pub fn new(name: impl Into<String>, template: TemplateSource) -> Self {
        Self {
            name: name.into(),
            template,
            parameters: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            execution_role: None,
        }
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn execution_role(mut self, role: impl Into<String>) -> Self {
        self.execution_role = Some(role.into());
        self
    }
}

/// Kind of stack operation being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StackOperation {
    Create,
    Update,
    Delete,
}

/// The orchestrator's classification of a stack's control-plane status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    RolledBack,
    NotFound,
}

impl StackStatus {
    /// Classify a raw control-plane status string against the operation
    /// being waited on.
    ///
    /// `{OP}_COMPLETE` is success. `{OP}_FAILED`, `ROLLBACK_FAILED` and any
    /// other `*_FAILED` are failures. `ROLLBACK_COMPLETE` and
    /// `{OP}_ROLLBACK_COMPLETE` mean the control plane undid the operation.
    /// A `*_COMPLETE` for a different operation means the requested one has
    /// not been picked up yet.
    pub fn classify(raw: &str, operation: StackOperation) -> Self {
        let op = operation.to_string();

        if raw == format!("{op}_COMPLETE") {
            StackStatus::Complete
        } else if raw == "ROLLBACK_COMPLETE" || raw == format!("{op}_ROLLBACK_COMPLETE") {
            StackStatus::RolledBack
        } else if raw.ends_with("_FAILED") {
            StackStatus::Failed
        } else if raw.ends_with("_IN_PROGRESS") {
            StackStatus::InProgress
        } else {
            StackStatus::Pending
        }
    }

    /// Classify a status observed outside of any operation we started.
    pub fn observed(raw: &str) -> Self {
        if raw.ends_with("ROLLBACK_COMPLETE") {
            StackStatus::RolledBack
        } else if raw.ends_with("_FAILED") {
            StackStatus::Failed
        } else if raw.ends_with("_IN_PROGRESS") {
            StackStatus::InProgress
        } else if raw == "DELETE_COMPLETE" {
            StackStatus::NotFound
        } else if raw.ends_with("_COMPLETE") {
            StackStatus::Complete
        } else {
            StackStatus::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StackStatus::Complete
                | StackStatus::Failed
                | StackStatus::RolledBack
                | StackStatus::NotFound
        )
    }
}

/// Named outputs published by a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, DerefMut, From)]
#[serde(transparent)]
pub struct StackOutputs(BTreeMap<String, String>);

impl StackOutputs {
    /// Look up an output the caller cannot proceed without.
    ///
    /// A missing or empty value means the deployed template predates the
    /// feature that publishes it.
    pub fn require(&self, key: &str) -> Result<&str, DeployError> {
        match self.0.get(key).map(String::as_str) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(DeployError::Configuration(format!(
                "stack did not publish required output `{key}`"
            ))),
        }
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl FromIterator<(String, String)> for StackOutputs {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A stack as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStack {
    pub name: String,
    /// Raw status string, e.g. `UPDATE_IN_PROGRESS`.
    pub status: String,
    #[serde(default)]
    pub outputs: StackOutputs,
}

/// One entry of a stack's event log, most recent first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEvent {
    pub resource_status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Outcome of an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Started,
    /// The control plane found nothing to change.
    NoChanges,
}

/// The orchestrator's view of a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackState {
    pub name: String,
    pub status: StackStatus,
    /// Populated only when `status` is `Complete`.
    pub outputs: StackOutputs,
    /// Present only on `Failed` or `RolledBack`.
    pub failure_reason: Option<String>,
}

impl StackState {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StackStatus::NotFound,
            outputs: StackOutputs::default(),
            failure_reason: None,
        }
    }

    pub fn complete(name: impl Into<String>, outputs: StackOutputs) -> Self {
        Self {
            name: name.into(),
            status: StackStatus::Complete,
            outputs,
            failure_reason: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == StackStatus::Complete
    }
}

/// Short-lived credentials scoped to one deployment target.
///
/// Never persisted. `Debug` redacts everything but the access key id.
#[derive(Clone, PartialEq, Eq)]
pub struct ScopedCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl ScopedCredentials {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for ScopedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One page of an object listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(
            StackStatus::classify("CREATE_COMPLETE", StackOperation::Create),
            StackStatus::Complete
        );
        assert_eq!(
            StackStatus::classify("UPDATE_COMPLETE", StackOperation::Update),
            StackStatus::Complete
        );
        assert_eq!(
            StackStatus::classify("DELETE_COMPLETE", StackOperation::Delete),
            StackStatus::Complete
        );
    }

    #[test]
    fn test_classify_failures() {
        assert_eq!(
            StackStatus::classify("CREATE_FAILED", StackOperation::Create),
            StackStatus::Failed
        );
        assert_eq!(
            StackStatus::classify("ROLLBACK_FAILED", StackOperation::Create),
            StackStatus::Failed
        );
        assert_eq!(
            StackStatus::classify("ROLLBACK_COMPLETE", StackOperation::Create),
            StackStatus::RolledBack
        );
        assert_eq!(
            StackStatus::classify("UPDATE_ROLLBACK_COMPLETE", StackOperation::Update),
            StackStatus::RolledBack
        );
        assert_eq!(
            StackStatus::classify("DELETE_FAILED", StackOperation::Delete),
            StackStatus::Failed
        );
    }

    #[test]
    fn test_classify_in_flight() {
        assert_eq!(
            StackStatus::classify("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS", StackOperation::Update),
            StackStatus::InProgress
        );
        // Update not picked up yet: the previous create is still the latest status.
        assert_eq!(
            StackStatus::classify("CREATE_COMPLETE", StackOperation::Update),
            StackStatus::Pending
        );
        assert_eq!(
            StackStatus::classify("REVIEW_IN_PROGRESS", StackOperation::Create),
            StackStatus::InProgress
        );
    }

    #[test]
    fn test_observed_status() {
        assert_eq!(StackStatus::observed("UPDATE_COMPLETE"), StackStatus::Complete);
        assert_eq!(
            StackStatus::observed("UPDATE_ROLLBACK_COMPLETE"),
            StackStatus::RolledBack
        );
        assert_eq!(StackStatus::observed("DELETE_COMPLETE"), StackStatus::NotFound);
        assert!(!StackStatus::observed("CREATE_IN_PROGRESS").is_terminal());
    }

    #[test]
    fn test_require_output() {
        let outputs: StackOutputs = [
            ("BucketName".to_string(), "site-dev-assets".to_string()),
            ("DeployRoleArn".to_string(), String::new()),
        ]
        .into_iter()
        .collect();

        assert_eq!(outputs.require("BucketName").unwrap(), "site-dev-assets");
        assert!(matches!(
            outputs.require("DeployRoleArn"),
            Err(DeployError::Configuration(_))
        ));
        assert!(matches!(
            outputs.require("DistributionId"),
            Err(DeployError::Configuration(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = ScopedCredentials {
            access_key: "AKIAEXAMPLE".to_string(),
            secret_key: "super-secret".to_string(),
            session_token: "token-value".to_string(),
            expires_at: Utc::now(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("token-value"));
    }

    #[test]
    fn test_credentials_expiry() {
        let now = Utc::now();
        let creds = ScopedCredentials {
            access_key: "a".into(),
            secret_key: "b".into(),
            session_token: "c".into(),
            expires_at: now + chrono::Duration::seconds(60),
        };
        assert!(!creds.is_expired_at(now));
        assert!(creds.is_expired_at(now + chrono::Duration::seconds(60)));
    }
}
