//! In-memory [`CloudBackend`](crate::CloudBackend) for tests and dry runs.
//!
//! Stacks settle one read after each operation: the first describe after a
//! create, update or delete reports the in-progress status, the next one the
//! outcome. Everything is scripted through the `set_*`/`seed_*` helpers and
//! every boundary call is recorded in order.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Mutex, MutexGuard},
};

use chrono::Utc;

use crate::{
    CacheDistribution, Cancellation, ControlPlane, IdentityBroker, ObjectStore, ProviderError,
    types::{
        ObjectPage, RemoteStack, ScopedCredentials, StackDescriptor, StackEvent, StackOutputs,
        StackStatus, UpdateOutcome,
    },
};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// How a scripted stack reacts to create and update requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FakeStackBehavior {
    #[default]
    Succeed,
    /// The operation fails on a resource with `reason` and is rolled back.
    Fail { reason: String },
    /// The operation never leaves its in-progress status.
    Stuck,
}

/// One recorded boundary call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub op: &'static str,
    /// Stack, bucket/key, role or distribution the call addressed.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedSession {
    pub role: String,
    pub session_name: String,
    pub external_id: String,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRequest {
    pub id: String,
    pub distribution_id: String,
    pub paths: Vec<String>,
    pub caller_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

enum Step {
    Status(String),
    Settle { status: String, outputs: StackOutputs },
    Remove,
}

struct FakeStack {
    status: String,
    outputs: StackOutputs,
    descriptor: Option<StackDescriptor>,
    pending: VecDeque<Step>,
}

#[derive(Default)]
struct State {
    stacks: BTreeMap<String, FakeStack>,
    events: BTreeMap<String, Vec<StackEvent>>,
    behaviors: BTreeMap<String, FakeStackBehavior>,
    template_outputs: BTreeMap<String, StackOutputs>,
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    failing_uploads: BTreeSet<String>,
    cancel_on_upload: BTreeMap<String, Cancellation>,
    untrusted_roles: BTreeSet<String>,
    sessions: Vec<AssumedSession>,
    invalidations: Vec<InvalidationRequest>,
    stall_invalidations: bool,
    invalidation_read_error: Option<ProviderError>,
    calls: Vec<FakeCall>,
}

/// Scriptable stand-in for every remote collaborator.
pub struct FakeCloud {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Cap listing pages at `page_size` keys.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(state: &mut State, op: &'static str, target: impl Into<String>) {
        state.calls.push(FakeCall {
            op,
            target: target.into(),
        });
    }

    // Stacks

    /// Outputs the stack `name` publishes once an operation completes,
    /// replacing the defaults.
    pub fn set_template_outputs<K, V>(&self, name: &str, outputs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let outputs = outputs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.state().template_outputs.insert(name.to_string(), outputs);
    }

    pub fn set_behavior(&self, name: &str, behavior: FakeStackBehavior) {
        self.state().behaviors.insert(name.to_string(), behavior);
    }

    /// Put a stack straight into `raw_status`, as if deployed out of band.
    pub fn insert_stack(&self, name: &str, raw_status: &str) {
        let mut state = self.state();
        let outputs = if StackStatus::observed(raw_status) == StackStatus::Complete {
            template_outputs(&state, name)
        } else {
            StackOutputs::default()
        };
        state.stacks.insert(
            name.to_string(),
            FakeStack {
                status: raw_status.to_string(),
                outputs,
                descriptor: None,
                pending: VecDeque::new(),
            },
        );
    }

    pub fn push_event(&self, name: &str, resource_status: &str, reason: Option<&str>) {
        push_event(&mut self.state(), name, resource_status, reason);
    }

    /// Current raw status without advancing the script.
    pub fn stack_status(&self, name: &str) -> Option<String> {
        self.state().stacks.get(name).map(|s| s.status.clone())
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn calls_named(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    // Identity

    pub fn untrust_role(&self, role: &str) {
        self.state().untrusted_roles.insert(role.to_string());
    }

    pub fn assumed_sessions(&self) -> Vec<AssumedSession> {
        self.state().sessions.clone()
    }

    // Objects

    pub fn seed_objects<I>(&self, bucket: &str, keys: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut state = self.state();
        let objects = state.buckets.entry(bucket.to_string()).or_default();
        for key in keys {
            let key = key.into();
            objects.insert(
                key.clone(),
                StoredObject {
                    body: key.into_bytes(),
                    content_type: "application/octet-stream".to_string(),
                },
            );
        }
    }

    pub fn object_keys(&self, bucket: &str) -> BTreeSet<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state().buckets.get(bucket)?.get(key).cloned()
    }

    /// Make every upload of `key` fail.
    pub fn fail_upload(&self, key: &str) {
        self.state().failing_uploads.insert(key.to_string());
    }

    /// Trip `cancel` once `key` has been stored, as an interrupt arriving
    /// mid-upload would.
    pub fn cancel_on_upload(&self, key: &str, cancel: Cancellation) {
        self.state().cancel_on_upload.insert(key.to_string(), cancel);
    }

    // Invalidations

    pub fn invalidation_requests(&self) -> Vec<InvalidationRequest> {
        self.state().invalidations.clone()
    }

    /// Answer every invalidation status read with `error`.
    pub fn fail_invalidation_reads(&self, error: ProviderError) {
        self.state().invalidation_read_error = Some(error);
    }

    /// Keep every invalidation in progress forever.
    pub fn stall_invalidations(&self) {
        self.state().stall_invalidations = true;
    }
}

fn template_outputs(state: &State, name: &str) -> StackOutputs {
    state.template_outputs.get(name).cloned().unwrap_or_else(|| {
        [
            ("BucketName", format!("{name}-assets")),
            ("DeployRoleArn", format!("role/{name}-deployer")),
            ("DistributionId", format!("dist-{name}")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    })
}

fn push_event(state: &mut State, name: &str, resource_status: &str, reason: Option<&str>) {
    state.events.entry(name.to_string()).or_default().insert(
        0,
        StackEvent {
            resource_status: resource_status.to_string(),
            reason: reason.map(str::to_string),
        },
    );
}

/// Script the steps following a create or update of `name`.
fn script(state: &mut State, name: &str, op: &str) -> VecDeque<Step> {
    let behavior = state.behaviors.get(name).cloned().unwrap_or_default();
    push_event(state, name, &format!("{op}_IN_PROGRESS"), None);

    match behavior {
        FakeStackBehavior::Succeed => VecDeque::from([Step::Settle {
            status: format!("{op}_COMPLETE"),
            outputs: template_outputs(state, name),
        }]),
        FakeStackBehavior::Fail { reason } => {
            push_event(state, name, &format!("{op}_FAILED"), Some(&reason));
            let rolled_back = if op == "CREATE" {
                "ROLLBACK_COMPLETE".to_string()
            } else {
                format!("{op}_ROLLBACK_COMPLETE")
            };
            VecDeque::from([
                Step::Status(format!("{op}_ROLLBACK_IN_PROGRESS").replace("CREATE_", "")),
                Step::Settle {
                    status: rolled_back,
                    outputs: StackOutputs::default(),
                },
            ])
        }
        FakeStackBehavior::Stuck => VecDeque::new(),
    }
}

impl ControlPlane for FakeCloud {
    async fn describe_stack(&self, name: &str) -> Result<Option<RemoteStack>, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "describe_stack", name);

        let Some(stack) = state.stacks.get_mut(name) else {
            return Ok(None);
        };
        let snapshot = RemoteStack {
            name: name.to_string(),
            status: stack.status.clone(),
            outputs: stack.outputs.clone(),
        };

        let removed = match stack.pending.pop_front() {
            Some(Step::Status(status)) => {
                stack.status = status;
                false
            }
            Some(Step::Settle { status, outputs }) => {
                stack.status = status;
                stack.outputs = outputs;
                false
            }
            Some(Step::Remove) => true,
            None => false,
        };
        if removed {
            state.stacks.remove(name);
        }

        Ok(Some(snapshot))
    }

    async fn create_stack(&self, descriptor: &StackDescriptor) -> Result<(), ProviderError> {
        let mut state = self.state();
        let name = descriptor.name.as_str();
        Self::record(&mut state, "create_stack", name);

        if state.stacks.contains_key(name) {
            return Err(ProviderError::Request(format!("stack {name} already exists")));
        }

        let pending = script(&mut state, name, "CREATE");
        state.stacks.insert(
            name.to_string(),
            FakeStack {
                status: "CREATE_IN_PROGRESS".to_string(),
                outputs: StackOutputs::default(),
                descriptor: Some(descriptor.clone()),
                pending,
            },
        );
        Ok(())
    }

    async fn update_stack(
        &self,
        descriptor: &StackDescriptor,
    ) -> Result<UpdateOutcome, ProviderError> {
        let mut state = self.state();
        let name = descriptor.name.as_str();
        Self::record(&mut state, "update_stack", name);

        let Some(stack) = state.stacks.get(name) else {
            return Err(ProviderError::Request(format!("stack {name} does not exist")));
        };
        if !stack.pending.is_empty() || stack.status.ends_with("_IN_PROGRESS") {
            return Err(ProviderError::Request(format!(
                "stack {name} is in {} state and can not be updated",
                stack.status
            )));
        }
        if stack.status == "ROLLBACK_COMPLETE" {
            return Err(ProviderError::Request(format!(
                "stack {name} is in ROLLBACK_COMPLETE state and can not be updated"
            )));
        }
        if stack.descriptor.as_ref() == Some(descriptor) {
            return Ok(UpdateOutcome::NoChanges);
        }

        let pending = script(&mut state, name, "UPDATE");
        if let Some(stack) = state.stacks.get_mut(name) {
            stack.status = "UPDATE_IN_PROGRESS".to_string();
            stack.descriptor = Some(descriptor.clone());
            stack.pending = pending;
        }
        Ok(UpdateOutcome::Started)
    }

    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "delete_stack", name);

        let stuck = state.behaviors.get(name) == Some(&FakeStackBehavior::Stuck);
        push_event(&mut state, name, "DELETE_IN_PROGRESS", None);
        if let Some(stack) = state.stacks.get_mut(name) {
            stack.status = "DELETE_IN_PROGRESS".to_string();
            stack.outputs = StackOutputs::default();
            stack.pending = if stuck {
                VecDeque::new()
            } else {
                VecDeque::from([Step::Remove])
            };
        }
        Ok(())
    }

    async fn list_stack_events(&self, name: &str) -> Result<Vec<StackEvent>, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "list_stack_events", name);
        Ok(state.events.get(name).cloned().unwrap_or_default())
    }
}

impl IdentityBroker for FakeCloud {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        external_id: &str,
        duration_secs: u32,
    ) -> Result<ScopedCredentials, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "assume_role", role_arn);

        if state.untrusted_roles.contains(role_arn) {
            return Err(ProviderError::AccessDenied(format!(
                "caller is not trusted by {role_arn}"
            )));
        }

        state.sessions.push(AssumedSession {
            role: role_arn.to_string(),
            session_name: session_name.to_string(),
            external_id: external_id.to_string(),
            duration_secs,
        });
        let n = state.sessions.len();

        Ok(ScopedCredentials {
            access_key: format!("FAKEACCESSKEY{n}"),
            secret_key: format!("fake-secret-{n}"),
            session_token: format!("fake-token-{n}"),
            expires_at: Utc::now() + chrono::Duration::seconds(i64::from(duration_secs)),
        })
    }
}

fn authorize(credentials: &ScopedCredentials) -> Result<(), ProviderError> {
    if credentials.is_expired() {
        return Err(ProviderError::AccessDenied(
            "the security token included in the request is expired".to_string(),
        ));
    }
    Ok(())
}

impl ObjectStore for FakeCloud {
    async fn put_object(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "put_object", format!("{bucket}/{key}"));
        authorize(credentials)?;

        if state.failing_uploads.contains(key) {
            return Err(ProviderError::Request(format!("upload of {key} rejected")));
        }

        state.buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        if let Some(cancel) = state.cancel_on_upload.get(key) {
            cancel.cancel();
        }
        Ok(())
    }

    async fn delete_object(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "delete_object", format!("{bucket}/{key}"));
        authorize(credentials)?;

        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> Result<ObjectPage, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "list_objects", bucket);
        authorize(credentials)?;

        let start = match continuation_token {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                ProviderError::Request(format!("invalid continuation token {token}"))
            })?,
        };

        let keys: Vec<String> = state
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .keys()
                    .skip(start)
                    .take(self.page_size + 1)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let next_token =
            (keys.len() > self.page_size).then(|| (start + self.page_size).to_string());
        Ok(ObjectPage {
            keys: keys.into_iter().take(self.page_size).collect(),
            next_token,
        })
    }
}

impl CacheDistribution for FakeCloud {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> Result<String, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "create_invalidation", distribution_id);

        let id = format!("I{}", state.invalidations.len() + 1);
        state.invalidations.push(InvalidationRequest {
            id: id.clone(),
            distribution_id: distribution_id.to_string(),
            paths: paths.to_vec(),
            caller_reference: caller_reference.to_string(),
        });
        Ok(id)
    }

    async fn get_invalidation(
        &self,
        distribution_id: &str,
        invalidation_id: &str,
    ) -> Result<String, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "get_invalidation", distribution_id);

        if let Some(error) = &state.invalidation_read_error {
            return Err(error.clone());
        }

        if !state.invalidations.iter().any(|i| i.id == invalidation_id) {
            return Err(ProviderError::Request(format!(
                "no invalidation {invalidation_id} on {distribution_id}"
            )));
        }

        Ok(if state.stall_invalidations {
            "InProgress".to_string()
        } else {
            "Completed".to_string()
        })
    }
}
