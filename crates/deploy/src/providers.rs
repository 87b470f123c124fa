//! Boundary collaborators the orchestrator calls.
//!
//! Each trait covers one remote service. The orchestrator holds no knowledge of
//! transports or vendors; an implementation may be a cloud SDK, the
//! [`HttpGateway`](crate::HttpGateway), or the in-memory
//! [`FakeCloud`](crate::fake::FakeCloud) used in tests.

use std::future::Future;

use crate::{
    ProviderError,
    types::{ObjectPage, RemoteStack, ScopedCredentials, StackDescriptor, StackEvent, UpdateOutcome},
};

/// Declarative infrastructure control plane.
pub trait ControlPlane: Send + Sync {
    /// Read a stack. `None` when no stack with this name exists.
    fn describe_stack(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<RemoteStack>, ProviderError>> + Send;

    fn create_stack(
        &self,
        descriptor: &StackDescriptor,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Request an update. "Nothing to change" is reported as
    /// [`UpdateOutcome::NoChanges`], not as an error.
    fn update_stack(
        &self,
        descriptor: &StackDescriptor,
    ) -> impl Future<Output = Result<UpdateOutcome, ProviderError>> + Send;

    fn delete_stack(&self, name: &str) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Event log of a stack, most recent first.
    fn list_stack_events(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<StackEvent>, ProviderError>> + Send;
}

/// Exchanges the caller's identity for scoped credentials.
pub trait IdentityBroker: Send + Sync {
    fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        external_id: &str,
        duration_secs: u32,
    ) -> impl Future<Output = Result<ScopedCredentials, ProviderError>> + Send;
}

/// Remote object storage holding the built site assets.
pub trait ObjectStore: Send + Sync {
    fn put_object(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    fn delete_object(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// List one page of keys, continuing from `continuation_token`.
    fn list_objects(
        &self,
        credentials: &ScopedCredentials,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> impl Future<Output = Result<ObjectPage, ProviderError>> + Send;
}

/// Downstream cache in front of the object store.
pub trait CacheDistribution: Send + Sync {
    /// Request invalidation of `paths`; returns the invalidation id.
    fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;

    /// Current status of an invalidation, e.g. `InProgress` or `Completed`.
    fn get_invalidation(
        &self,
        distribution_id: &str,
        invalidation_id: &str,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

/// Everything the pipeline needs from the outside world.
pub trait CloudBackend: ControlPlane + IdentityBroker + ObjectStore + CacheDistribution {}

impl<T> CloudBackend for T where
    T: ControlPlane + IdentityBroker + ObjectStore + CacheDistribution
{
}
