//! stackdrop-deploy - Deployment orchestration for declarative stacks and
//! their static assets.
//!
//! For every target of a stage the pipeline applies an infrastructure stack,
//! acquires credentials scoped to it, mirrors a local build output into the
//! stack's bucket and invalidates the cache in front of it. Remote services
//! are reached through the traits in [`providers`]; [`HttpGateway`] talks to a
//! JSON-RPC gateway and [`fake::FakeCloud`] keeps everything in memory.

mod error;
pub use error::{DeployError, ProviderError};

pub mod types;

mod providers;
pub use providers::{CacheDistribution, CloudBackend, ControlPlane, IdentityBroker, ObjectStore};

mod poll;
pub use poll::{Cancellation, Poller};

mod stack;
pub use stack::StackManager;

pub mod credentials;
pub use credentials::CredentialBroker;

pub mod assets;
pub use assets::{AssetManifest, AssetSyncEngine, SyncReport};

pub mod invalidation;
pub use invalidation::{CacheInvalidator, InvalidationOutcome};

mod fingerprint;
pub use fingerprint::descriptor_fingerprint;

pub mod outputs;
pub use outputs::{DeploymentOutputs, OutputsStore};

pub mod pipeline;
pub use pipeline::{
    AssetTarget, DeployTarget, DeploymentPipeline, PipelineReport, PipelineSettings,
    ProgressReporter, RecordingReporter, TargetReport, TargetState, TracingReporter,
};

pub mod config;
pub use config::DeployConfig;

pub mod gateway;
pub use gateway::HttpGateway;

pub mod fake;
