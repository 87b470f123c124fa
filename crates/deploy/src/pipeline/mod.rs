//! Deployment pipeline: sequences stack, credentials, assets and cache
//! invalidation per target, and isolates failures between targets.
//!
//! Each target walks a fixed state machine:
//!
//! ```text
//! NOT_STARTED -> STACK_APPLYING -> STACK_APPLIED -> CREDENTIALS_ACQUIRED
//!   -> ASSETS_SYNCING -> ASSETS_SYNCED -> CACHE_INVALIDATING -> DONE
//! ```
//!
//! with `FAILED` reachable from every non-terminal state. A failed target is
//! recorded in the [`PipelineReport`] and the batch moves on.

mod reporter;
mod target;

use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::time::Instant;

pub use reporter::{ProgressReporter, RecordingReporter, TracingReporter};
pub use target::{
    AssetTarget, DEFAULT_BUCKET_OUTPUT, DEFAULT_DISTRIBUTION_OUTPUT, DEFAULT_ROLE_OUTPUT,
    DeployTarget, PipelineReport, TargetReport, TargetState,
};

use crate::{
    AssetSyncEngine, CacheInvalidator, Cancellation, CloudBackend, CredentialBroker, DeployError,
    InvalidationOutcome, Poller, StackManager, SyncReport,
    credentials::DEFAULT_CREDENTIAL_DURATION_SECS,
    fingerprint::descriptor_fingerprint,
    types::{StackOutputs, StackState, StackStatus},
};

/// Knobs shared by every target of a run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Deployment stage, e.g. `dev` or `prod`.
    pub stage: String,
    /// Targets run at once. `1` runs the batch strictly in order.
    pub concurrency: usize,
    pub stack_poller: Poller,
    pub invalidation_poller: Poller,
    pub credential_duration_secs: u32,
}

impl PipelineSettings {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            concurrency: 1,
            stack_poller: Poller::new(Duration::from_secs(10), 120),
            invalidation_poller: Poller::new(Duration::from_secs(5), 60),
            credential_duration_secs: DEFAULT_CREDENTIAL_DURATION_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Deploy,
    Remove,
}

/// Orchestrates deployments against a [`CloudBackend`].
pub struct DeploymentPipeline<'a, B> {
    backend: &'a B,
    settings: PipelineSettings,
    reporter: &'a dyn ProgressReporter,
    cancel: Cancellation,
}

impl<'a, B: CloudBackend> DeploymentPipeline<'a, B> {
    pub fn new(
        backend: &'a B,
        settings: PipelineSettings,
        reporter: &'a dyn ProgressReporter,
        cancel: Cancellation,
    ) -> Self {
        Self {
            backend,
            settings,
            reporter,
            cancel,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Deploy every target. One target's failure never stops the others.
    pub async fn run(&self, targets: &[DeployTarget]) -> PipelineReport {
        self.run_batch(targets, Mode::Deploy).await
    }

    /// Tear every target down: empty its bucket, delete its stack and forget
    /// its persisted outputs.
    pub async fn remove(&self, targets: &[DeployTarget]) -> PipelineReport {
        self.run_batch(targets, Mode::Remove).await
    }

    async fn run_batch(&self, targets: &[DeployTarget], mode: Mode) -> PipelineReport {
        tracing::info!(
            stage = %self.settings.stage,
            targets = targets.len(),
            concurrency = self.settings.concurrency,
            ?mode,
            "Starting pipeline"
        );

        let reports = stream::iter(targets)
            .map(|target| self.run_target(target, mode))
            .buffered(self.settings.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let report = PipelineReport { targets: reports };
        tracing::info!(
            stage = %self.settings.stage,
            succeeded = report.targets.len() - report.failed().count(),
            failed = report.failed().count(),
            "Pipeline finished"
        );
        report
    }

    async fn run_target(&self, target: &DeployTarget, mode: Mode) -> TargetReport {
        let mut progress = Progress::new(&target.name, self.reporter);

        let result = match self.cancel.check() {
            Err(e) => Err(e),
            Ok(()) => match mode {
                Mode::Deploy => self.deploy_target(target, &mut progress).await,
                Mode::Remove => self.remove_target(target, &mut progress).await,
            },
        };

        progress.finish(result)
    }

    async fn deploy_target(
        &self,
        target: &DeployTarget,
        progress: &mut Progress<'_>,
    ) -> Result<(), DeployError> {
        let stage = self.settings.stage.as_str();

        progress.enter(TargetState::StackApplying);
        let state = self.stack_manager().apply(&target.stack).await?;
        progress.outputs = state.outputs.clone();
        progress.enter(TargetState::StackApplied);

        target.outputs.save(
            stage,
            state.outputs.clone(),
            Some(descriptor_fingerprint(&target.stack)),
        )?;

        let Some(assets) = &target.assets else {
            return Ok(());
        };

        let bucket = state.outputs.require(&assets.bucket_output)?;
        let distribution = match assets
            .distribution_output
            .as_deref()
            .filter(|k| !k.is_empty())
        {
            Some(key) => Some(state.outputs.require(key)?),
            None => None,
        };

        {
            let credentials = self
                .credential_broker()
                .assume_from_stack(&state, &assets.role_output, &session_context(&state))
                .await?;
            progress.enter(TargetState::CredentialsAcquired);

            progress.enter(TargetState::AssetsSyncing);
            let sync = self
                .sync_engine()
                .sync(&assets.build_dir, bucket, &credentials)
                .await?;
            progress.sync = Some(sync);
            progress.enter(TargetState::AssetsSynced);
        }

        if let Some(distribution) = distribution {
            progress.enter(TargetState::CacheInvalidating);
            let outcome = CacheInvalidator::new(
                self.backend,
                self.settings.invalidation_poller,
                self.cancel.clone(),
            )
            .invalidate(distribution, &assets.invalidation_paths)
            .await?;

            if !outcome.is_confirmed() {
                progress.warn(format!(
                    "cache invalidation on {distribution} not confirmed within {:?}",
                    self.settings.invalidation_poller.budget()
                ));
            }
            progress.invalidation = Some(outcome);
        }

        Ok(())
    }

    async fn remove_target(
        &self,
        target: &DeployTarget,
        progress: &mut Progress<'_>,
    ) -> Result<(), DeployError> {
        let stage = self.settings.stage.as_str();
        let manager = self.stack_manager();

        // Purging needs the live bucket and role, never the persisted record.
        let state = manager.observe(&target.stack.name).await?;

        match &target.assets {
            Some(assets) if assets.purge_on_remove && state.is_complete() => {
                let bucket = state.outputs.require(&assets.bucket_output)?;
                let credentials = self
                    .credential_broker()
                    .assume_from_stack(&state, &assets.role_output, &session_context(&state))
                    .await?;
                progress.enter(TargetState::CredentialsAcquired);

                progress.enter(TargetState::AssetsSyncing);
                let purge = self.sync_engine().purge(bucket, &credentials).await?;
                progress.sync = Some(purge);
                progress.enter(TargetState::AssetsSynced);
            }
            Some(assets)
                if assets.purge_on_remove
                    && matches!(state.status, StackStatus::Failed | StackStatus::RolledBack) =>
            {
                progress.warn(format!(
                    "stack {} is {}, bucket contents were not purged",
                    state.name, state.status
                ));
            }
            _ => {}
        }

        progress.enter(TargetState::StackDestroying);
        manager.destroy(&target.stack.name).await?;

        target.outputs.remove(stage)?;
        Ok(())
    }

    fn stack_manager(&self) -> StackManager<'a, B> {
        StackManager::new(self.backend, self.settings.stack_poller, self.cancel.clone())
    }

    fn sync_engine(&self) -> AssetSyncEngine<'a, B> {
        AssetSyncEngine::new(self.backend).with_cancellation(self.cancel.clone())
    }

    fn credential_broker(&self) -> CredentialBroker<'a, B> {
        CredentialBroker::new(self.backend, self.settings.credential_duration_secs)
    }
}

/// Session context for scoped credentials: the stack name plus a fixed
/// suffix, so each target's session is distinguishable in audit logs.
fn session_context(state: &StackState) -> String {
    format!("{}-deploy", state.name)
}

/// Tracks one target through its state machine.
struct Progress<'r> {
    name: String,
    state: TargetState,
    reporter: &'r dyn ProgressReporter,
    started: Instant,
    outputs: StackOutputs,
    sync: Option<SyncReport>,
    invalidation: Option<InvalidationOutcome>,
    warnings: Vec<String>,
}

impl<'r> Progress<'r> {
    fn new(name: &str, reporter: &'r dyn ProgressReporter) -> Self {
        Self {
            name: name.to_string(),
            state: TargetState::NotStarted,
            reporter,
            started: Instant::now(),
            outputs: StackOutputs::default(),
            sync: None,
            invalidation: None,
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, next: TargetState) {
        self.reporter.transition(&self.name, self.state, next);
        self.state = next;
    }

    fn warn(&mut self, message: String) {
        self.reporter.warning(&self.name, &message);
        self.warnings.push(message);
    }

    fn finish(mut self, result: Result<(), DeployError>) -> TargetReport {
        let (failed_at, error) = match result {
            Ok(()) => {
                self.enter(TargetState::Done);
                (None, None)
            }
            Err(e) => {
                let failed_at = self.state;
                self.reporter.failed(&self.name, failed_at, &e);
                self.state = TargetState::Failed;
                (Some(failed_at), Some(e))
            }
        };

        TargetReport {
            name: self.name,
            state: self.state,
            failed_at,
            error,
            outputs: self.outputs,
            sync: self.sync,
            invalidation: self.invalidation,
            warnings: self.warnings,
            elapsed: self.started.elapsed(),
        }
    }
}
