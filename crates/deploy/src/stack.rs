//! Stack lifecycle: create, update or delete a named stack and wait for the
//! control plane to settle.

use std::{
    ops::ControlFlow,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    Cancellation, ControlPlane, DeployError, Poller,
    types::{StackDescriptor, StackOperation, StackState, StackStatus, UpdateOutcome},
};

/// Raw status of a stack whose first creation was rolled back. The control
/// plane refuses to update such a stack.
const ROLLED_BACK_CREATION: &str = "ROLLBACK_COMPLETE";

/// Applies and destroys stacks against a [`ControlPlane`].
pub struct StackManager<'a, C> {
    control_plane: &'a C,
    poller: Poller,
    cancel: Cancellation,
}

impl<'a, C: ControlPlane> StackManager<'a, C> {
    pub fn new(control_plane: &'a C, poller: Poller, cancel: Cancellation) -> Self {
        Self {
            control_plane,
            poller,
            cancel,
        }
    }

    /// Create or update the stack and block until it reaches a terminal state.
    ///
    /// Re-applying an identical descriptor is a successful no-op. Returns the
    /// live `Complete` state; any failure or rollback is a
    /// [`DeployError::ControlPlane`] carrying the first failed event's reason.
    pub async fn apply(&self, descriptor: &StackDescriptor) -> Result<StackState, DeployError> {
        let name = descriptor.name.as_str();

        let existing = self.control_plane.describe_stack(name).await?;

        let baseline = existing.as_ref().map(|stack| stack.status.clone());
        let operation = match existing {
            None => {
                tracing::info!(stack = %name, template = %descriptor.template, "Creating stack...");
                self.control_plane.create_stack(descriptor).await?;
                StackOperation::Create
            }
            Some(stack) if stack.status == ROLLED_BACK_CREATION => {
                tracing::warn!(
                    stack = %name,
                    "Stack is left over from a failed creation, deleting it before re-creating"
                );
                self.destroy(name).await?;
                self.control_plane.create_stack(descriptor).await?;
                return self.settle(name, StackOperation::Create, None).await;
            }
            Some(stack) => {
                tracing::info!(stack = %name, status = %stack.status, "Updating stack...");
                match self.control_plane.update_stack(descriptor).await? {
                    UpdateOutcome::Started => StackOperation::Update,
                    UpdateOutcome::NoChanges => {
                        tracing::info!(stack = %name, "No changes to apply");
                        return Ok(StackState::complete(name, stack.outputs));
                    }
                }
            }
        };

        self.settle(name, operation, baseline.as_deref()).await
    }

    async fn settle(
        &self,
        name: &str,
        operation: StackOperation,
        baseline: Option<&str>,
    ) -> Result<StackState, DeployError> {
        let state = self.wait(name, operation, baseline).await?;
        self.ensure_complete(state)
    }

    /// Delete the stack and block until it is gone.
    ///
    /// Deleting a stack that does not exist succeeds.
    pub async fn destroy(&self, name: &str) -> Result<(), DeployError> {
        let Some(existing) = self.control_plane.describe_stack(name).await? else {
            tracing::info!(stack = %name, "Stack does not exist, nothing to delete");
            return Ok(());
        };

        tracing::info!(stack = %name, "Deleting stack...");
        self.control_plane.delete_stack(name).await?;

        let state = self
            .wait(name, StackOperation::Delete, Some(&existing.status))
            .await?;
        match state.status {
            StackStatus::Complete | StackStatus::NotFound => {
                tracing::info!(stack = %name, "Stack deleted");
                Ok(())
            }
            _ => Err(Self::failure(state)),
        }
    }

    /// Read the stack once and classify its current status.
    pub async fn observe(&self, name: &str) -> Result<StackState, DeployError> {
        let Some(stack) = self.control_plane.describe_stack(name).await? else {
            return Ok(StackState::not_found(name));
        };

        let status = StackStatus::observed(&stack.status);
        let failure_reason = match status {
            StackStatus::Failed | StackStatus::RolledBack => self.failure_reason(name).await,
            _ => None,
        };

        Ok(StackState {
            name: name.to_string(),
            status,
            outputs: if status == StackStatus::Complete {
                stack.outputs
            } else {
                Default::default()
            },
            failure_reason,
        })
    }

    /// Poll until the operation reaches a terminal status.
    ///
    /// `baseline` is the raw status read before the operation was requested.
    /// Until the control plane reports something else, that status belongs to
    /// the previous operation and is not taken as this one's outcome.
    async fn wait(
        &self,
        name: &str,
        operation: StackOperation,
        baseline: Option<&str>,
    ) -> Result<StackState, DeployError> {
        let what = format!("stack {name} ({operation})");
        let moved = AtomicBool::new(baseline.is_none());
        let moved = &moved;

        let state = self
            .poller
            .until(&what, &self.cancel, |attempt| async move {
                let Some(stack) = self.control_plane.describe_stack(name).await? else {
                    // Deleted stacks disappear instead of reporting a final status.
                    return Ok(if operation == StackOperation::Delete {
                        ControlFlow::Break(StackState::not_found(name))
                    } else {
                        ControlFlow::Continue(())
                    });
                };

                if !moved.load(Ordering::Relaxed) {
                    if baseline == Some(stack.status.as_str()) {
                        tracing::debug!(
                            stack = %name,
                            raw_status = %stack.status,
                            attempt,
                            "Operation not picked up yet"
                        );
                        return Ok(ControlFlow::Continue(()));
                    }
                    moved.store(true, Ordering::Relaxed);
                }

                let status = StackStatus::classify(&stack.status, operation);
                tracing::debug!(
                    stack = %name,
                    raw_status = %stack.status,
                    %status,
                    attempt,
                    "Polled stack"
                );

                Ok(match status {
                    StackStatus::Complete => {
                        ControlFlow::Break(StackState::complete(name, stack.outputs))
                    }
                    StackStatus::Failed | StackStatus::RolledBack => ControlFlow::Break(StackState {
                        name: name.to_string(),
                        status,
                        outputs: Default::default(),
                        failure_reason: None,
                    }),
                    _ => ControlFlow::Continue(()),
                })
            })
            .await?;

        if matches!(state.status, StackStatus::Failed | StackStatus::RolledBack) {
            let failure_reason = self.failure_reason(name).await;
            return Ok(StackState {
                failure_reason,
                ..state
            });
        }

        Ok(state)
    }

    /// Reason attached to the most recent failed resource event.
    async fn failure_reason(&self, name: &str) -> Option<String> {
        match self.control_plane.list_stack_events(name).await {
            Ok(events) => events
                .into_iter()
                .find(|event| event.resource_status.contains("FAILED"))
                .map(|event| event.reason.unwrap_or_else(|| event.resource_status.clone())),
            Err(e) => {
                tracing::warn!(stack = %name, error = %e, "Failed to read stack events");
                None
            }
        }
    }

    fn ensure_complete(&self, state: StackState) -> Result<StackState, DeployError> {
        if state.is_complete() {
            tracing::info!(
                stack = %state.name,
                outputs = state.outputs.len(),
                "Stack is up to date"
            );
            Ok(state)
        } else {
            Err(Self::failure(state))
        }
    }

    fn failure(state: StackState) -> DeployError {
        let reason = state
            .failure_reason
            .unwrap_or_else(|| format!("stack ended in {}", state.status));
        DeployError::ControlPlane {
            stack: state.name,
            reason,
        }
    }
}
