//! CDN cache invalidation.

use std::{
    ops::ControlFlow,
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::Utc;
use serde::Serialize;

use crate::{CacheDistribution, Cancellation, DeployError, Poller};

/// Path pattern that invalidates everything in a distribution.
pub const INVALIDATE_ALL: &str = "/*";

/// Status the distribution reports once an invalidation has propagated.
const COMPLETED_STATUS: &str = "Completed";

/// How an invalidation request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvalidationOutcome {
    /// The distribution confirmed propagation.
    Completed { id: String },
    /// Propagation was not confirmed within the attempt bound. The request is
    /// still in flight and will converge.
    Unconfirmed { id: String, attempts: u32 },
}

impl InvalidationOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, InvalidationOutcome::Completed { .. })
    }
}

enum Settled {
    Completed,
    /// The status read failed in a way retrying will not fix.
    Unreadable { attempts: u32 },
}

/// Requests cache invalidations and waits for them to propagate.
pub struct CacheInvalidator<'a, D> {
    distribution: &'a D,
    poller: Poller,
    cancel: Cancellation,
    sequence: AtomicU32,
}

impl<'a, D: CacheDistribution> CacheInvalidator<'a, D> {
    pub fn new(distribution: &'a D, poller: Poller, cancel: Cancellation) -> Self {
        Self {
            distribution,
            poller,
            cancel,
            sequence: AtomicU32::new(0),
        }
    }

    /// Invalidate `paths` on `distribution_id` and wait for propagation.
    ///
    /// Not observing completion within the attempt bound is reported as
    /// [`InvalidationOutcome::Unconfirmed`], not as an error. Failing to
    /// submit the request, or cancellation, is an error.
    pub async fn invalidate(
        &self,
        distribution_id: &str,
        paths: &[String],
    ) -> Result<InvalidationOutcome, DeployError> {
        let caller_reference = self.caller_reference();

        tracing::info!(distribution = %distribution_id, ?paths, "Invalidating cache...");

        let id = self
            .distribution
            .create_invalidation(distribution_id, paths, &caller_reference)
            .await?;

        let what = format!("invalidation {id} on {distribution_id}");
        let wait = self
            .poller
            .until(&what, &self.cancel, |attempt| {
                let id = id.as_str();
                async move {
                    match self.distribution.get_invalidation(distribution_id, id).await {
                        Ok(status) if status == COMPLETED_STATUS => {
                            Ok(ControlFlow::Break(Settled::Completed))
                        }
                        Ok(status) => {
                            tracing::debug!(
                                invalidation = %id,
                                %status,
                                attempt,
                                "Invalidation in progress"
                            );
                            Ok(ControlFlow::Continue(()))
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!(
                                invalidation = %id,
                                error = %e,
                                attempt,
                                "Failed to read invalidation status"
                            );
                            Ok(ControlFlow::Continue(()))
                        }
                        Err(e) => {
                            tracing::warn!(
                                invalidation = %id,
                                error = %e,
                                attempt,
                                "Invalidation status is unreadable, no longer waiting"
                            );
                            Ok(ControlFlow::Break(Settled::Unreadable { attempts: attempt }))
                        }
                    }
                }
            })
            .await;

        match wait {
            Ok(Settled::Completed) => {
                tracing::info!(
                    distribution = %distribution_id,
                    invalidation = %id,
                    "Cache invalidated"
                );
                Ok(InvalidationOutcome::Completed { id })
            }
            Ok(Settled::Unreadable { attempts }) => {
                Ok(InvalidationOutcome::Unconfirmed { id, attempts })
            }
            Err(DeployError::PollTimeout { attempts, elapsed, .. }) => {
                tracing::warn!(
                    distribution = %distribution_id,
                    invalidation = %id,
                    ?elapsed,
                    "Invalidation not confirmed in time, it will keep propagating"
                );
                Ok(InvalidationOutcome::Unconfirmed { id, attempts })
            }
            Err(e) => Err(e),
        }
    }

    /// Unique per call so the distribution never deduplicates two requests.
    fn caller_reference(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("stackdrop-{}-{seq}", Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{ProviderError, fake::FakeCloud};

    fn invalidator(cloud: &FakeCloud, attempts: u32) -> CacheInvalidator<'_, FakeCloud> {
        CacheInvalidator::new(
            cloud,
            Poller::new(Duration::from_millis(1), attempts),
            Cancellation::new(),
        )
    }

    #[tokio::test]
    async fn test_invalidation_completes() {
        let cloud = FakeCloud::new();

        let outcome = invalidator(&cloud, 10)
            .invalidate("dist-1", &[INVALIDATE_ALL.to_string()])
            .await
            .unwrap();

        assert!(outcome.is_confirmed());
        let requests = cloud.invalidation_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].paths, vec!["/*".to_string()]);
    }

    #[tokio::test]
    async fn test_stalled_invalidation_is_unconfirmed_not_error() {
        let cloud = FakeCloud::new();
        cloud.stall_invalidations();

        let outcome = invalidator(&cloud, 3)
            .invalidate("dist-1", &[INVALIDATE_ALL.to_string()])
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            InvalidationOutcome::Unconfirmed { attempts: 3, .. }
        ));
        assert_eq!(cloud.calls_named("get_invalidation"), 3);
    }

    #[tokio::test]
    async fn test_caller_references_are_unique() {
        let cloud = FakeCloud::new();
        let invalidator = invalidator(&cloud, 10);
        let paths = [INVALIDATE_ALL.to_string()];

        invalidator.invalidate("dist-1", &paths).await.unwrap();
        invalidator.invalidate("dist-1", &paths).await.unwrap();

        let requests = cloud.invalidation_requests();
        assert_ne!(requests[0].caller_reference, requests[1].caller_reference);
    }

    #[tokio::test]
    async fn test_permanent_read_error_stops_waiting() {
        let cloud = FakeCloud::new();
        cloud.fail_invalidation_reads(ProviderError::AccessDenied("cache:GetInvalidation".into()));

        let outcome = invalidator(&cloud, 60)
            .invalidate("dist-1", &[INVALIDATE_ALL.to_string()])
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            InvalidationOutcome::Unconfirmed { attempts: 1, .. }
        ));
        assert_eq!(cloud.calls_named("get_invalidation"), 1);
    }

    #[tokio::test]
    async fn test_transient_read_error_keeps_waiting() {
        let cloud = FakeCloud::new();
        cloud.fail_invalidation_reads(ProviderError::Transient("connection reset".into()));

        let outcome = invalidator(&cloud, 3)
            .invalidate("dist-1", &[INVALIDATE_ALL.to_string()])
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            InvalidationOutcome::Unconfirmed { attempts: 3, .. }
        ));
        assert_eq!(cloud.calls_named("get_invalidation"), 3);
    }
}
