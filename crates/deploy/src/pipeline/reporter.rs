//! Progress reporting for pipeline runs.

use std::sync::Mutex;

use crate::DeployError;

use super::TargetState;

/// Receives state transitions and warnings as targets progress.
///
/// Passed by reference into the pipeline so each run (or test) chooses its
/// own sink.
pub trait ProgressReporter: Send + Sync {
    fn transition(&self, target: &str, from: TargetState, to: TargetState);

    fn warning(&self, target: &str, message: &str);

    /// The target stopped in state `at` because of `error`.
    fn failed(&self, target: &str, at: TargetState, error: &DeployError) {
        let _ = error;
        self.transition(target, at, TargetState::Failed);
    }
}

/// Reports progress as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn transition(&self, target: &str, from: TargetState, to: TargetState) {
        match to {
            TargetState::Done => tracing::info!(target_name = %target, "Target done"),
            _ => tracing::info!(target_name = %target, %from, state = %to, "Target progressed"),
        }
    }

    fn failed(&self, target: &str, at: TargetState, error: &DeployError) {
        tracing::error!(
            target_name = %target,
            state = %at,
            kind = error.kind(),
            error = %error,
            "Target failed"
        );
    }

    fn warning(&self, target: &str, message: &str) {
        tracing::warn!(target_name = %target, "{}", message);
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<(String, TargetState)>>,
    warnings: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// States entered by `target`, in order.
    pub fn states(&self, target: &str) -> Vec<TargetState> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(name, _)| name == target)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Names of targets in the order they first left `NotStarted`.
    pub fn start_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (name, _) in self.events.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    pub fn warnings(&self) -> Vec<(String, String)> {
        self.warnings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn transition(&self, target: &str, _from: TargetState, to: TargetState) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((target.to_string(), to));
    }

    fn warning(&self, target: &str, message: &str) {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((target.to_string(), message.to_string()));
    }
}
