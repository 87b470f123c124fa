//! Human and machine readable rendering of command results.

use comfy_table::{Cell, Color, Table, presets::UTF8_FULL};
use serde_json::{Value, json};
use stackdrop_deploy::{
    DeploymentOutputs, InvalidationOutcome, PipelineReport, TargetReport, TargetState,
    types::{StackState, StackStatus},
};

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(header.to_vec());
    table
}

fn state_cell(state: TargetState) -> Cell {
    let color = match state {
        TargetState::Done => Color::Green,
        TargetState::Failed => Color::Red,
        _ => Color::Yellow,
    };
    Cell::new(state).fg(color)
}

fn invalidation_summary(outcome: Option<&InvalidationOutcome>) -> String {
    match outcome {
        None => "-".to_string(),
        Some(InvalidationOutcome::Completed { id }) => format!("{id} completed"),
        Some(InvalidationOutcome::Unconfirmed { id, .. }) => format!("{id} unconfirmed"),
    }
}

fn notes(target: &TargetReport) -> String {
    let mut notes: Vec<String> = Vec::new();
    if let (Some(at), Some(error)) = (target.failed_at, &target.error) {
        notes.push(format!("{} at {at}: {error}", error.kind()));
    }
    notes.extend(target.warnings.iter().map(|w| format!("warning: {w}")));
    notes.join("\n")
}

pub fn pipeline_table(report: &PipelineReport) -> Table {
    let mut table = table(&[
        "Target",
        "State",
        "Uploaded",
        "Deleted",
        "Invalidation",
        "Elapsed",
        "Notes",
    ]);

    for target in &report.targets {
        let (uploaded, deleted) = target
            .sync
            .as_ref()
            .map(|s| (s.uploaded.len().to_string(), s.deleted.len().to_string()))
            .unwrap_or_else(|| ("-".to_string(), "-".to_string()));

        table.add_row(vec![
            Cell::new(&target.name),
            state_cell(target.state),
            Cell::new(uploaded),
            Cell::new(deleted),
            Cell::new(invalidation_summary(target.invalidation.as_ref())),
            Cell::new(format!("{:.1}s", target.elapsed.as_secs_f64())),
            Cell::new(notes(target)),
        ]);
    }

    table
}

pub fn pipeline_json(report: &PipelineReport) -> Value {
    let targets: Vec<Value> = report
        .targets
        .iter()
        .map(|target| {
            json!({
                "name": target.name,
                "state": target.state,
                "failed_at": target.failed_at,
                "error": target.error.as_ref().map(|e| json!({
                    "kind": e.kind(),
                    "message": e.to_string(),
                })),
                "outputs": target.outputs,
                "sync": target.sync,
                "invalidation": target.invalidation,
                "warnings": target.warnings,
                "elapsed_ms": target.elapsed.as_millis() as u64,
            })
        })
        .collect();

    json!({ "success": report.is_success(), "targets": targets })
}

pub fn status_table(states: &[(String, StackState)]) -> Table {
    let mut table = table(&["Target", "Stack", "Status", "Outputs", "Failure"]);

    for (unit, state) in states {
        let color = match state.status {
            StackStatus::Complete => Color::Green,
            StackStatus::Failed | StackStatus::RolledBack => Color::Red,
            StackStatus::NotFound => Color::DarkGrey,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(unit),
            Cell::new(&state.name),
            Cell::new(state.status).fg(color),
            Cell::new(state.outputs.len()),
            Cell::new(state.failure_reason.as_deref().unwrap_or("")),
        ]);
    }

    table
}

pub fn status_json(states: &[(String, StackState)]) -> Value {
    states
        .iter()
        .map(|(unit, state)| {
            json!({
                "target": unit,
                "stack": state.name,
                "status": state.status,
                "outputs": state.outputs,
                "failure_reason": state.failure_reason,
            })
        })
        .collect()
}

pub fn outputs_table(record: &DeploymentOutputs) -> Table {
    let mut table = table(&["Output", "Value"]);
    for (key, value) in record.outputs.iter() {
        table.add_row(vec![key.as_str(), value.as_str()]);
    }
    table
}
