//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{DeploymentFile, ValidationResult};
use crate::engine::DriftReport;
use crate::planner::{ActionKind, ActionStatus, ApplyReport, AttributeChange, Plan, PlanSummary, Step};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Per-resource result row.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Recorded resource row.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Applied")]
    applied_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Recorded state matches the deployment file.\n",
                "✓".green()
            );
        }

        let mut output = format!("\n{} plan\n\n", capitalize(&plan.operation.to_string()));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_kind(a.kind),
                resource: a.id.clone(),
                resource_type: a.resource_type.clone(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "\n  {} {}", action.kind.symbol(), action.id.bold());
                for change in &action.changes {
                    let _ = writeln!(output, "      {}", Self::format_change(change));
                }
                if action.kind == ActionKind::Replace {
                    let steps: Vec<&str> = action.steps.iter().map(|s| step_name(*s)).collect();
                    let _ = writeln!(output, "      steps: {}", steps.join(" then "));
                }
            }
        }

        let _ = write!(output, "\nPlan: {}\n", Self::format_summary(plan.summary()));
        output
    }

    fn format_change(change: &AttributeChange) -> String {
        let before = change
            .before
            .as_ref()
            .map_or_else(|| String::from("(none)"), ToString::to_string);
        let after = change
            .after
            .as_ref()
            .map_or_else(|| String::from("(removed)"), ToString::to_string);
        let marker = if change.forces_replacement {
            " # forces replacement".red().to_string()
        } else {
            String::new()
        };
        format!("{}: {before} -> {after}{marker}", change.name)
    }

    fn format_summary(summary: PlanSummary) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        )
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let mut output = String::new();

        let rows: Vec<StatusRow> = report
            .actions
            .iter()
            .filter(|a| a.kind != ActionKind::NoOp)
            .map(|a| StatusRow {
                resource: a.id.clone(),
                action: a.kind.to_string(),
                status: Self::format_status(a.status),
                physical_id: a.physical_id.clone().unwrap_or_default(),
                error: Self::truncate(
                    a.rollback_error.as_deref().or(a.error.as_deref()).unwrap_or(""),
                    60,
                ),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !report.outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            output.push_str(&Self::format_outputs_text(&report.outputs));
        }
        if !report.pending_outputs.is_empty() {
            let _ = writeln!(
                output,
                "\n{} Unresolved outputs: {}",
                "⚠".yellow(),
                report.pending_outputs.join(", ")
            );
        }

        if !report.inconsistent.is_empty() {
            let _ = writeln!(
                output,
                "\n{} Rollback failed. These resources may be inconsistent:",
                "✗".red()
            );
            for resource in &report.inconsistent {
                let _ = writeln!(
                    output,
                    "   - {} ({}): {}",
                    resource.id,
                    resource.physical_id.as_deref().unwrap_or("unknown"),
                    resource.reason
                );
            }
        }

        let verdict = if report.success() {
            format!("{} {} complete", "✓".green(), capitalize(&report.operation.to_string()))
        } else if report.cancelled {
            format!("{} {} cancelled", "✗".red(), capitalize(&report.operation.to_string()))
        } else {
            format!("{} {} failed", "✗".red(), capitalize(&report.operation.to_string()))
        };
        let _ = write!(
            output,
            "\n{verdict}: {} applied, {} failed, {} rolled back, {} skipped\n",
            report.count(ActionStatus::Applied),
            report.count(ActionStatus::Failed),
            report.count(ActionStatus::RolledBack),
            report.count(ActionStatus::Skipped)
        );
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if !report.has_drift() {
                    return format!("{} No drift detected.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for resource in &report.resources {
                    let _ = writeln!(
                        output,
                        "   {} {} ({})",
                        Self::format_action_kind(resource.action),
                        resource.id,
                        resource.reason
                    );
                    for change in &resource.changes {
                        let _ = writeln!(output, "       {}", Self::format_change(change));
                    }
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.resources.len(),
                    report.resources.len() + report.in_sync
                );
                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "state": state, "lock": lock })),
            OutputFormat::Text => {
                let mut output = format!(
                    "\nState: {}-{}\n\n",
                    state.deployment, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Lock: held by {} since {} ({}s left, id {})",
                            lock.holder,
                            lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                            lock.remaining_secs(),
                            lock.lock_id
                        );
                    }
                    None => output.push_str("   Lock: none\n"),
                }

                if !state.resources.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .resources
                        .iter()
                        .map(|(id, r)| RecordRow {
                            resource: id.clone(),
                            resource_type: r.resource_type.clone(),
                            physical_id: r.physical_id.clone(),
                            fingerprint: crate::model::Fingerprinter::short(&r.fingerprint),
                            applied_at: r.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text if outputs.is_empty() => String::from("No outputs recorded.\n"),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &BTreeMap<String, Value>) -> String {
        let mut output = String::new();
        for (name, value) in outputs {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let _ = writeln!(output, "   {} = {rendered}", name.bold());
        }
        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        file: &DeploymentFile,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "deployment": file.deployment.identity(),
                "resources": file.resources.len(),
                "outputs": file.outputs.len(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Deployment file is valid.\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }
                output.push_str("\nSummary:\n");
                let _ = writeln!(output, "  Deployment: {}", file.deployment.name);
                let _ = writeln!(output, "  Environment: {}", file.deployment.environment);
                let _ = writeln!(output, "  Resources: {}", file.resources.len());
                let _ = writeln!(output, "  Outputs: {}", file.outputs.len());
                output
            }
        }
    }

    /// Formats an error.
    #[must_use]
    pub fn format_error(&self, message: &str, exit_code: i32) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": "error",
                "exit_code": exit_code,
                "message": message,
            })),
            OutputFormat::Text => format!("{} {message}", "✗".red()),
        }
    }

    /// Formats an action kind with color.
    fn format_action_kind(kind: ActionKind) -> String {
        let label = format!("{} {kind}", kind.symbol()).trim_start().to_string();
        match kind {
            ActionKind::Create => label.green().to_string(),
            ActionKind::Update => label.yellow().to_string(),
            ActionKind::Replace => label.magenta().to_string(),
            ActionKind::Delete => label.red().to_string(),
            ActionKind::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats an action status with color.
    fn format_status(status: ActionStatus) -> String {
        let label = status.to_string();
        match status {
            ActionStatus::Applied => label.green().to_string(),
            ActionStatus::Failed | ActionStatus::RollbackFailed => label.red().to_string(),
            ActionStatus::RolledBack => label.yellow().to_string(),
            ActionStatus::Pending | ActionStatus::Applying | ActionStatus::Skipped => {
                label.dimmed().to_string()
            }
        }
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

const fn step_name(step: Step) -> &'static str {
    match step {
        Step::Create => "create new",
        Step::Update => "update",
        Step::Delete | Step::DeletePrior => "delete old",
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    operation: String,
    summary: PlanSummary,
    actions: Vec<ActionJson>,
}

#[derive(Serialize)]
struct ActionJson {
    id: String,
    resource_type: String,
    action: ActionKind,
    steps: Vec<Step>,
    reason: String,
    changes: Vec<AttributeChange>,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            operation: plan.operation.to_string(),
            summary: plan.summary(),
            actions: plan
                .actions
                .iter()
                .map(|a| ActionJson {
                    id: a.id.clone(),
                    resource_type: a.resource_type.clone(),
                    action: a.kind,
                    steps: a.steps.clone(),
                    reason: a.reason.clone(),
                    changes: a.changes.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunOperation;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&Plan::new(RunOperation::Apply), false);
        assert!(text.contains("No changes"));
    }

    #[test]
    fn test_plan_json_shape() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: Value =
            serde_json::from_str(&formatter.format_plan(&Plan::new(RunOperation::Destroy), false))
                .unwrap();
        assert_eq!(json["operation"], "destroy");
        assert_eq!(json["summary"]["create"], 0);
        assert!(json["actions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_outputs_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let outputs = BTreeMap::from([
            ("lb_dns".to_string(), Value::String("lb-1.lb.example.net".into())),
            ("port".to_string(), serde_json::json!(443)),
        ]);
        let text = formatter.format_outputs(&outputs);
        assert!(text.contains("lb_dns = lb-1.lb.example.net"));
        assert!(text.contains("port = 443"));
        assert_eq!(
            formatter.format_outputs(&BTreeMap::new()),
            "No outputs recorded.\n"
        );
    }
}
