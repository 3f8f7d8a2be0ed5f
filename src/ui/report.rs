use colored::*;
use patchflow::executor::{
    ExecutionStatus, Priority, ProcessingResult, Severity, ValidationFinding, ValidationReport,
};

fn finding_line(finding: &ValidationFinding) -> String {
    let tag = match finding.severity {
        Severity::Error => "[X]".red().bold(),
        Severity::Warning => "[!]".yellow(),
    };
    format!(
        "  {} #{} {}: {}",
        tag, finding.operation_index, finding.field, finding.message
    )
}

fn priority_label(priority: Priority) -> ColoredString {
    match priority {
        Priority::Low => "low".dimmed(),
        Priority::Medium => "medium".cyan(),
        Priority::High => "high".yellow(),
        Priority::Critical => "critical".red().bold(),
    }
}

pub fn print_validation_report(patch_id: &str, report: &ValidationReport) {
    if report.valid {
        eprintln!("{} {} is valid", "[OK]".green().bold(), patch_id);
    } else {
        eprintln!(
            "{} {} failed validation ({} error(s))",
            "[X]".red().bold(),
            patch_id,
            report.errors.len()
        );
    }

    for finding in report.findings() {
        eprintln!("{}", finding_line(&finding));
    }
}

pub fn print_processing_result(result: &ProcessingResult) {
    for finding in &result.validation_findings {
        eprintln!("{}", finding_line(finding));
    }

    for r in &result.execution_results {
        let tag = match r.status {
            ExecutionStatus::Success => "[v]".green(),
            ExecutionStatus::Skipped => "[-]".dimmed(),
            ExecutionStatus::Error => "[X]".red().bold(),
        };
        let message = r.message.as_deref().unwrap_or_default();
        eprintln!(
            "  {} #{} {} ({}ms) {}",
            tag,
            r.operation_index,
            r.file_path,
            r.execution_time_ms,
            message.dimmed()
        );
    }

    if !result.remediation_actions.is_empty() {
        eprintln!("\n{}", "Remediation:".cyan().bold());
        for action in &result.remediation_actions {
            eprintln!(
                "  [{}] {:?}: {}",
                priority_label(action.priority),
                action.action_type,
                action.description
            );
        }
    }

    if result.success {
        eprintln!("\n{} {} applied", "[OK]".green().bold(), result.patch_id);
    } else {
        eprintln!(
            "\n{} {} failed ({} of {} operation(s) failed)",
            "[X]".red().bold(),
            result.patch_id,
            result.failed_count(),
            result.execution_results.len()
        );
    }
}
