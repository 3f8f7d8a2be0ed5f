//! Remediation planning for failed patch executions
//!
//! The planner looks at per-operation execution results and proposes
//! follow-up actions. It never executes anything itself; callers decide
//! whether to roll back, retry, notify, or escalate to a human.
//!
//! ## Rules
//!
//! ```text
//! any failure                      -> Rollback     (Critical if > 3 failures, else High)
//! failure on a critical file       -> ManualReview (Critical)
//! recoverable failure, few enough  -> Retry        (Medium)
//! any failure                      -> Notify       (High if > 5 failures, else Medium)
//! no failure                       -> nothing
//! ```
//!
//! Permission and not-found failures are treated as non-recoverable, so
//! they never produce a `Retry` on their own.

use crate::config::Config;
use crate::error::Result;
use crate::executor::batch::ExecutionResult;
use crate::patch::files::CriticalFileSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static NON_RECOVERABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(permission denied|access denied|operation not permitted|eacces|eperm|not found|no such file|enoent|does not exist)",
    )
    .expect("non-recoverable failure pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Rollback,
    Retry,
    Notify,
    ManualReview,
}

/// Low < Medium < High < Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub description: String,
    pub priority: Priority,
}

impl RemediationAction {
    pub fn new(action_type: ActionType, priority: Priority, description: impl Into<String>) -> Self {
        Self {
            action_type,
            description: description.into(),
            priority,
        }
    }
}

/// Whether a failure message points at a problem retrying will not fix.
pub fn is_non_recoverable(message: &str) -> bool {
    NON_RECOVERABLE.is_match(message)
}

#[derive(Debug, Clone)]
pub struct RemediationPlanner {
    max_retries: usize,
    critical_files: CriticalFileSet,
}

impl RemediationPlanner {
    pub fn new(max_retries: usize, critical_files: CriticalFileSet) -> Self {
        Self {
            max_retries,
            critical_files,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.max_retries,
            CriticalFileSet::from_patterns(&config.critical_file_patterns)?,
        ))
    }

    pub fn plan(&self, results: &[ExecutionResult]) -> Vec<RemediationAction> {
        let failures: Vec<&ExecutionResult> = results.iter().filter(|r| r.is_error()).collect();
        let failure_count = failures.len();
        if failure_count == 0 {
            return Vec::new();
        }

        let mut actions = Vec::new();

        let rollback_priority = if failure_count > 3 {
            Priority::Critical
        } else {
            Priority::High
        };
        actions.push(RemediationAction::new(
            ActionType::Rollback,
            rollback_priority,
            format!("Roll back {} failed operation(s)", failure_count),
        ));

        let critical: Vec<&str> = failures
            .iter()
            .filter(|r| self.critical_files.is_critical(&r.file_path))
            .map(|r| r.file_path.as_str())
            .collect();
        if !critical.is_empty() {
            actions.push(RemediationAction::new(
                ActionType::ManualReview,
                Priority::Critical,
                format!("Review failed changes to critical files: {}", critical.join(", ")),
            ));
        }

        let recoverable = failures
            .iter()
            .filter(|r| !is_non_recoverable(r.message.as_deref().unwrap_or_default()))
            .count();
        if recoverable > 0 && failure_count <= self.max_retries {
            actions.push(RemediationAction::new(
                ActionType::Retry,
                Priority::Medium,
                format!("Retry {} recoverable operation(s)", recoverable),
            ));
        }

        let notify_priority = if failure_count > 5 {
            Priority::High
        } else {
            Priority::Medium
        };
        actions.push(RemediationAction::new(
            ActionType::Notify,
            notify_priority,
            format!("{} of {} operation(s) failed", failure_count, results.len()),
        ));

        actions
    }
}

impl Default for RemediationPlanner {
    fn default() -> Self {
        Self::new(3, CriticalFileSet::default())
    }
}
