use crate::config::Config;
use crate::error::Result;
use crate::patch::files::{self, CriticalFileSet, FileCategory};
use crate::patch::{OpKind, Operation, PatchBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// 검증 결과 한 건
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFinding {
    pub operation_index: usize,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationFinding {
    fn error(operation_index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            operation_index,
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(operation_index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            operation_index,
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationFinding>,
    pub warnings: Vec<ValidationFinding>,
}

impl ValidationReport {
    fn from_findings(findings: Vec<ValidationFinding>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|f| f.severity == Severity::Error);

        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// 에러 먼저, 그다음 경고
    pub fn findings(&self) -> Vec<ValidationFinding> {
        self.errors.iter().chain(self.warnings.iter()).cloned().collect()
    }
}

/// `.mission_control/tasks.json`의 작업 정의
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: serde_json::Value,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub allowed_operations: Vec<String>,
}

/// 작업 ID별 허용 파일 / 허용 작업 목록
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskManifest {
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl TaskManifest {
    pub const RELATIVE_PATH: &'static str = ".mission_control/tasks.json";

    /// 프로젝트 루트에서 매니페스트를 찾음
    ///
    /// 파일이 없거나 JSON이 잘못되었으면 None (잘못된 JSON은 경고만 남김)
    pub fn discover(root: &Path) -> Result<Option<Self>> {
        let path = root.join(Self::RELATIVE_PATH);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no task manifest, skipping task scope checks");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<TaskManifest>(&content) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid task manifest JSON");
                Ok(None)
            }
        }
    }

    fn find(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|task| match &task.id {
            serde_json::Value::String(s) => s == task_id,
            other => other.to_string() == task_id,
        })
    }
}

/// 배치 검증기
///
/// 배치를 수정하지 않고, 실패도 반환값(findings)으로만 알립니다.
#[derive(Debug, Clone)]
pub struct BatchValidator {
    allowed_extensions: Vec<String>,
    critical_files: CriticalFileSet,
    task_manifest: Option<TaskManifest>,
}

impl BatchValidator {
    pub fn new(allowed_extensions: Vec<String>, critical_files: CriticalFileSet) -> Self {
        Self {
            allowed_extensions,
            critical_files,
            task_manifest: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let critical_files = CriticalFileSet::from_patterns(&config.critical_file_patterns)?;
        Ok(Self::new(config.allowed_extensions.clone(), critical_files))
    }

    pub fn with_task_manifest(mut self, manifest: TaskManifest) -> Self {
        self.task_manifest = Some(manifest);
        self
    }

    pub fn validate(&self, batch: &PatchBatch) -> ValidationReport {
        let mut findings = Vec::new();

        for (index, op) in batch.operations().iter().enumerate() {
            self.check_path_safety(index, op, &mut findings);
            self.check_extension(index, op, &mut findings);
            self.check_compatibility(index, op, &mut findings);
            self.check_destructive(index, op, &mut findings);
            self.check_content(index, op, &mut findings);
            self.check_task_scope(index, op, &mut findings);
        }

        Self::check_conflicts(batch.operations(), &mut findings);

        ValidationReport::from_findings(findings)
    }

    fn check_path_safety(&self, index: usize, op: &Operation, findings: &mut Vec<ValidationFinding>) {
        if let Some(issue) = files::check_path(&op.path) {
            findings.push(ValidationFinding::error(index, "path", issue.describe()));
        }

        if op.op.requires_from() {
            if let Some(from) = &op.from {
                if let Some(issue) = files::check_path(from) {
                    findings.push(ValidationFinding::error(index, "from", issue.describe()));
                }
            }
        }
    }

    fn check_extension(&self, index: usize, op: &Operation, findings: &mut Vec<ValidationFinding>) {
        // 안전하지 않은 경로는 path 에러 하나로 충분
        if self.allowed_extensions.is_empty() || files::check_path(&op.path).is_some() {
            return;
        }

        if !self.is_allowed(&op.path) {
            let shown = files::extension(&op.path)
                .map(|e| format!(".{}", e))
                .unwrap_or_else(|| files::file_name(&op.path).to_string());
            findings.push(ValidationFinding::error(
                index,
                "path",
                format!("file type '{}' is not in the allow-list", shown),
            ));
        }
    }

    fn is_allowed(&self, path: &str) -> bool {
        let name = files::file_name(path);
        let ext = files::extension(path);

        self.allowed_extensions.iter().any(|entry| {
            let entry = entry.trim_start_matches('.');
            entry == name || ext.as_deref().is_some_and(|e| entry.eq_ignore_ascii_case(e))
        })
    }

    fn check_compatibility(&self, index: usize, op: &Operation, findings: &mut Vec<ValidationFinding>) {
        match (op.op, FileCategory::infer(&op.path)) {
            (OpKind::Remove, FileCategory::Config) => findings.push(ValidationFinding::warning(
                index,
                "op",
                "removing a configuration file",
            )),
            (OpKind::Add | OpKind::Replace, FileCategory::Lockfile) => {
                findings.push(ValidationFinding::warning(
                    index,
                    "op",
                    "lockfiles are normally generated, not edited",
                ))
            }
            _ => {}
        }
    }

    fn check_destructive(&self, index: usize, op: &Operation, findings: &mut Vec<ValidationFinding>) {
        if op.op == OpKind::Remove && self.critical_files.is_critical(&op.path) {
            findings.push(ValidationFinding::warning(
                index,
                "path",
                format!("removing critical file '{}'", op.path),
            ));
        }
    }

    fn check_content(&self, index: usize, op: &Operation, findings: &mut Vec<ValidationFinding>) {
        if op.op.requires_value() && op.value.is_none() {
            findings.push(ValidationFinding::error(
                index,
                "value",
                format!("'{}' requires a value", op.op),
            ));
        }

        if op.op.requires_from() && op.from.as_deref().map_or(true, |f| f.trim().is_empty()) {
            findings.push(ValidationFinding::error(
                index,
                "from",
                format!("'{}' requires a source path", op.op),
            ));
        }
    }

    fn check_task_scope(&self, index: usize, op: &Operation, findings: &mut Vec<ValidationFinding>) {
        let (Some(manifest), Some(task_id)) = (&self.task_manifest, &op.task_id) else {
            return;
        };

        let Some(task) = manifest.find(task_id) else {
            findings.push(ValidationFinding::warning(
                index,
                "taskId",
                format!("task {} not found in task manifest", task_id),
            ));
            return;
        };

        if !task.files.is_empty() && !task.files.iter().any(|f| f == &op.path) {
            findings.push(ValidationFinding::error(
                index,
                "path",
                format!(
                    "file '{}' not in allowed files for task {}: {:?}",
                    op.path, task_id, task.files
                ),
            ));
        }

        if !task.allowed_operations.is_empty()
            && !task.allowed_operations.iter().any(|o| o == op.op.as_str())
        {
            findings.push(ValidationFinding::error(
                index,
                "op",
                format!(
                    "operation '{}' not in allowed operations for task {}: {:?}",
                    op.op, task_id, task.allowed_operations
                ),
            ));
        }
    }

    /// 같은 경로를 두 번 이상 건드리면 경고 (순차 수정일 수 있으므로 막지는 않음)
    fn check_conflicts(operations: &[Operation], findings: &mut Vec<ValidationFinding>) {
        let mut first_seen: HashMap<&str, usize> = HashMap::new();

        for (index, op) in operations.iter().enumerate() {
            if op.path.trim().is_empty() {
                continue;
            }
            match first_seen.get(op.path.as_str()) {
                Some(first) => findings.push(ValidationFinding::warning(
                    index,
                    "path",
                    format!("'{}' is also targeted by operation {}", op.path, first),
                )),
                None => {
                    first_seen.insert(op.path.as_str(), index);
                }
            }
        }
    }
}

impl Default for BatchValidator {
    fn default() -> Self {
        let config = Config::default();
        Self::new(config.allowed_extensions, CriticalFileSet::default())
    }
}
