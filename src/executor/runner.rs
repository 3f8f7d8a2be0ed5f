use crate::config::{Config, OutputFormat};
use crate::error::{PatchError, Result};
use crate::patch::Operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// apply 메커니즘 호출 인자
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_directory: PathBuf,
    pub output_format: OutputFormat,
}

/// apply 메커니즘 실행 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
    pub execution_time_ms: u64,
}

impl ApplyOutcome {
    pub fn success(output: Option<Value>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output,
            error: None,
            exit_code: 0,
            execution_time_ms,
        }
    }

    pub fn failure(error: impl Into<String>, exit_code: i32, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            exit_code,
            execution_time_ms,
        }
    }

    /// 대상이 이미 원하는 상태라 아무것도 하지 않았는지
    pub fn is_skipped(&self) -> bool {
        self.success
            && self
                .output
                .as_ref()
                .and_then(|o| o.get("skipped"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

/// 파일을 실제로 수정하는 외부 도구
///
/// `Err`는 도구 자체를 실행하지 못한 경우, `Ok(outcome)`의 `success=false`는
/// 도구가 실패를 보고한 경우입니다.
#[async_trait]
pub trait ApplyMechanism: Send + Sync {
    async fn apply(&self, request: ApplyRequest) -> Result<ApplyOutcome>;
}

/// 작업 하나를 외부 명령어 호출로 변환
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    command: String,
    base_args: Vec<String>,
    timeout_ms: u64,
    working_directory: PathBuf,
    output_format: OutputFormat,
    dry_run: bool,
    env: HashMap<String, String>,
}

impl RequestBuilder {
    pub fn new(command: impl Into<String>, working_directory: PathBuf) -> Self {
        Self {
            command: command.into(),
            base_args: Vec::new(),
            timeout_ms: 120_000,
            working_directory,
            output_format: OutputFormat::Json,
            dry_run: false,
            env: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let builder = Self {
            command: config.apply_command.clone(),
            base_args: config.apply_args.clone(),
            timeout_ms: config.operation_timeout_ms,
            working_directory: config.working_directory()?,
            output_format: config.output_format,
            dry_run: config.dry_run,
            env: HashMap::new(),
        };

        Ok(config
            .apply_env
            .iter()
            .fold(builder, |builder, (key, value)| builder.with_env(key, value)))
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn build(&self, patch_id: &str, operation: &Operation) -> Result<ApplyRequest> {
        let mut args = self.base_args.clone();
        args.push("--patch-id".to_string());
        args.push(patch_id.to_string());
        args.push("--operation".to_string());
        args.push(serde_json::to_string(operation)?);
        if self.dry_run {
            args.push("--dry-run".to_string());
        }

        Ok(ApplyRequest {
            command: self.command.clone(),
            args,
            timeout_ms: self.timeout_ms,
            env: self.env.clone(),
            working_directory: self.working_directory.clone(),
            output_format: self.output_format,
        })
    }
}

/// 외부 프로세스로 apply 메커니즘 실행
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    fn parse_output(stdout: &str, format: OutputFormat) -> Option<Value> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }

        match format {
            OutputFormat::Json => Some(
                serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())),
            ),
            OutputFormat::Text => Some(Value::String(trimmed.to_string())),
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApplyMechanism for CommandRunner {
    async fn apply(&self, request: ApplyRequest) -> Result<ApplyOutcome> {
        tracing::debug!(command = %request.command, args = ?request.args, "running apply command");
        let start_time = Instant::now();

        let child = Command::new(&request.command)
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PatchError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to spawn '{}': {}", request.command, e),
                ))
            })?;

        let output = tokio::time::timeout(
            Duration::from_millis(request.timeout_ms),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| PatchError::Timeout {
            ms: request.timeout_ms,
        })??;

        let elapsed = start_time.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!("exited with code {}", exit_code)
            } else {
                stderr.trim().to_string()
            };
            return Ok(ApplyOutcome {
                output: Self::parse_output(&stdout, request.output_format),
                ..ApplyOutcome::failure(message, exit_code, elapsed)
            });
        }

        Ok(ApplyOutcome::success(
            Self::parse_output(&stdout, request.output_format),
            elapsed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::OpKind;

    fn shell_request(script: &str, timeout_ms: u64, format: OutputFormat) -> ApplyRequest {
        ApplyRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_ms,
            env: HashMap::new(),
            working_directory: std::env::temp_dir(),
            output_format: format,
        }
    }

    #[test]
    fn test_request_builder_args() {
        let builder = RequestBuilder::new("patch-manager", PathBuf::from("/work")).with_timeout_ms(500);
        let op = Operation::new(OpKind::Replace, "a.ts").with_value("x");

        let request = builder.build("p1", &op).unwrap();
        assert_eq!(request.command, "patch-manager");
        assert_eq!(request.timeout_ms, 500);
        assert_eq!(request.args[0], "--patch-id");
        assert_eq!(request.args[1], "p1");
        assert_eq!(request.args[2], "--operation");

        let encoded: Operation = serde_json::from_str(&request.args[3]).unwrap();
        assert_eq!(encoded, op);
        assert!(!request.args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn test_request_builder_dry_run() {
        let config = Config {
            dry_run: true,
            working_directory: Some(PathBuf::from("/work")),
            ..Config::default()
        };
        let builder = RequestBuilder::from_config(&config).unwrap();
        let request = builder.build("p1", &Operation::new(OpKind::Remove, "a.ts")).unwrap();

        assert_eq!(request.args[0], "apply");
        assert_eq!(request.args.last().map(String::as_str), Some("--dry-run"));
    }

    #[test]
    fn test_request_builder_env_from_config() {
        let mut config = Config {
            working_directory: Some(PathBuf::from("/work")),
            ..Config::default()
        };
        config.apply_env.insert("PATCH_ROOT".to_string(), "/work/src".to_string());

        let request = RequestBuilder::from_config(&config)
            .unwrap()
            .with_env("CI", "1")
            .build("p1", &Operation::new(OpKind::Remove, "a.ts"))
            .unwrap();

        assert_eq!(request.env.get("PATCH_ROOT").map(String::as_str), Some("/work/src"));
        assert_eq!(request.env.get("CI").map(String::as_str), Some("1"));
        assert_eq!(request.working_directory, PathBuf::from("/work"));
    }

    #[tokio::test]
    async fn test_command_runner_passes_env() {
        let runner = CommandRunner::new();
        let mut request = shell_request("printf '%s' \"$PATCH_ROOT\"", 5_000, OutputFormat::Text);
        request.env.insert("PATCH_ROOT".to_string(), "src".to_string());

        let outcome = runner.apply(request).await.unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!("src")));
    }

    #[test]
    fn test_skipped_outcome() {
        let outcome = ApplyOutcome::success(Some(serde_json::json!({"skipped": true})), 3);
        assert!(outcome.is_skipped());
        assert!(!ApplyOutcome::success(None, 3).is_skipped());
    }

    #[tokio::test]
    async fn test_command_runner_json_output() {
        let runner = CommandRunner::new();
        let outcome = runner
            .apply(shell_request(r#"echo '{"changed": 1}'"#, 5_000, OutputFormat::Json))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output.unwrap()["changed"], 1);
    }

    #[tokio::test]
    async fn test_command_runner_failure() {
        let runner = CommandRunner::new();
        let outcome = runner
            .apply(shell_request("echo 'Permission denied' >&2; exit 3", 5_000, OutputFormat::Text))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.error.as_deref(), Some("Permission denied"));
    }

    #[tokio::test]
    async fn test_command_runner_timeout() {
        let runner = CommandRunner::new();
        let result = runner.apply(shell_request("sleep 5", 100, OutputFormat::Text)).await;
        assert!(matches!(result, Err(PatchError::Timeout { ms: 100 })));
    }

    #[tokio::test]
    async fn test_command_runner_missing_binary() {
        let runner = CommandRunner::new();
        let mut request = shell_request("", 1_000, OutputFormat::Text);
        request.command = "definitely-not-a-real-binary-xyz".to_string();

        assert!(runner.apply(request).await.is_err());
    }
}
