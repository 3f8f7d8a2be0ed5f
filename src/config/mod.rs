use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// apply 메커니즘 출력 해석 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
}

/// patchflow 설정
///
/// 설정 파일은 ~/.patchflow/config.toml에 저장됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 파일을 실제로 수정하는 외부 명령어
    #[serde(default = "default_apply_command")]
    pub apply_command: String,

    /// 외부 명령어에 항상 붙는 인자
    #[serde(default = "default_apply_args")]
    pub apply_args: Vec<String>,

    /// 외부 명령어에 추가로 넘길 환경 변수
    #[serde(default)]
    pub apply_env: HashMap<String, String>,

    /// 작업 디렉토리 (None이면 현재 디렉토리)
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// 작업 하나당 최대 실행 시간 (밀리초)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,

    /// 파일을 쓰지 않고 변경만 확인
    #[serde(default)]
    pub dry_run: bool,

    /// 허용 확장자 / 파일 이름 (비어 있으면 검사 안 함)
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// 중요 파일 정규표현식
    #[serde(default = "default_critical_file_patterns")]
    pub critical_file_patterns: Vec<String>,

    /// 재시도 권장 최대 실패 수
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// 이 시간 동안 메시지가 없으면 연결 종료
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// 연결당 송신 큐 크기
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    #[serde(default)]
    pub event_log_path: Option<PathBuf>,

    /// 토큰 -> 사용자 ID
    #[serde(default)]
    pub auth_tokens: HashMap<String, String>,

    /// .mission_control/tasks.json 검사 여부
    #[serde(default = "default_task_manifest")]
    pub task_manifest: bool,
}

fn default_apply_command() -> String {
    "patch-manager".to_string()
}

fn default_apply_args() -> Vec<String> {
    vec!["apply".to_string()]
}

fn default_operation_timeout_ms() -> u64 {
    120_000
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Json
}

fn default_allowed_extensions() -> Vec<String> {
    [
        "ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "rs", "py", "go", "java", "kt", "rb",
        "css", "scss", "html", "md", "mdx", "txt", "yml", "yaml", "toml", "sql", "sh", "env",
        "lock", "Dockerfile", "Makefile",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub(crate) fn default_critical_file_patterns() -> Vec<String> {
    [
        r"(^|/)package\.json$",
        r"(^|/)(package-lock\.json|yarn\.lock|pnpm-lock\.yaml|bun\.lockb|Cargo\.lock)$",
        r"(^|/)Cargo\.toml$",
        r"(^|/)(requirements\.txt|pyproject\.toml|go\.mod|Gemfile)$",
        r"(^|/)(Dockerfile|docker-compose\.ya?ml)$",
        r"(^|/)(wrangler\.toml|vercel\.json|netlify\.toml)$",
        r"(^|/)(tsconfig\.json|vite\.config\.[cm]?[jt]s|webpack\.config\.[cm]?[jt]s)$",
        r"(^|/)\.github/workflows/[^/]+\.ya?ml$",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_retries() -> usize {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    90
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_task_manifest() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apply_command: default_apply_command(),
            apply_args: default_apply_args(),
            apply_env: HashMap::new(),
            working_directory: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            output_format: default_output_format(),
            dry_run: false,
            allowed_extensions: default_allowed_extensions(),
            critical_file_patterns: default_critical_file_patterns(),
            max_retries: default_max_retries(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            outbound_buffer: default_outbound_buffer(),
            socket_path: None,
            event_log_path: None,
            auth_tokens: HashMap::new(),
            task_manifest: default_task_manifest(),
        }
    }
}

impl Config {
    /// 설정 디렉토리 경로 (~/.patchflow)
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| PatchError::Config("Could not find home directory".to_string()))?;
        Ok(home.join(".patchflow"))
    }

    /// 설정 파일 경로 가져오기
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// 기본 경로에서 로드 (없으면 기본값 사용)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// 지정한 파일에서 로드 (없으면 기본값 사용)
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            PatchError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        Ok(config)
    }

    /// 설정을 파일에 저장
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| PatchError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, toml_string)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0 {
            return Err(PatchError::Config(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(PatchError::Config(
                "outbound_buffer must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(PatchError::Config(
                "heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(PatchError::Config(format!(
                "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    /// 소켓 경로 (~/.patchflow/hub.sock)
    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("hub.sock")),
        }
    }

    /// 이벤트 로그 경로 (~/.patchflow/events.jsonl)
    pub fn event_log_path(&self) -> Result<PathBuf> {
        match &self.event_log_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("events.jsonl")),
        }
    }

    pub fn working_directory(&self) -> Result<PathBuf> {
        match &self.working_directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}
