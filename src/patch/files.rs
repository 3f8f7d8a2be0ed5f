use crate::error::{PatchError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// 기본 중요 파일 집합 (설정 없이 쓰는 곳용)
static DEFAULT_CRITICAL: Lazy<CriticalFileSet> = Lazy::new(|| {
    CriticalFileSet::from_patterns(&crate::config::default_critical_file_patterns())
        .unwrap_or_else(|_| CriticalFileSet { patterns: Vec::new() })
});

/// 경로 안전성 검사 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathIssue {
    Empty,
    Absolute,
    Traversal,
}

impl PathIssue {
    pub fn describe(&self) -> &'static str {
        match self {
            PathIssue::Empty => "path must not be empty",
            PathIssue::Absolute => "absolute paths are not allowed",
            PathIssue::Traversal => "path traversal ('..') is not allowed",
        }
    }
}

/// 상대 경로이고 상위 디렉토리로 벗어나지 않는지 확인
pub fn check_path(path: &str) -> Option<PathIssue> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(PathIssue::Empty);
    }

    if trimmed.starts_with('/') || trimmed.starts_with('\\') || has_drive_prefix(trimmed) {
        return Some(PathIssue::Absolute);
    }

    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return Some(PathIssue::Traversal);
    }

    None
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// 소문자 확장자 (없으면 None)
pub fn extension(path: &str) -> Option<String> {
    Path::new(file_name(path))
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// 확장자로 추정한 파일 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Source,
    Config,
    Lockfile,
    Documentation,
    Other,
}

impl FileCategory {
    pub fn infer(path: &str) -> Self {
        let name = file_name(path);
        if matches!(
            name,
            "package-lock.json" | "yarn.lock" | "pnpm-lock.yaml" | "bun.lockb" | "Cargo.lock"
        ) {
            return FileCategory::Lockfile;
        }
        if matches!(name, "Dockerfile" | "Makefile" | ".env") || name.starts_with(".env.") {
            return FileCategory::Config;
        }

        match extension(path).as_deref() {
            Some("lock") => FileCategory::Lockfile,
            Some("json" | "yml" | "yaml" | "toml" | "ini" | "env" | "conf") => FileCategory::Config,
            Some("md" | "mdx" | "txt" | "rst") => FileCategory::Documentation,
            Some(
                "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" | "rs" | "py" | "go" | "java" | "kt"
                | "rb" | "css" | "scss" | "html" | "sql" | "sh",
            ) => FileCategory::Source,
            _ => FileCategory::Other,
        }
    }
}

/// 의존성 매니페스트, 빌드/배포 설정 등 중요 파일 판별
#[derive(Debug, Clone)]
pub struct CriticalFileSet {
    patterns: Vec<Regex>,
}

impl CriticalFileSet {
    pub fn from_patterns(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    PatchError::Config(format!("invalid critical file pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn is_critical(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        self.patterns.iter().any(|re| re.is_match(&normalized))
    }
}

impl Default for CriticalFileSet {
    fn default() -> Self {
        DEFAULT_CRITICAL.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_safety() {
        assert_eq!(check_path("src/a.ts"), None);
        assert_eq!(check_path("./src/a.ts"), None);
        assert_eq!(check_path(""), Some(PathIssue::Empty));
        assert_eq!(check_path("   "), Some(PathIssue::Empty));
        assert_eq!(check_path("/etc/passwd"), Some(PathIssue::Absolute));
        assert_eq!(check_path("C:\\Windows\\system32"), Some(PathIssue::Absolute));
        assert_eq!(check_path("../../etc/passwd"), Some(PathIssue::Traversal));
        assert_eq!(check_path("src/../../x"), Some(PathIssue::Traversal));
        // 이름에 점이 있는 것은 괜찮음
        assert_eq!(check_path("src/..hidden/a.ts"), None);
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("src/App.TSX").as_deref(), Some("tsx"));
        assert_eq!(extension("Dockerfile"), None);
        assert_eq!(file_name("deploy/Dockerfile"), "Dockerfile");
    }

    #[test]
    fn test_file_category() {
        assert_eq!(FileCategory::infer("src/main.rs"), FileCategory::Source);
        assert_eq!(FileCategory::infer("config/app.yaml"), FileCategory::Config);
        assert_eq!(FileCategory::infer("yarn.lock"), FileCategory::Lockfile);
        assert_eq!(FileCategory::infer("package-lock.json"), FileCategory::Lockfile);
        assert_eq!(FileCategory::infer("README.md"), FileCategory::Documentation);
        assert_eq!(FileCategory::infer("image.png"), FileCategory::Other);
    }

    #[test]
    fn test_default_critical_files() {
        let set = CriticalFileSet::default();
        assert!(set.is_critical("package.json"));
        assert!(set.is_critical("apps/web/package.json"));
        assert!(set.is_critical("Cargo.toml"));
        assert!(set.is_critical(".github/workflows/ci.yml"));
        assert!(set.is_critical("docker-compose.yaml"));
        assert!(!set.is_critical("src/package.json.bak"));
        assert!(!set.is_critical("src/index.ts"));
    }

    #[test]
    fn test_invalid_pattern() {
        let result = CriticalFileSet::from_patterns(&["(".to_string()]);
        assert!(matches!(result, Err(PatchError::Config(_))));
    }
}
