use async_trait::async_trait;
use std::collections::HashMap;

/// 토큰 검증 (인증 시스템은 외부에 있음)
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// 유효한 토큰이면 사용자 ID
    async fn verify(&self, token: &str) -> Option<String>;
}

/// 설정 파일의 token → user id 표
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}
