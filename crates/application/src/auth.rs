use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

/// 凭证校验失败；连接在注册之前就会被关闭
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("credential expired")]
    Expired,
}

/// 握手时调用一次的凭证校验能力
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}
