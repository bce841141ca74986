use thiserror::Error;

use crate::sync::EntityType;

#[derive(Debug, Error)]
pub enum CivicSyncError {
    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // 上游数据源返回非 2xx
    #[error("HTTP error [{status}]: {message}")]
    Http { status: u16, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// endpoint 模板中仍有未解析的路径参数（例如 `{bill_id}`）
    #[error("Unresolved endpoint template for {entity}: {template}")]
    UnresolvedEndpoint { entity: EntityType, template: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cache error: {0}")]
    Cache(String),

    /// 订阅回调 panic
    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<sled::Error> for CivicSyncError {
    fn from(error: sled::Error) -> Self {
        CivicSyncError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for CivicSyncError {
    fn from(error: serde_json::Error) -> Self {
        CivicSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for CivicSyncError {
    fn from(error: std::io::Error) -> Self {
        CivicSyncError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for CivicSyncError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => CivicSyncError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            },
            None => CivicSyncError::Transport(error.to_string()),
        }
    }
}

impl CivicSyncError {
    /// 判断是否是上游 HTTP 错误
    pub fn is_http_error(&self) -> bool {
        matches!(self, CivicSyncError::Http { .. })
    }

    /// 获取 HTTP 状态码（如果这是一个 HTTP 错误）
    pub fn http_status(&self) -> Option<u16> {
        match self {
            CivicSyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CivicSyncError>;
