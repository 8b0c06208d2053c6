use std::time::Duration;

/// 持久化层的统一错误类型
///
/// 前五个变体对应对外约定的错误分类；`Config` / `Serialization` 只在本地出错时出现。
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// 引用的 thread / session / container 不存在
    #[error("Not found: {0}")]
    NotFound(String),
    /// 乐观版本竞争在重试预算内未能解决
    #[error("Conflict: {0}")]
    Conflict(String),
    /// 已存在容器的 schema 与请求不一致
    #[error("Schema mismatch for container '{container}': {message}")]
    SchemaMismatch { container: String, message: String },
    /// 输入不合法：向量维度错误、k 越界、空查询等
    #[error("Validation error: {0}")]
    Validation(String),
    /// 网络或后端故障，重试预算已耗尽
    #[error("Backend unavailable during {operation} after {attempts} attempt(s): {source}")]
    BackendUnavailable {
        operation: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },
    /// 配置错误
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    /// 文档序列化 / 反序列化失败
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// 单次后端调用的底层错误，由 [`RetryPolicy`](crate::retry::RetryPolicy) 决定是否重试
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// 网络请求失败
    #[error("network error: {0}")]
    Network(String),
    /// 单次请求超时
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// 后端返回错误状态码
    #[error("backend returned status {status}: {message}")]
    Api { status: u16, message: String },
    /// 响应格式无效
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// 是否属于可重试的瞬时故障（网络、超时、429、5xx）
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) | BackendError::Timeout(_) => true,
            BackendError::Api { status, .. } => *status == 429 || *status >= 500,
            BackendError::InvalidResponse(_) => false,
        }
    }
}

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),
    /// 配置解析失败
    #[error("Failed to parse config: {0}")]
    ParseFailed(String),
    /// 缺少必需的配置项
    #[error("Missing config field: {0}")]
    MissingField(String),
    /// 配置值无效
    #[error("Invalid config value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl MemoryError {
    /// 错误分类的稳定短名，用于工具结果载荷
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::NotFound(_) => "not_found",
            MemoryError::Conflict(_) => "conflict",
            MemoryError::SchemaMismatch { .. } => "schema_mismatch",
            MemoryError::Validation(_) => "validation_error",
            MemoryError::BackendUnavailable { .. } => "backend_unavailable",
            MemoryError::Config(_) => "config_error",
            MemoryError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Network("Request timeout".to_string())
        } else if err.is_connect() {
            BackendError::Network(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MemoryError {
    fn from(err: serde_yaml::Error) -> Self {
        MemoryError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, MemoryError>;
pub type BackendResult<T> = std::result::Result<T, BackendError>;
