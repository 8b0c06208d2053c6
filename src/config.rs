//! 配置加载
//!
//! 所有组件都通过构造函数接收显式的 [`MemoryConfig`]，不存在进程级全局配置。
//! 配置来源二选一：
//!
//! - YAML 文件：[`MemoryConfig::load`]
//! - 环境变量（支持 `.env`）：[`MemoryConfig::from_env`]
//!
//! ```text
//! OPENSEARCH_URL=https://localhost:9200
//! OPENSEARCH_USERNAME=admin
//! OPENSEARCH_PASSWORD=...
//! OPENSEARCH_VERIFY_SSL=true
//! MEMORY_CONTAINER_NAME=langgraph_short_term
//! MEMORY_CONTAINER_DESCRIPTION=...
//! ```

use crate::error::{ConfigError, Result};
use crate::memory::container::DistanceMetric;
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 远端后端连接配置
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 集群地址，如 `https://localhost:9200`
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// TLS 证书校验，默认开启
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// 后端调用的超时与重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）。默认 3
    pub max_attempts: u32,
    /// 首次重试前等待（毫秒），之后按 `multiplier` 指数增长。默认 100
    pub initial_backoff_ms: u64,
    /// 单次等待上限（毫秒）。默认 2000
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// 是否给退避时间加随机抖动。默认 true
    pub jitter: bool,
    /// 单次请求超时（毫秒）。默认 10_000
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: 10_000,
        }
    }
}

/// 容器注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// 保存容器元数据的注册表索引
    pub registry_index: String,
    /// 新建容器时写入注册表的说明文字
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            registry_index: "agentic_memory_containers".to_string(),
            description: None,
        }
    }
}

/// Checkpoint 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub container_name: String,
    /// 版本冲突时的内部重试次数。默认 3
    pub max_conflict_retries: u32,
    /// `list` 分页大小。默认 100
    pub page_size: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            container_name: "langgraph_short_term".to_string(),
            max_conflict_retries: 3,
            page_size: 100,
        }
    }
}

/// 会话记录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub container_name: String,
    /// 瞬时故障重试时是否识别并跳过已落盘的同一次追加。默认 false（至少一次语义）
    pub dedup_retried_appends: bool,
    /// 连续跳过多少个已占槽位后改为重新定位会话末尾。默认 16
    pub max_slot_skips: u32,
    pub page_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            container_name: "strands_short_term".to_string(),
            dedup_retried_appends: false,
            max_slot_skips: 16,
            page_size: 100,
        }
    }
}

/// 长期记忆索引配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryIndexConfig {
    pub container_name: String,
    /// 向量维度，必须与 embedding 模型输出一致。默认 1024
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// 同一 scope 下相同内容哈希只保留一条记录
    pub dedup_by_content_hash: bool,
    /// k-NN 候选池倍数（候选数 = k × multiplier）。默认 4
    pub candidate_multiplier: usize,
    /// 低于该相似度的结果被丢弃
    pub min_score: Option<f32>,
    /// 工具未指定 k 时的默认值。默认 5
    pub default_k: usize,
}

impl Default for MemoryIndexConfig {
    fn default() -> Self {
        Self {
            container_name: "strands_long_term".to_string(),
            dimension: 1024,
            metric: DistanceMetric::Cosine,
            dedup_by_content_hash: false,
            candidate_multiplier: 4,
            min_score: None,
            default_k: 5,
        }
    }
}

/// 记忆工具默认的作用域
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub containers: ContainerConfig,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub memory: MemoryIndexConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
}

impl MemoryConfig {
    /// 以给定后端地址构建其余字段均为默认值的配置
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig {
                url: url.into(),
                username: username.into(),
                password: password.into(),
                verify_tls: true,
            },
            retry: RetryConfig::default(),
            containers: ContainerConfig::default(),
            checkpoints: CheckpointConfig::default(),
            sessions: SessionConfig::default(),
            memory: MemoryIndexConfig::default(),
            scope: ScopeConfig::default(),
        }
    }

    /// 从 YAML 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: MemoryConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// 从环境变量加载（会先尝试读取 `.env`）
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 以任意键值来源构建配置，便于测试时注入
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingField(key.to_string()))
        };

        let mut config = Self::new(
            required("OPENSEARCH_URL")?,
            required("OPENSEARCH_USERNAME")?,
            lookup("OPENSEARCH_PASSWORD").unwrap_or_default(),
        );

        if let Some(flag) = lookup("OPENSEARCH_VERIFY_SSL") {
            config.backend.verify_tls = parse_bool("OPENSEARCH_VERIFY_SSL", &flag)?;
        }
        if let Some(name) = lookup("MEMORY_CONTAINER_NAME") {
            config.checkpoints.container_name = name.clone();
            config.sessions.container_name = name.clone();
            config.memory.container_name = name;
        }
        config.containers.description = lookup("MEMORY_CONTAINER_DESCRIPTION")
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if let Some(dim) = lookup("EMBEDDING_DIMENSION") {
            config.memory.dimension =
                dim.trim()
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue {
                        field: "EMBEDDING_DIMENSION".to_string(),
                        message: format!("{e}"),
                    })?;
        }
        config.scope = ScopeConfig {
            user_id: lookup("USER_ID"),
            agent_id: lookup("AGENT_ID"),
            session_id: lookup("SESSION_ID"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.url.trim().is_empty() {
            return Err(invalid("backend.url", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.memory.dimension == 0 {
            return Err(invalid("memory.dimension", "must be greater than 0"));
        }
        if self.memory.default_k == 0 || self.memory.default_k > crate::memory::store::MAX_K {
            return Err(invalid(
                "memory.default_k",
                &format!("must be within 1..={}", crate::memory::store::MAX_K),
            ));
        }
        if self.checkpoints.page_size == 0 || self.sessions.page_size == 0 {
            return Err(invalid("page_size", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.attempt_timeout_ms)
    }
}

fn invalid(field: &str, message: &str) -> crate::error::MemoryError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

fn parse_bool(field: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }
        .into()),
    }
}

fn default_true() -> bool {
    true
}
