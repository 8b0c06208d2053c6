//! 容器管理
//!
//! 一个容器（[`MemoryContainer`]）对应远端的一组索引：
//!
//! | 索引 | 内容 |
//! |------|------|
//! | `<name>` | checkpoint 与会话消息 |
//! | `<name>_memory` | 长期记忆（带向量字段） |
//!
//! 容器元数据保存在注册表索引中，每个容器一份文档，文档 id 即容器名。
//! 首次创建通过"仅创建"条件写入抢占，竞争失败的一方回读胜者的文档并校验 schema，
//! 因此并发调用总会收敛到同一个容器。

use crate::backend::{DocumentBackend, IndexSpec, WriteCondition, WriteOutcome};
use crate::config::{ContainerConfig, MemoryConfig};
use crate::error::{MemoryError, Result};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 容器 id（UUID v4）
pub type ContainerId = String;

/// 向量距离度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    InnerProduct,
}

impl DistanceMetric {
    /// 对应 OpenSearch k-NN 插件的 `space_type`
    pub fn space_type(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosinesimil",
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "innerproduct",
        }
    }
}

/// 容器的向量 schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSchema {
    pub dimension: usize,
    pub metric: DistanceMetric,
}

impl Default for ContainerSchema {
    fn default() -> Self {
        Self {
            dimension: 1024,
            metric: DistanceMetric::Cosine,
        }
    }
}

impl ContainerSchema {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self { dimension, metric }
    }

    fn describe_difference(&self, requested: &ContainerSchema) -> Option<String> {
        if self.dimension != requested.dimension {
            return Some(format!(
                "existing dimension {} != requested {}",
                self.dimension, requested.dimension
            ));
        }
        if self.metric != requested.metric {
            return Some(format!(
                "existing metric {:?} != requested {:?}",
                self.metric, requested.metric
            ));
        }
        None
    }
}

/// 已初始化的容器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryContainer {
    pub name: String,
    pub id: ContainerId,
    pub schema: ContainerSchema,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MemoryContainer {
    /// checkpoint 与会话消息所在索引
    pub fn state_index(&self) -> &str {
        &self.name
    }

    /// 长期记忆所在索引
    pub fn memory_index(&self) -> String {
        format!("{}_memory", self.name)
    }
}

/// 负责容器的幂等创建与校验，并向各存储提供共享的后端与重试策略
pub struct ContainerManager {
    backend: Arc<dyn DocumentBackend>,
    retry: RetryPolicy,
    registry_index: String,
    default_schema: ContainerSchema,
    /// 新建容器时附带的说明；已存在的容器保留注册时的说明
    description: Option<String>,
    cache: RwLock<HashMap<String, MemoryContainer>>,
}

impl ContainerManager {
    pub fn new(backend: Arc<dyn DocumentBackend>, retry: RetryPolicy, config: &ContainerConfig) -> Self {
        Self {
            backend,
            retry,
            registry_index: config.registry_index.clone(),
            default_schema: ContainerSchema::default(),
            description: config.description.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 只需要状态索引的调用方（checkpoint、会话）在容器不存在时使用的 schema
    pub fn with_default_schema(mut self, schema: ContainerSchema) -> Self {
        self.default_schema = schema;
        self
    }

    /// 以 OpenSearch 为后端构建
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        let backend = crate::backend::OpenSearchBackend::new(&config.backend, config.attempt_timeout())?;
        Ok(Self::new(
            Arc::new(backend),
            RetryPolicy::from(&config.retry),
            &config.containers,
        )
        .with_default_schema(ContainerSchema::new(
            config.memory.dimension,
            config.memory.metric,
        )))
    }

    pub fn backend(&self) -> Arc<dyn DocumentBackend> {
        self.backend.clone()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// 确保容器存在并返回其 id
    pub async fn ensure_container(&self, name: &str, schema: ContainerSchema) -> Result<ContainerId> {
        Ok(self.ensure(name, schema).await?.id)
    }

    /// 确保容器存在：不存在则创建，存在则校验 schema
    ///
    /// 对同一名称的重复调用只在第一次访问远端。
    pub async fn ensure(&self, name: &str, schema: ContainerSchema) -> Result<MemoryContainer> {
        self.ensure_inner(name, Some(schema)).await
    }

    /// 确保容器存在，但接受已存在容器的任意 schema；不存在时以默认 schema 创建
    pub async fn ensure_default(&self, name: &str) -> Result<MemoryContainer> {
        self.ensure_inner(name, None).await
    }

    async fn ensure_inner(&self, name: &str, schema: Option<ContainerSchema>) -> Result<MemoryContainer> {
        validate_name(name)?;
        if schema.is_some_and(|s| s.dimension == 0) {
            return Err(MemoryError::Validation(
                "container dimension must be greater than 0".to_string(),
            ));
        }

        if let Some(cached) = self.cache.read().await.get(name) {
            check_schema(cached, schema.as_ref())?;
            return Ok(cached.clone());
        }

        self.create_index(&IndexSpec::new(&self.registry_index).keyword("name").keyword("id"))
            .await?;

        let container = match self.read_registry(name).await? {
            Some(existing) => existing,
            None => self.claim(name, schema.unwrap_or(self.default_schema)).await?,
        };
        check_schema(&container, schema.as_ref())?;

        // 注册表文档先于索引写入，索引创建失败时下次调用会补齐
        self.create_index(&state_index_spec(&container)).await?;
        self.create_index(&memory_index_spec(&container)).await?;

        self.cache
            .write()
            .await
            .insert(name.to_string(), container.clone());
        info!(container = %name, id = %container.id, dimension = container.schema.dimension, "📦 容器就绪");
        Ok(container)
    }

    /// 查询已存在的容器；不存在时返回 `NotFound`
    pub async fn describe(&self, name: &str) -> Result<MemoryContainer> {
        validate_name(name)?;
        if let Some(cached) = self.cache.read().await.get(name) {
            return Ok(cached.clone());
        }
        self.read_registry(name)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("container '{name}'")))
    }

    async fn claim(&self, name: &str, schema: ContainerSchema) -> Result<MemoryContainer> {
        let candidate = MemoryContainer {
            name: name.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            schema,
            created_at: Utc::now(),
            description: self.description.clone(),
        };
        let source = serde_json::to_value(&candidate)?;

        let backend = self.backend.as_ref();
        let index = self.registry_index.as_str();
        let source_ref = &source;
        let outcome = self
            .retry
            .run("register_container", move || {
                backend.put_document(index, name, source_ref, WriteCondition::CreateOnly)
            })
            .await?;

        match outcome {
            WriteOutcome::Written(_) => {
                info!(container = %name, id = %candidate.id, "🆕 容器已注册");
                Ok(candidate)
            }
            WriteOutcome::VersionConflict => {
                // 注册竞争失败（或重试前的写入已落盘），以注册表中的文档为准
                debug!(container = %name, "容器已被并发注册，回读");
                self.read_registry(name).await?.ok_or_else(|| {
                    MemoryError::Conflict(format!("container '{name}' vanished during registration"))
                })
            }
        }
    }

    async fn read_registry(&self, name: &str) -> Result<Option<MemoryContainer>> {
        let backend = self.backend.as_ref();
        let index = self.registry_index.as_str();
        let doc = self
            .retry
            .run("get_container", move || backend.get_document(index, name))
            .await?;
        match doc {
            Some(doc) => Ok(Some(decode(doc.source)?)),
            None => Ok(None),
        }
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        let backend = self.backend.as_ref();
        self.retry
            .run("create_index", move || backend.create_index(spec))
            .await?;
        Ok(())
    }
}

/// 反序列化远端文档中的 `source` 字段
pub(crate) fn decode<T: serde::de::DeserializeOwned>(source: Value) -> Result<T> {
    Ok(serde_json::from_value(source)?)
}

fn check_schema(container: &MemoryContainer, requested: Option<&ContainerSchema>) -> Result<()> {
    let Some(requested) = requested else {
        return Ok(());
    };
    match container.schema.describe_difference(requested) {
        Some(message) => Err(MemoryError::SchemaMismatch {
            container: container.name.clone(),
            message,
        }),
        None => Ok(()),
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if name.is_empty() || !valid_chars || name.starts_with('_') || name.starts_with('-') {
        return Err(MemoryError::Validation(format!(
            "invalid container name '{name}': use lowercase letters, digits, '_' or '-'"
        )));
    }
    Ok(())
}

fn state_index_spec(container: &MemoryContainer) -> IndexSpec {
    IndexSpec::new(container.state_index())
        .keyword("kind")
        .keyword("container_id")
        .keyword("thread_id")
        .keyword("session_id")
        .keyword("write_id")
        .keyword("append_id")
        .opaque("state")
}

fn memory_index_spec(container: &MemoryContainer) -> IndexSpec {
    IndexSpec::new(container.memory_index())
        .keyword("container_id")
        .keyword("scope.user_id")
        .keyword("scope.agent_id")
        .keyword("scope.session_id")
        .keyword("content_hash")
        .opaque("metadata")
        .vector(
            "embedding",
            container.schema.dimension,
            container.schema.metric,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn manager(backend: Arc<InMemoryBackend>) -> ContainerManager {
        ContainerManager::new(backend, RetryPolicy::no_retry(), &ContainerConfig::default())
    }

    #[tokio::test]
    async fn test_ensure_twice_is_noop() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone());
        let schema = ContainerSchema::new(1024, DistanceMetric::Cosine);

        let first = manager.ensure_container("facts", schema).await.unwrap();
        let second = manager.ensure_container("facts", schema).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.document_count("agentic_memory_containers").await, 1);
        assert!(backend.index_exists("facts").await);

        let spec = backend.index_spec("facts_memory").await.unwrap();
        assert_eq!(spec.vector.unwrap().dimension, 1024);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let backend = Arc::new(InMemoryBackend::new());
        manager(backend.clone())
            .ensure_container("facts", ContainerSchema::new(1024, DistanceMetric::Cosine))
            .await
            .unwrap();

        // 新的 manager 没有缓存，必须从注册表发现不一致
        let err = manager(backend)
            .ensure_container("facts", ContainerSchema::new(768, DistanceMetric::Cosine))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_cached_container_still_checks_schema() {
        let manager = manager(Arc::new(InMemoryBackend::new()));
        manager
            .ensure_container("facts", ContainerSchema::default())
            .await
            .unwrap();
        let err = manager
            .ensure_container("facts", ContainerSchema::new(1024, DistanceMetric::L2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[tokio::test]
    async fn test_concurrent_ensure_converges() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager(backend.clone());
            handles.push(tokio::spawn(async move {
                manager
                    .ensure_container("shared", ContainerSchema::default())
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(backend.document_count("agentic_memory_containers").await, 1);
    }

    #[tokio::test]
    async fn test_ensure_default_accepts_existing_schema() {
        let backend = Arc::new(InMemoryBackend::new());
        let created = manager(backend.clone())
            .ensure("facts", ContainerSchema::new(384, DistanceMetric::L2))
            .await
            .unwrap();

        let other = manager(backend.clone());
        assert_eq!(other.ensure_default("facts").await.unwrap(), created);

        let fresh = manager(backend)
            .with_default_schema(ContainerSchema::new(8, DistanceMetric::Cosine))
            .ensure_default("threads")
            .await
            .unwrap();
        assert_eq!(fresh.schema.dimension, 8);
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let manager = manager(Arc::new(InMemoryBackend::new()));
        for name in ["", "Facts", "_hidden", "-dash", "a b", "x/y"] {
            let err = manager
                .ensure_container(name, ContainerSchema::default())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation_error", "name: {name:?}");
        }
    }

    #[tokio::test]
    async fn test_describe_missing_container() {
        let manager = manager(Arc::new(InMemoryBackend::new()));
        let err = manager.describe("ghost").await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));

        let created = manager.ensure("ghost", ContainerSchema::default()).await.unwrap();
        assert_eq!(manager.describe("ghost").await.unwrap(), created);
        assert_eq!(created.description, None);
    }

    #[tokio::test]
    async fn test_description_is_kept_by_first_registrant() {
        let backend = Arc::new(InMemoryBackend::new());
        let config = ContainerConfig {
            description: Some("Strands agent long-term memory".to_string()),
            ..ContainerConfig::default()
        };
        let first = ContainerManager::new(backend.clone(), RetryPolicy::no_retry(), &config);
        first.ensure("facts", ContainerSchema::default()).await.unwrap();

        // 不同说明的后来者沿用注册表中已有的说明
        let later = ContainerManager::new(
            backend.clone(),
            RetryPolicy::no_retry(),
            &ContainerConfig {
                description: Some("something else".to_string()),
                ..ContainerConfig::default()
            },
        );
        let seen = later.ensure_default("facts").await.unwrap();
        assert_eq!(seen.description.as_deref(), Some("Strands agent long-term memory"));
        assert_eq!(
            manager(backend).describe("facts").await.unwrap().description.as_deref(),
            Some("Strands agent long-term memory")
        );
    }
}
