//! 文档 / 检索后端抽象
//!
//! 上层存储只依赖 [`DocumentBackend`] 这组最小原语：建索引、按 id 实时读取、
//! 带条件的写入、过滤 + 排序 + k-NN 检索。
//!
//! | 实现 | 说明 |
//! |------|------|
//! | [`InMemoryBackend`] | 进程内存，语义与远端一致，适合测试 |
//! | [`OpenSearchBackend`] | OpenSearch REST API（HTTPS + Basic Auth） |
//!
//! ## 乐观并发
//!
//! 每个文档带有 `(seq_no, primary_term)` 版本号。[`WriteCondition`] 描述写入前提：
//! 目标不存在（`CreateOnly`）或版本未变（`IfVersion`）。前提不成立时返回
//! [`WriteOutcome::VersionConflict`]，而不是错误。

pub mod memory;
pub mod opensearch;

pub use memory::InMemoryBackend;
pub use opensearch::OpenSearchBackend;

use crate::error::BackendResult;
use crate::memory::container::DistanceMetric;
use async_trait::async_trait;
use serde_json::Value;

/// 文档版本号（对应 OpenSearch 的 `_seq_no` / `_primary_term`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocVersion {
    pub seq_no: u64,
    pub primary_term: u64,
}

/// 按 id 读取到的文档
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub version: DocVersion,
    pub source: Value,
}

/// 写入前提
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// 无条件覆盖
    Overwrite,
    /// 仅当文档不存在时写入
    CreateOnly,
    /// 仅当文档仍处于给定版本时写入
    IfVersion(DocVersion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(DocVersion),
    VersionConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    AlreadyExists,
}

/// 向量字段定义
#[derive(Debug, Clone, PartialEq)]
pub struct VectorField {
    pub field: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

/// 建索引请求
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    /// 需要精确匹配过滤的字段（映射为 keyword）
    pub keyword_fields: Vec<String>,
    /// 只存不索引的字段（如完整的执行状态）
    pub opaque_fields: Vec<String>,
    pub vector: Option<VectorField>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keyword_fields: Vec::new(),
            opaque_fields: Vec::new(),
            vector: None,
        }
    }

    pub fn keyword(mut self, field: &str) -> Self {
        self.keyword_fields.push(field.to_string());
        self
    }

    pub fn opaque(mut self, field: &str) -> Self {
        self.opaque_fields.push(field.to_string());
        self
    }

    pub fn vector(mut self, field: &str, dimension: usize, metric: DistanceMetric) -> Self {
        self.vector = Some(VectorField {
            field: field.to_string(),
            dimension,
            metric,
        });
        self
    }
}

/// 过滤条件；字段名支持 `scope.user_id` 这样的点路径
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    Term { field: String, value: Value },
    GreaterThan { field: String, value: u64 },
}

impl FieldFilter {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        FieldFilter::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn greater_than(field: &str, value: u64) -> Self {
        FieldFilter::GreaterThan {
            field: field.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnnQuery {
    pub field: String,
    pub vector: Vec<f32>,
    pub k: usize,
}

/// 检索请求：过滤 + 排序 + 条数，或带过滤的 k-NN
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub filters: Vec<FieldFilter>,
    pub sort: Vec<SortField>,
    pub size: usize,
    pub knn: Option<KnnQuery>,
}

impl SearchQuery {
    pub fn new(size: usize) -> Self {
        Self {
            filters: Vec::new(),
            sort: Vec::new(),
            size,
            knn: None,
        }
    }

    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort_asc(mut self, field: &str) -> Self {
        self.sort.push(SortField {
            field: field.to_string(),
            descending: false,
        });
        self
    }

    pub fn sort_desc(mut self, field: &str) -> Self {
        self.sort.push(SortField {
            field: field.to_string(),
            descending: true,
        });
        self
    }

    pub fn knn(mut self, field: &str, vector: Vec<f32>, k: usize) -> Self {
        self.knn = Some(KnnQuery {
            field: field.to_string(),
            vector,
            k,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f32>,
    pub source: Value,
}

/// 远端文档存储的最小接口
///
/// 实现必须可被多个逻辑线程并发使用；所有写入对随后的 `get_document` 与 `search`
/// 立即可见。
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// 创建索引；已存在时返回 [`IndexOutcome::AlreadyExists`]
    async fn create_index(&self, spec: &IndexSpec) -> BackendResult<IndexOutcome>;

    /// 按 id 实时读取文档
    async fn get_document(&self, index: &str, id: &str) -> BackendResult<Option<StoredDocument>>;

    /// 带条件写入文档
    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: &Value,
        condition: WriteCondition,
    ) -> BackendResult<WriteOutcome>;

    /// 检索；索引不存在时返回空结果
    async fn search(&self, index: &str, query: &SearchQuery) -> BackendResult<Vec<SearchHit>>;
}
