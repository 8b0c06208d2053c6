//! 进程内存后端
//!
//! 与远端后端保持相同的版本与可见性语义（写入即刻可见、条件写入原子执行），
//! 重启即清空，适合测试和单进程开发。

use super::{
    DocVersion, DocumentBackend, FieldFilter, IndexOutcome, IndexSpec, SearchHit, SearchQuery,
    SortField, StoredDocument, WriteCondition, WriteOutcome,
};
use crate::error::BackendResult;
use crate::memory::store::cosine_similarity;
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

const PRIMARY_TERM: u64 = 1;

struct StoredEntry {
    source: Value,
    version: DocVersion,
}

#[derive(Default)]
struct IndexData {
    spec: Option<IndexSpec>,
    docs: HashMap<String, StoredEntry>,
    next_seq_no: u64,
}

/// 进程内存后端，所有索引保存在一把读写锁之下
pub struct InMemoryBackend {
    indices: RwLock<HashMap<String, IndexData>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
        }
    }

    /// 索引中的文档数量（索引不存在时为 0）
    pub async fn document_count(&self, index: &str) -> usize {
        self.indices
            .read()
            .await
            .get(index)
            .map(|data| data.docs.len())
            .unwrap_or(0)
    }

    /// 索引是否已显式创建
    pub async fn index_exists(&self, index: &str) -> bool {
        self.indices
            .read()
            .await
            .get(index)
            .map(|data| data.spec.is_some())
            .unwrap_or(false)
    }

    /// 已创建索引的定义
    pub async fn index_spec(&self, index: &str) -> Option<IndexSpec> {
        self.indices
            .read()
            .await
            .get(index)
            .and_then(|data| data.spec.clone())
    }
}

#[async_trait]
impl DocumentBackend for InMemoryBackend {
    async fn create_index(&self, spec: &IndexSpec) -> BackendResult<IndexOutcome> {
        let mut indices = self.indices.write().await;
        let data = indices.entry(spec.name.clone()).or_default();
        if data.spec.is_some() {
            return Ok(IndexOutcome::AlreadyExists);
        }
        data.spec = Some(spec.clone());
        Ok(IndexOutcome::Created)
    }

    async fn get_document(&self, index: &str, id: &str) -> BackendResult<Option<StoredDocument>> {
        let indices = self.indices.read().await;
        Ok(indices
            .get(index)
            .and_then(|data| data.docs.get(id))
            .map(|entry| StoredDocument {
                id: id.to_string(),
                version: entry.version,
                source: entry.source.clone(),
            }))
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: &Value,
        condition: WriteCondition,
    ) -> BackendResult<WriteOutcome> {
        let mut indices = self.indices.write().await;
        // 与远端一致：写入不存在的索引时自动创建
        let data = indices.entry(index.to_string()).or_default();

        let current = data.docs.get(id).map(|entry| entry.version);
        let allowed = match condition {
            WriteCondition::Overwrite => true,
            WriteCondition::CreateOnly => current.is_none(),
            WriteCondition::IfVersion(expected) => current == Some(expected),
        };
        if !allowed {
            return Ok(WriteOutcome::VersionConflict);
        }

        let version = DocVersion {
            seq_no: data.next_seq_no,
            primary_term: PRIMARY_TERM,
        };
        data.next_seq_no += 1;
        data.docs.insert(
            id.to_string(),
            StoredEntry {
                source: source.clone(),
                version,
            },
        );
        Ok(WriteOutcome::Written(version))
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> BackendResult<Vec<SearchHit>> {
        let indices = self.indices.read().await;
        let Some(data) = indices.get(index) else {
            return Ok(vec![]);
        };

        let mut hits: Vec<SearchHit> = data
            .docs
            .iter()
            .filter(|(_, entry)| query.filters.iter().all(|f| matches_filter(&entry.source, f)))
            .map(|(id, entry)| SearchHit {
                id: id.clone(),
                score: None,
                source: entry.source.clone(),
            })
            .collect();

        // 先按 id 排序，保证同分结果的顺序稳定
        hits.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(knn) = &query.knn {
            let mut scored: Vec<SearchHit> = hits
                .into_iter()
                .filter_map(|mut hit| {
                    let vector = read_vector(lookup(&hit.source, &knn.field)?)?;
                    if vector.len() != knn.vector.len() {
                        return None;
                    }
                    hit.score = Some(cosine_similarity(&knn.vector, &vector));
                    Some(hit)
                })
                .collect();
            // 同分时按 sort 字段决定先后
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| compare_by_sort(&query.sort, a, b))
            });
            scored.truncate(knn.k.min(query.size));
            return Ok(scored);
        }

        if !query.sort.is_empty() {
            hits.sort_by(|a, b| compare_by_sort(&query.sort, a, b));
        }
        hits.truncate(query.size);
        Ok(hits)
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn lookup<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(source, |value, key| value.get(key))
}

fn matches_filter(source: &Value, filter: &FieldFilter) -> bool {
    match filter {
        FieldFilter::Term { field, value } => lookup(source, field) == Some(value),
        FieldFilter::GreaterThan { field, value } => lookup(source, field)
            .and_then(Value::as_u64)
            .map(|v| v > *value)
            .unwrap_or(false),
    }
}

fn read_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn compare_by_sort(sort: &[SortField], a: &SearchHit, b: &SearchHit) -> Ordering {
    for field in sort {
        let ord = compare_values(lookup(&a.source, &field.field), lookup(&b.source, &field.field));
        let ord = if field.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        // RFC 3339 时间戳的小数位数不固定，按时间而不是按字符串比较
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
