//! OpenSearch REST 后端
//!
//! 通过 HTTPS + Basic Auth 访问集群，写入统一带 `refresh=wait_for`，
//! 保证写入对随后的检索可见。
//!
//! | 操作 | 请求 |
//! |------|------|
//! | 建索引 | `PUT /{index}` |
//! | 读取 | `GET /{index}/_doc/{id}` |
//! | 覆盖写 | `PUT /{index}/_doc/{id}` |
//! | 仅创建 | `PUT /{index}/_create/{id}` |
//! | 版本写 | `PUT /{index}/_doc/{id}?if_seq_no=..&if_primary_term=..` |
//! | 检索 | `POST /{index}/_search` |

use super::{
    DocVersion, DocumentBackend, FieldFilter, IndexOutcome, IndexSpec, SearchHit, SearchQuery,
    StoredDocument, WriteCondition, WriteOutcome,
};
use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult, ConfigError, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct OpenSearchBackend {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl OpenSearchBackend {
    /// 根据配置构建客户端；`verify_tls=false` 时才会跳过证书校验
    pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| ConfigError::InvalidValue {
            field: "backend.url".to_string(),
            message: e.to_string(),
        })?;
        if !config.verify_tls {
            warn!(url = %config.url, "⚠️ TLS 证书校验已关闭");
        }
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "backend".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        info!(url = %base_url, "🔌 OpenSearchBackend 初始化");
        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidResponse(format!("invalid base url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }
}

#[async_trait]
impl DocumentBackend for OpenSearchBackend {
    async fn create_index(&self, spec: &IndexSpec) -> BackendResult<IndexOutcome> {
        let url = self.url(&[&spec.name])?;
        let response = self
            .request(Method::PUT, url)
            .json(&index_body(spec))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(index = %spec.name, "📦 索引已创建");
            return Ok(IndexOutcome::Created);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            debug!(index = %spec.name, "索引已存在");
            return Ok(IndexOutcome::AlreadyExists);
        }
        Err(BackendError::Api {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn get_document(&self, index: &str, id: &str) -> BackendResult<Option<StoredDocument>> {
        let url = self.url(&[index, "_doc", id])?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: GetResponse = parse_json(response).await?;
        if !body.found {
            return Ok(None);
        }
        let (Some(seq_no), Some(primary_term), Some(source)) =
            (body.seq_no, body.primary_term, body.source)
        else {
            return Err(BackendError::InvalidResponse(format!(
                "document {index}/{id} is missing version or source"
            )));
        };
        Ok(Some(StoredDocument {
            id: body.id,
            version: DocVersion {
                seq_no,
                primary_term,
            },
            source,
        }))
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        source: &Value,
        condition: WriteCondition,
    ) -> BackendResult<WriteOutcome> {
        let endpoint = match condition {
            WriteCondition::CreateOnly => "_create",
            WriteCondition::Overwrite | WriteCondition::IfVersion(_) => "_doc",
        };
        let mut url = self.url(&[index, endpoint, id])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("refresh", "wait_for");
            if let WriteCondition::IfVersion(version) = condition {
                query.append_pair("if_seq_no", &version.seq_no.to_string());
                query.append_pair("if_primary_term", &version.primary_term.to_string());
            }
        }

        let response = self.request(Method::PUT, url).json(source).send().await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(index, id, "版本冲突");
            return Ok(WriteOutcome::VersionConflict);
        }
        let body: WriteResponse = parse_json(response).await?;
        Ok(WriteOutcome::Written(DocVersion {
            seq_no: body.seq_no,
            primary_term: body.primary_term,
        }))
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> BackendResult<Vec<SearchHit>> {
        let url = self.url(&[index, "_search"])?;
        let response = self
            .request(Method::POST, url)
            .json(&search_body(query))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(vec![]);
        }
        let body: SearchResponse = parse_json(response).await?;
        Ok(body
            .hits
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                id: hit.id,
                score: hit.score,
                source: hit.source,
            })
            .collect())
    }
}

// ── 请求体 ────────────────────────────────────────────────────────────────────

fn index_body(spec: &IndexSpec) -> Value {
    let mut properties = Map::new();
    for field in &spec.keyword_fields {
        insert_path(&mut properties, field, json!({"type": "keyword"}));
    }
    for field in &spec.opaque_fields {
        insert_path(&mut properties, field, json!({"type": "object", "enabled": false}));
    }
    if let Some(vector) = &spec.vector {
        insert_path(
            &mut properties,
            &vector.field,
            json!({
                "type": "knn_vector",
                "dimension": vector.dimension,
                "method": {
                    "name": "hnsw",
                    "engine": "lucene",
                    "space_type": vector.metric.space_type(),
                }
            }),
        );
    }
    json!({
        "settings": { "index": { "knn": spec.vector.is_some() } },
        "mappings": { "properties": properties },
    })
}

/// 把 `scope.user_id` 这样的点路径展开成嵌套的 `properties` 映射
fn insert_path(properties: &mut Map<String, Value>, path: &str, mapping: Value) {
    match path.split_once('.') {
        None => {
            properties.insert(path.to_string(), mapping);
        }
        Some((head, rest)) => {
            let entry = properties
                .entry(head.to_string())
                .or_insert_with(|| json!({"properties": {}}));
            if let Some(Value::Object(inner)) = entry.get_mut("properties") {
                insert_path(inner, rest, mapping);
            }
        }
    }
}

fn filter_clause(filter: &FieldFilter) -> Value {
    match filter {
        FieldFilter::Term { field, value } => json!({"term": {field: value}}),
        FieldFilter::GreaterThan { field, value } => json!({"range": {field: {"gt": value}}}),
    }
}

fn search_body(query: &SearchQuery) -> Value {
    let filters: Vec<Value> = query.filters.iter().map(filter_clause).collect();
    let bool_filter = json!({"bool": {"filter": filters}});

    let mut body = Map::new();
    body.insert("size".to_string(), json!(query.size));
    match &query.knn {
        Some(knn) => {
            let mut clause = json!({"vector": knn.vector, "k": knn.k});
            if !query.filters.is_empty() {
                clause["filter"] = bool_filter;
            }
            body.insert("query".to_string(), json!({"knn": {knn.field.clone(): clause}}));
        }
        None => {
            body.insert("query".to_string(), bool_filter);
        }
    }
    if !query.sort.is_empty() {
        // k-NN 查询中 sort 只用于同分排序，相似度仍是第一排序键
        let primary = query
            .knn
            .as_ref()
            .map(|_| json!({"_score": {"order": "desc"}}));
        let sort: Vec<Value> = primary
            .into_iter()
            .chain(query.sort.iter().map(|s| {
                let order = if s.descending { "desc" } else { "asc" };
                json!({s.field.clone(): {"order": order}})
            }))
            .collect();
        body.insert("sort".to_string(), Value::Array(sort));
    }
    Value::Object(body)
}

// ── 响应体 ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GetResponse {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

#[derive(Deserialize)]
struct WriteResponse {
    #[serde(rename = "_seq_no")]
    seq_no: u64,
    #[serde(rename = "_primary_term")]
    primary_term: u64,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f32>,
    #[serde(rename = "_source", default)]
    source: Value,
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> BackendResult<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(BackendError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))
}
