//! 工具系统
//!
//! 定义 [`Tool`] trait 和 [`ToolManager`]（注册、执行、并发限流、超时）。
//! 记忆工具位于 [`builtin`]。

pub mod builtin;

use crate::error::{BackendError, MemoryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// 工具执行结果
///
/// 成功时 `output` 为工具的结构化输出；失败时 `error` 为 `{"error": kind, "message": ...}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<Value>,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn error(error: Value) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error),
        }
    }

    /// 把可以交还给模型的错误（输入不合法、目标不存在）转换为失败结果，其余错误原样返回
    pub fn from_recoverable(err: MemoryError) -> Result<Self> {
        match err {
            MemoryError::Validation(_) | MemoryError::NotFound(_) => Ok(Self::error(json!({
                "error": err.kind(),
                "message": err.to_string(),
            }))),
            other => Err(other),
        }
    }
}

/// 工具执行配置：超时、并发度
#[derive(Debug, Clone)]
pub struct ToolExecutionConfig {
    /// 单次工具执行超时（毫秒）。0 = 不限制。默认 30_000
    pub timeout_ms: u64,
    /// 最大并发数。`None` = 不限制
    pub max_concurrency: Option<usize>,
}

impl Default for ToolExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_concurrency: None,
        }
    }
}

pub type ToolParameters = HashMap<String, Value>;

/// 把模型给出的 JSON 参数字符串解析为 [`ToolParameters`]
pub fn parse_arguments(raw: &str) -> Result<ToolParameters> {
    if raw.trim().is_empty() {
        return Ok(ToolParameters::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| MemoryError::Validation(format!("tool arguments are not a JSON object: {e}")))
}

/// 工具接口
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// 工具参数的 JSON Schema 定义
    fn parameters(&self) -> Value;
    async fn execute(&self, parameters: ToolParameters) -> Result<ToolResult>;
}

/// OpenAI function calling 格式的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            },
        }
    }
}

pub struct ToolManager {
    tools: HashMap<String, Box<dyn Tool>>,
    config: ToolExecutionConfig,
    /// 并发限流器：`Some(sem)` 表示最多同时执行 N 个工具
    semaphore: Option<Arc<Semaphore>>,
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolManager {
    pub fn new() -> Self {
        Self::new_with_config(ToolExecutionConfig::default())
    }

    pub fn new_with_config(config: ToolExecutionConfig) -> Self {
        let semaphore = config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            tools: HashMap::new(),
            semaphore,
            config,
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn register_tools(&mut self, tools: Vec<Box<dyn Tool>>) {
        for tool in tools {
            self.register(tool);
        }
    }

    /// 已注册的工具名（按字母排序）
    pub fn list_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|name| name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn get_tool(&self, tool_name: &str) -> Option<&dyn Tool> {
        self.tools.get(tool_name).map(|tool| &**tool)
    }

    pub fn get_tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition::from_tool(&**tool))
            .collect();
        definitions.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        definitions
    }

    pub async fn execute_tool(&self, tool_name: &str, parameters: ToolParameters) -> Result<ToolResult> {
        let tool = self
            .get_tool(tool_name)
            .ok_or_else(|| MemoryError::Validation(format!("unknown tool '{tool_name}'")))?;

        let _permit = match &self.semaphore {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };

        debug!(tool = %tool_name, "🔧 执行工具");
        if self.config.timeout_ms == 0 {
            return tool.execute(parameters).await;
        }
        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, tool.execute(parameters)).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::BackendUnavailable {
                operation: format!("tool:{tool_name}"),
                attempts: 1,
                source: BackendError::Timeout(timeout),
            }),
        }
    }
}
