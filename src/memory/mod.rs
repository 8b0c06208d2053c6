//! 记忆系统
//!
//! 所有状态都保存在一个共享的文档后端（OpenSearch）中，按容器隔离：
//!
//! | 层次 | 实现 | 作用域 |
//! |------|------|--------|
//! | 容器 | [`ContainerManager`] | 索引与 schema 的创建、校验 |
//! | 短期持久化 | [`CheckpointStore`] | 同一线程的有序快照链，跨进程恢复 |
//! | 会话记录 | [`SessionRepository`] | 只追加的对话记录 |
//! | 长期记忆 | [`LongTermMemoryIndex`] | 跨会话的向量检索，按 scope 过滤 |
//!
//! ## 会话持久化（CheckpointStore）
//!
//! ```rust,no_run
//! use agentic_memory::config::MemoryConfig;
//! use agentic_memory::memory::{CheckpointStore, ContainerManager, ThreadState};
//! use agentic_memory::llm::types::Message;
//! use std::sync::Arc;
//!
//! # async fn example() -> agentic_memory::error::Result<()> {
//! let config = MemoryConfig::from_env()?;
//! let manager = Arc::new(ContainerManager::from_config(&config)?);
//! let store = CheckpointStore::new(manager, config.checkpoints.clone());
//!
//! let state = ThreadState::new().with_message(Message::user("你好"));
//! let seq = store.put_checkpoint("alice-thread-1", state, None).await?;
//! let latest = store.get_latest("alice-thread-1").await?;
//! assert_eq!(latest.sequence, seq);
//! # Ok(())
//! # }
//! ```
//!
//! ## 长期记忆（LongTermMemoryIndex）
//!
//! ```rust,no_run
//! use agentic_memory::config::MemoryConfig;
//! use agentic_memory::memory::{ContainerManager, LongTermMemoryIndex, MemoryRecord, MemoryScope};
//! use std::sync::Arc;
//!
//! # async fn example(embedding: Vec<f32>) -> agentic_memory::error::Result<()> {
//! let config = MemoryConfig::from_env()?;
//! let manager = Arc::new(ContainerManager::from_config(&config)?);
//! let index = LongTermMemoryIndex::new(manager, config.memory.clone());
//!
//! let scope = MemoryScope::new().with_user("alice");
//! index
//!     .upsert(MemoryRecord::new(scope.clone(), "用户喜欢爵士乐", embedding.clone()))
//!     .await?;
//! let hits = index.search(&embedding, &scope, 3).await?;
//! println!("命中 {} 条", hits.len());
//! # Ok(())
//! # }
//! ```

pub mod checkpointer;
pub mod container;
pub mod session;
pub mod store;

pub use checkpointer::{Checkpoint, CheckpointStore, ThreadState};
pub use container::{ContainerManager, ContainerSchema, DistanceMetric, MemoryContainer};
pub use session::SessionRepository;
pub use store::{
    LongTermMemoryIndex, MemoryRecord, MemoryScope, Metadata, MetadataValue, ScoredMemory,
};
