//! 确定性的 Mock Embedder
//!
//! 同一段文本总是得到同一个向量，可以用 [`with_vector`](MockEmbedder::with_vector)
//! 为特定文本指定向量，便于构造"语义相近"的测试数据。

use crate::error::{MemoryError, Result};
use crate::llm::Embedder;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct MockEmbedder {
    dimension: usize,
    fixed: HashMap<String, Vec<f32>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fixed: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 为 `text` 指定固定向量
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.into(), vector);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// 由文本哈希派生向量，分量落在 [-1, 1]
    fn derive(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        let mut block = 0u32;
        while out.len() < self.dimension {
            let digest = Sha256::new()
                .chain_update(block.to_le_bytes())
                .chain_update(text.as_bytes())
                .finalize();
            for byte in digest.iter() {
                if out.len() == self.dimension {
                    break;
                }
                out.push(*byte as f32 / 127.5 - 1.0);
            }
            block += 1;
        }
        out
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.lock().unwrap().push(text.to_string());
        if text.trim().is_empty() {
            return Err(MemoryError::Validation("cannot embed empty text".to_string()));
        }
        Ok(self
            .fixed
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.derive(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embeddings_are_deterministic() {
        let embedder = MockEmbedder::new(40).with_vector("jazz", vec![1.0; 40]);
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        assert_eq!(a.len(), 40);
        assert_eq!(a, b);
        assert_ne!(a, embedder.embed("world").await.unwrap());
        assert_eq!(embedder.embed("jazz").await.unwrap(), vec![1.0; 40]);
        assert_eq!(embedder.call_count(), 4);
    }
}
