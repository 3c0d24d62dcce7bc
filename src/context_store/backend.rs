//! 上下文持久化后端
//!
//! put / get / list(group_key) 三个操作；所有后端都是只追加的：key 已存在时 put 返回 false 且不覆盖。
//! key 的第一个 `/` 之前是 group_key。

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// 持久化后端 trait（内存 / 文件 / SQLite）
#[async_trait]
pub trait ContextBackend: Send + Sync {
    /// 写入一条记录；key 已存在时返回 Ok(false)
    async fn put(&self, key: &str, payload: &str) -> anyhow::Result<bool>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// group_key 下的全部 (key, payload)，按 key 排序
    async fn list(&self, group_key: &str) -> anyhow::Result<Vec<(String, String)>>;
}

/// 从存储 key 中取出 group_key
pub fn group_of(key: &str) -> &str {
    key.split('/').next().unwrap_or(key)
}

/// 内存后端
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContextBackend for InMemoryBackend {
    async fn put(&self, key: &str, payload: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), payload.to_string());
        Ok(true)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, group_key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let prefix = format!("{group_key}/");
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_of() {
        assert_eq!(group_of("abc/tool/d/t#0"), "abc");
        assert_eq!(group_of("plain"), "plain");
    }

    #[tokio::test]
    async fn test_in_memory_is_append_only() {
        let backend = InMemoryBackend::new();
        assert!(backend.put("g/a", "1").await.unwrap());
        assert!(!backend.put("g/a", "2").await.unwrap());
        assert_eq!(backend.get("g/a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_in_memory_list_by_group() {
        let backend = InMemoryBackend::new();
        backend.put("g1/b", "2").await.unwrap();
        backend.put("g1/a", "1").await.unwrap();
        backend.put("g10/a", "x").await.unwrap();
        backend.put("g2/a", "3").await.unwrap();
        let listed = backend.list("g1").await.unwrap();
        assert_eq!(
            listed,
            vec![("g1/a".to_string(), "1".to_string()), ("g1/b".to_string(), "2".to_string())]
        );
        assert!(backend.list("missing").await.unwrap().is_empty());
    }
}
