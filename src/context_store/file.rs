//! JSON 文件后端
//!
//! 每条记录一个文件：`<root>/<group_key>/<sha256(key)>.json`，内容为 {key, payload}。
//! 使用 create_new 打开，已存在即视为重复写入。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::context_store::backend::{group_of, ContextBackend};

#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    payload: String,
}

/// 文件系统后端
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    root: PathBuf,
}

/// 目录名只保留安全字符，其余替换为 `_`
fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl JsonFileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn group_dir(&self, group_key: &str) -> PathBuf {
        self.root.join(sanitize_component(group_key))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.group_dir(group_of(key)).join(format!("{}.json", &name[..32]))
    }

    async fn read_record(path: &Path) -> anyhow::Result<Option<FileRecord>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => {
                let record: FileRecord = serde_json::from_str(&data)
                    .with_context(|| format!("corrupted context file {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContextBackend for JsonFileBackend {
    async fn put(&self, key: &str, payload: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let record = FileRecord {
            key: key.to_string(),
            payload: payload.to_string(),
        };
        file.write_all(serde_json::to_string(&record)?.as_bytes()).await?;
        file.flush().await?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(Self::read_record(&self.path_for(key))
            .await?
            .filter(|r| r.key == key)
            .map(|r| r.payload))
    }

    async fn list(&self, group_key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let dir = self.group_dir(group_key);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                if group_of(&record.key) == group_key {
                    records.push((record.key, record.payload));
                }
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_backend_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path());

        assert!(backend.put("g1/quote/abc/t1#0", "{\"a\":1}").await.unwrap());
        assert!(backend.put("g1/quote/abc/t2#0", "{\"a\":2}").await.unwrap());
        assert!(backend.put("g2/quote/abc/t1#0", "{\"a\":3}").await.unwrap());

        assert_eq!(
            backend.get("g1/quote/abc/t1#0").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(backend.get("g1/missing").await.unwrap(), None);

        let listed = backend.list("g1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "g1/quote/abc/t1#0");
        assert!(backend.list("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backend_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path());
        assert!(backend.put("g/k", "first").await.unwrap());
        assert!(!backend.put("g/k", "second").await.unwrap());
        assert_eq!(backend.get("g/k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        JsonFileBackend::new(dir.path()).put("g/k", "v").await.unwrap();
        let reopened = JsonFileBackend::new(dir.path());
        assert_eq!(reopened.get("g/k").await.unwrap().as_deref(), Some("v"));
    }
}
