//! 证据账本：运行级、只追加
//!
//! 后续迭代只能追加，不会删除或覆盖已有信封；因此第 N 轮的证据集总是第 N+1 轮的子集。

use std::collections::HashMap;

use crate::evidence::{EvidenceEnvelope, EvidenceId};

#[derive(Debug, Clone, Default)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEnvelope>,
    index: HashMap<EvidenceId, usize>,
}

impl EvidenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条信封，返回其在账本中的 id
    ///
    /// 同 id 且内容相同视为重复写入（例如复用缓存的工具结果），不重复记录；
    /// 同 id 但内容不同时为新信封分配派生 id，原 id 写入 metadata.original_id。
    pub fn append(&mut self, envelope: EvidenceEnvelope) -> EvidenceId {
        let Some(&pos) = self.index.get(&envelope.id) else {
            return self.push(envelope);
        };
        if self.entries[pos] == envelope {
            return envelope.id;
        }
        let original = envelope.id.clone();
        let mut suffix = 1;
        let mut candidate = format!("{original}~{suffix}");
        while self.index.contains_key(&candidate) {
            suffix += 1;
            candidate = format!("{original}~{suffix}");
        }
        tracing::debug!(original = %original, assigned = %candidate, "evidence id collision");
        let envelope = envelope
            .with_id(candidate)
            .with_metadata("original_id", original);
        self.push(envelope)
    }

    pub fn extend(&mut self, envelopes: impl IntoIterator<Item = EvidenceEnvelope>) -> Vec<EvidenceId> {
        envelopes.into_iter().map(|e| self.append(e)).collect()
    }

    fn push(&mut self, envelope: EvidenceEnvelope) -> EvidenceId {
        let id = envelope.id.clone();
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(envelope);
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&EvidenceEnvelope> {
        self.index.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn as_slice(&self) -> &[EvidenceEnvelope] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<EvidenceEnvelope> {
        self.entries.clone()
    }

    /// 按追加顺序的 id 列表
    pub fn ids(&self) -> Vec<EvidenceId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
