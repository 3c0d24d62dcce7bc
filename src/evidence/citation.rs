//! 引用解析与校验
//!
//! 答案中的引用标记形如 `[cite:<evidence id>]`；校验时以累计证据集为准，引用未知 id 视为无效。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::evidence::{EvidenceEnvelope, EvidenceId};

static CITATION_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn citation_regex() -> Option<&'static Regex> {
    CITATION_RE
        .get_or_init(|| Regex::new(r"\[cite:([A-Za-z0-9_.:~-]+)\]").ok())
        .as_ref()
}

/// 生成引用标记
pub fn cite_marker(id: &str) -> String {
    format!("[cite:{id}]")
}

/// 返回 cited 中不在 available 里的 id（保持 cited 顺序，去重）
pub fn validate_citations(available: &[EvidenceEnvelope], cited: &[EvidenceId]) -> Vec<EvidenceId> {
    let known: HashSet<&str> = available.iter().map(|e| e.id.as_str()).collect();
    let mut seen = HashSet::new();
    cited
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// 按首次出现顺序提取答案中的引用 id
pub fn extract_citations(text: &str) -> Vec<EvidenceId> {
    let Some(re) = citation_regex() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// 删除指向无效 id 的引用标记
pub fn strip_invalid_citations(text: &str, invalid: &[EvidenceId]) -> String {
    if invalid.is_empty() {
        return text.to_string();
    }
    let Some(re) = citation_regex() else {
        return text.to_string();
    };
    let invalid: HashSet<&str> = invalid.iter().map(String::as_str).collect();
    re.replace_all(text, |caps: &regex::Captures| {
        let id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if invalid.contains(id) {
            String::new()
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// 一次答案引用检查的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CitationReport {
    pub cited: Vec<EvidenceId>,
    pub invalid: Vec<EvidenceId>,
}

impl CitationReport {
    pub fn check(answer: &str, available: &[EvidenceEnvelope]) -> Self {
        let cited = extract_citations(answer);
        let invalid = validate_citations(available, &cited);
        Self { cited, invalid }
    }

    /// 有效引用（cited 去掉 invalid）
    pub fn valid(&self) -> Vec<EvidenceId> {
        self.cited
            .iter()
            .filter(|id| !self.invalid.contains(id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceKind;

    fn envelope(id: &str) -> EvidenceEnvelope {
        EvidenceEnvelope::new(EvidenceKind::WebPage, id).with_id(id)
    }

    #[test]
    fn test_validate_citations_returns_unknown_ids() {
        let available = vec![envelope("e1"), envelope("e2")];
        let invalid = validate_citations(&available, &["e1".to_string(), "e3".to_string()]);
        assert_eq!(invalid, vec!["e3".to_string()]);
    }

    #[test]
    fn test_validate_citations_dedupes() {
        let invalid = validate_citations(&[], &["x".to_string(), "x".to_string()]);
        assert_eq!(invalid, vec!["x".to_string()]);
    }

    #[test]
    fn test_extract_citations_in_order() {
        let text = "AAPL rose [cite:ev_1] while MSFT [cite:ev_2] beat it [cite:ev_1].";
        assert_eq!(extract_citations(text), vec!["ev_1", "ev_2"]);
    }

    #[test]
    fn test_strip_invalid_citations() {
        let text = "A [cite:e1] B [cite:e3].";
        let stripped = strip_invalid_citations(text, &["e3".to_string()]);
        assert_eq!(stripped, "A [cite:e1] B .");
    }

    #[test]
    fn test_report_check() {
        let available = vec![envelope("e1")];
        let report = CitationReport::check("x [cite:e1] y [cite:e9]", &available);
        assert_eq!(report.cited, vec!["e1", "e9"]);
        assert_eq!(report.invalid, vec!["e9"]);
        assert_eq!(report.valid(), vec!["e1"]);
    }
}
