//! 相关性启发式
//!
//! 查询与工具输出文本的词重叠打分；CJK 文本使用 jieba 分词，其余按非字母数字切分。
//! 结果确定：分数降序，成功输出优先，同分按原始顺序；返回集合保持原始顺序。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

use crate::context_store::StoredToolOutput;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 分词为小写词集合；单字符的拉丁词丢弃
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    let text = text.trim();
    if text.is_empty() {
        return HashSet::new();
    }
    if contains_cjk(text) {
        jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.chars().count() > 1 || s.chars().next().is_some_and(is_cjk))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|s| s.chars().count() > 1)
            .collect()
    }
}

/// 工具输出参与打分的文本：工具名、参数、数据预览、证据标签
pub fn entry_text(entry: &StoredToolOutput) -> String {
    let mut text = format!(
        "{} {} {}",
        entry.pointer.tool_name,
        entry.normalized_args,
        entry.result.data_preview(2000)
    );
    for envelope in &entry.result.evidence {
        text.push(' ');
        text.push_str(&envelope.label);
    }
    text
}

pub fn overlap_score(query: &HashSet<String>, text: &str) -> usize {
    query.intersection(&tokenize_to_set(text)).count()
}

/// 选出至多 k 条的下标（升序）
pub fn heuristic_select(query: &str, entries: &[StoredToolOutput], k: usize) -> Vec<usize> {
    let query_tokens = tokenize_to_set(query);
    let mut scored: Vec<(usize, bool, usize)> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (i, e.result.success, overlap_score(&query_tokens, &entry_text(e))))
        .collect();
    scored.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)).then(a.0.cmp(&b.0)));
    let mut picked: Vec<usize> = scored.into_iter().take(k).map(|(i, _, _)| i).collect();
    picked.sort_unstable();
    picked
}
