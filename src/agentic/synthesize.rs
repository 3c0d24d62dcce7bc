//! AnswerSynthesizer：基于相关的存储输出写出带引用的最终答案
//!
//! 引用形如 `[cite:<evidence id>]`，写完后对照证据台账校验，不存在的 id 从答案中移除并单独上报。
//! 模型失败时使用最近的推理草稿，没有草稿则输出确定性的证据摘要。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::agentic::{Intent, Query};
use crate::context_store::{ContextPointer, ToolContextStore};
use crate::core::RunContext;
use crate::evidence::{cite_marker, strip_invalid_citations, CitationReport, EvidenceId, EvidenceLedger};
use crate::llm::{CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};

const ENTRY_PREVIEW_CHARS: usize = 1500;
const MAX_DIGEST_ITEMS: usize = 20;

/// 答案来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Model,
    Draft,
    Digest,
}

/// 合成结果
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: String,
    pub citations: Vec<EvidenceId>,
    pub invalid_citations: Vec<EvidenceId>,
    pub source: AnswerSource,
}

/// 答案合成器
pub struct AnswerSynthesizer {
    llm: Arc<dyn LlmClient>,
    store: Arc<ToolContextStore>,
    model: Option<String>,
    timeout: Duration,
    temperature: f32,
}

impl AnswerSynthesizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<ToolContextStore>,
        model: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            store,
            model,
            timeout,
            temperature: 0.2,
        }
    }

    pub async fn synthesize(
        &self,
        ctx: &RunContext,
        query: &Query,
        intent: Option<&Intent>,
        ledger: &EvidenceLedger,
        pointers: &[ContextPointer],
        draft: Option<&str>,
    ) -> Synthesis {
        let relevant = match self.store.select_relevant(ctx, &query.text, pointers).await {
            Ok(relevant) => relevant,
            Err(e) => {
                tracing::warn!(run_id = ctx.run_id(), error = %e, "relevance selection failed");
                pointers.iter().take(self.store.max_relevant()).cloned().collect()
            }
        };
        let entries = match self.store.load(&relevant).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(run_id = ctx.run_id(), error = %e, "failed to load stored outputs");
                Vec::new()
            }
        };

        let mut sources = String::new();
        for entry in entries.iter().filter(|e| e.result.success) {
            let markers: Vec<String> = entry.result.evidence.iter().map(|e| cite_marker(&e.id)).collect();
            sources.push_str(&format!(
                "{} {} {}: {}\n",
                markers.join(""),
                entry.pointer.tool_name,
                entry.normalized_args,
                entry.result.data_preview(ENTRY_PREVIEW_CHARS)
            ));
        }

        let mut user = format!("Question: {}", query.text);
        if let Some(intent) = intent {
            user.push_str(&format!("\nIntent: {}", intent.intent_type));
        }
        if sources.is_empty() {
            user.push_str("\n\nNo tool results are available.");
        } else {
            user.push_str(&format!("\n\nSources:\n{sources}"));
        }
        if let Some(draft) = draft {
            user.push_str(&format!("\nAnalyst draft:\n{draft}"));
        }

        let request = ChatRequest::new(
            CallPurpose::Synthesis,
            vec![
                Message::system(
                    "Write the final answer to the user's question using only the sources given. \
                     After each claim, cite its source with the marker shown next to it, e.g. [cite:ev_123]. \
                     Do not invent markers. If the sources are insufficient, say what is missing.",
                ),
                Message::user(user),
            ],
            DecodingParams::text(self.model.clone(), self.temperature),
        );

        match ctx.call_model(self.llm.as_ref(), &request, self.timeout).await {
            Ok(response) if !response.content_str().trim().is_empty() => {
                checked(response.content_str().trim(), ledger, AnswerSource::Model)
            }
            Ok(_) => {
                tracing::warn!(run_id = ctx.run_id(), "synthesis returned empty answer");
                self.fallback(ledger, draft)
            }
            Err(e) => {
                tracing::warn!(run_id = ctx.run_id(), error = %e, "synthesis failed, using fallback answer");
                self.fallback(ledger, draft)
            }
        }
    }

    fn fallback(&self, ledger: &EvidenceLedger, draft: Option<&str>) -> Synthesis {
        if let Some(draft) = draft.filter(|d| !d.trim().is_empty()) {
            return checked(draft.trim(), ledger, AnswerSource::Draft);
        }
        checked(&evidence_digest(ledger), ledger, AnswerSource::Digest)
    }
}

/// 校验引用并移除无效标记
fn checked(answer: &str, ledger: &EvidenceLedger, source: AnswerSource) -> Synthesis {
    let report = CitationReport::check(answer, ledger.as_slice());
    if !report.invalid.is_empty() {
        tracing::warn!(invalid = ?report.invalid, "answer cites unknown evidence");
    }
    let answer = strip_invalid_citations(answer, &report.invalid);
    Synthesis {
        answer,
        citations: report.valid(),
        invalid_citations: report.invalid,
        source,
    }
}

/// 确定性证据摘要
pub fn evidence_digest(ledger: &EvidenceLedger) -> String {
    if ledger.is_empty() {
        return "No answer could be produced: no evidence was collected.".to_string();
    }
    let mut out = String::from("Collected evidence:");
    for envelope in ledger.as_slice().iter().take(MAX_DIGEST_ITEMS) {
        out.push_str(&format!("\n- {} {}", envelope.label, cite_marker(&envelope.id)));
    }
    if ledger.len() > MAX_DIGEST_ITEMS {
        out.push_str(&format!("\n- ... and {} more", ledger.len() - MAX_DIGEST_ITEMS));
    }
    out
}
