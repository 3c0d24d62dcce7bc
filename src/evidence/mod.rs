//! 证据模型：证据信封、工具结果、只追加账本与引用校验

pub mod citation;
pub mod envelope;
pub mod ledger;

pub use citation::{
    cite_marker, extract_citations, strip_invalid_citations, validate_citations, CitationReport,
};
pub use envelope::{EvidenceEnvelope, EvidenceId, EvidenceKind, ToolResult};
pub use ledger::EvidenceLedger;
