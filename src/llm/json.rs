//! JSON 模式输出解析
//!
//! 模型即使在 JSON 模式下也可能包裹 ```json 代码块或前后缀说明文字；先提取 JSON 片段再反序列化。

use serde::de::DeserializeOwned;

use crate::core::AgentError;

/// 提取 JSON 片段：优先 ```json 代码块，其次最外层的 {...}
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(block.trim());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 提取并反序列化；失败统一为 MalformedModelOutput
pub fn parse_json_output<T: DeserializeOwned>(output: &str) -> Result<T, AgentError> {
    let json_str = extract_json(output)
        .ok_or_else(|| AgentError::MalformedModelOutput(format!("no JSON object in: {}", preview(output))))?;
    serde_json::from_str(json_str)
        .map_err(|e| AgentError::MalformedModelOutput(format!("{}: {}", e, preview(json_str))))
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    struct Reply {
        complete: bool,
    }

    #[test]
    fn test_extract_fenced_block() {
        let raw = "Sure:\n```json\n{\"complete\": true}\n```\nthanks";
        assert_eq!(extract_json(raw), Some("{\"complete\": true}"));
    }

    #[test]
    fn test_extract_embedded_object() {
        let raw = "result => {\"complete\": false} <=";
        let reply: Reply = parse_json_output(raw).unwrap();
        assert!(!reply.complete);
    }

    #[test]
    fn test_no_json_is_malformed() {
        let err = parse_json_output::<Reply>("I think yes").unwrap_err();
        assert!(matches!(err, AgentError::MalformedModelOutput(_)));
    }

    #[test]
    fn test_schema_mismatch_is_malformed() {
        let err = parse_json_output::<Reply>("{\"done\": 1}").unwrap_err();
        assert!(matches!(err, AgentError::MalformedModelOutput(_)));
    }
}
