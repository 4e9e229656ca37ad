//! Chat messages as they arrive from host code.

use serde::{Deserialize, Serialize};

use crate::error::{LlamaError, Result};

/// A single chat message (role + content).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawMessage {
    role: String,
    #[serde(default)]
    content: Option<RawContent>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Parts(Vec<RawPart>),
}

#[derive(Deserialize)]
struct RawPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Parse a JSON array of `{role, content}` objects.
///
/// `content` may be a string, `null`, or an OpenAI-style list of parts, in
/// which case the `text` parts are concatenated and other parts skipped.
pub fn parse_messages(json: &str) -> Result<Vec<ChatMessage>> {
    let raw: Vec<RawMessage> = serde_json::from_str(json)
        .map_err(|e| LlamaError::FormatFailed(format!("invalid messages JSON: {e}")))?;

    raw.into_iter()
        .map(|m| {
            if m.role.is_empty() {
                return Err(LlamaError::FormatFailed("message with empty role".into()));
            }
            let content = match m.content {
                None => String::new(),
                Some(RawContent::Text(t)) => t,
                Some(RawContent::Parts(parts)) => parts
                    .into_iter()
                    .filter(|p| p.kind == "text")
                    .filter_map(|p| p.text)
                    .collect(),
            };
            Ok(ChatMessage {
                role: m.role,
                content,
            })
        })
        .collect()
}

/// Normalise a caller-supplied template: empty or blank means "use the
/// model's own template".
pub fn resolve_template(template: Option<&str>) -> Option<&str> {
    template.filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_messages() {
        let msgs = parse_messages(
            r#"[{"role":"system","content":"Be brief."},{"role":"user","content":"Hi"}]"#,
        )
        .unwrap();
        assert_eq!(
            msgs,
            vec![
                ChatMessage::new("system", "Be brief."),
                ChatMessage::new("user", "Hi")
            ]
        );
    }

    #[test]
    fn flattens_content_parts() {
        let msgs = parse_messages(
            r#"[{"role":"user","content":[
                {"type":"text","text":"Describe "},
                {"type":"image_url","image_url":{"url":"file:///x.png"}},
                {"type":"text","text":"this."}]},
               {"role":"assistant","content":null}]"#,
        )
        .unwrap();
        assert_eq!(msgs[0].content, "Describe this.");
        assert_eq!(msgs[1].content, "");
    }

    #[test]
    fn malformed_input_is_a_format_error() {
        for bad in [
            "not json",
            r#"{"role":"user","content":"x"}"#,
            r#"[{"content":"no role"}]"#,
            r#"[{"role":"","content":"x"}]"#,
            r#"[{"role":"user","content":42}]"#,
        ] {
            let err = parse_messages(bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Format, "input: {bad}");
        }
    }

    #[test]
    fn blank_template_means_default() {
        assert_eq!(resolve_template(None), None);
        assert_eq!(resolve_template(Some("")), None);
        assert_eq!(resolve_template(Some("  \n")), None);
        assert_eq!(resolve_template(Some("chatml")), Some("chatml"));
    }
}
