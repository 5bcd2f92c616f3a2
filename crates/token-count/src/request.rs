//! count_tokens request shape and its flat-text serialization

use serde::Deserialize;

/// The parts of a messages request that contribute to the count.
#[derive(Debug, Clone, Deserialize)]
pub struct CountTokensRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<MessageContent>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

/// A plain string, or a list of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Text segments concatenated; non-text blocks are ignored.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text.as_deref())
                .collect(),
        }
    }
}

impl CountTokensRequest {
    pub fn from_json(body: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(body).map_err(|e| crate::Error::InvalidRequest(e.to_string()))
    }
}

/// Flatten a request: system text first, then `Role: text` per message,
/// entries separated by a blank line.
pub fn serialize_request(request: &CountTokensRequest) -> String {
    let mut entries = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        let text = system.text();
        if !text.is_empty() {
            entries.push(text);
        }
    }
    for message in &request.messages {
        entries.push(format!("{}: {}", role_label(&message.role), message.content.text()));
    }
    entries.join("\n\n")
}

fn role_label(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> CountTokensRequest {
        CountTokensRequest::from_json(json.as_bytes()).unwrap()
    }

    #[test]
    fn system_first_then_labelled_messages() {
        let request = parse(
            r#"{
                "model": "claude-sonnet-4-5",
                "system": "Be brief.",
                "messages": [
                    {"role": "user", "content": "Hi"},
                    {"role": "assistant", "content": [
                        {"type": "text", "text": "Hel"},
                        {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                        {"type": "text", "text": "lo"}
                    ]}
                ]
            }"#,
        );
        assert_eq!(
            serialize_request(&request),
            "Be brief.\n\nUser: Hi\n\nAssistant: Hello"
        );
    }

    #[test]
    fn system_blocks_and_no_system() {
        let request = parse(
            r#"{"system": [{"type": "text", "text": "A"}, {"type": "text", "text": "B"}],
                "messages": [{"role": "user", "content": "x"}]}"#,
        );
        assert_eq!(serialize_request(&request), "AB\n\nUser: x");

        let request = parse(r#"{"messages": [{"role": "user", "content": "x"}]}"#);
        assert_eq!(serialize_request(&request), "User: x");
    }

    #[test]
    fn tool_definitions_do_not_contribute() {
        let with_tools = parse(
            r#"{"tools": [{"name": "lookup", "description": "Find a thing", "input_schema": {"type": "object"}}],
                "messages": [{"role": "user", "content": "x"}]}"#,
        );
        let without = parse(r#"{"messages": [{"role": "user", "content": "x"}]}"#);
        assert_eq!(serialize_request(&with_tools), serialize_request(&without));
    }

    #[test]
    fn malformed_body_is_invalid_request() {
        let err = CountTokensRequest::from_json(b"{\"messages\": 3}").unwrap_err();
        assert!(matches!(err, crate::Error::InvalidRequest(_)));
    }
}
