//! Token usage extracted from upstream responses

use serde::{Deserialize, Serialize};

/// Token counts reported by the upstream for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Read a `usage` object; missing or non-numeric fields count as zero.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let field = |name: &str| value.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        Self {
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
            cache_read_input_tokens: field("cache_read_input_tokens"),
        }
    }

    pub fn cache_tokens(&self) -> u64 {
        self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cache_tokens() == 0
    }
}

/// Usage and content presence of a whole (non-streamed) message body.
pub fn inspect_message(body: &serde_json::Value) -> (Usage, bool) {
    let usage = body.get("usage").map(Usage::from_json).unwrap_or_default();
    let has_content = body
        .get("content")
        .and_then(|c| c.as_array())
        .is_some_and(|blocks| !blocks.is_empty());
    (usage, has_content)
}

/// One billed request, handed to the usage ledger once the response is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub request_id: String,
    pub credential_id: String,
    pub routing_entity_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub timestamp_ms: u64,
}

impl UsageEvent {
    pub fn new(
        request_id: impl Into<String>,
        credential_id: impl Into<String>,
        routing_entity_id: impl Into<String>,
        usage: &Usage,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            credential_id: credential_id.into(),
            routing_entity_id: routing_entity_id.into(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_tokens: usage.cache_tokens(),
            timestamp_ms: common::now_millis(),
        }
    }
}
