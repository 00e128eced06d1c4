//! Normalized chat-completion request/response types.
//!
//! The transport collaborator translates these to and from each provider's
//! wire format; the dispatch core only ever sees the normalized shapes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Rough characters-per-token ratio used for pre-call token estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Unique identifier for one dispatched request, wrapping a UUID v7 (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// A normalized chat-completion request.
///
/// `model` is optional: `None` lets any provider serve the request with its
/// default model, `Some("llama-3.3*")` asks for a model family, and any other
/// value must match a configured model id exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Caller-supplied token estimate; overrides the character heuristic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u32>,
}

impl CompletionRequest {
    /// Build a single-turn user request with no sampling overrides.
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: None,
            messages: vec![Message::user(prompt)],
            system: None,
            max_tokens,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            token_estimate: None,
        }
    }

    /// Approximate prompt size in tokens (system prompt plus all messages).
    pub fn estimated_input_tokens(&self) -> u32 {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| m.content.chars().count())
            .chain(self.system.iter().map(|s| s.chars().count()))
            .sum();
        chars.div_ceil(CHARS_PER_TOKEN).try_into().unwrap_or(u32::MAX)
    }

    /// Tokens to reserve against a provider's budget before the call.
    ///
    /// Prompt estimate plus the full `max_tokens` completion allowance,
    /// unless the caller supplied `token_estimate`.
    pub fn estimated_total_tokens(&self) -> u32 {
        self.token_estimate
            .unwrap_or_else(|| self.estimated_input_tokens().saturating_add(self.max_tokens))
    }
}

/// A normalized chat-completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub content: String,
    pub model: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Reason why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
        }
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "end_turn" => Ok(StopReason::EndTurn),
            "max_tokens" => Ok(StopReason::MaxTokens),
            "stop_sequence" => Ok(StopReason::StopSequence),
            other => Err(format!("invalid stop reason: '{other}'")),
        }
    }
}

/// Token usage reported by a provider for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_parse_and_display() {
        assert_eq!("User".parse::<MessageRole>().unwrap(), MessageRole::User);
        assert_eq!(MessageRole::Assistant.to_string(), "assistant");
        assert!("tool".parse::<MessageRole>().is_err());
    }

    #[test]
    fn test_stop_reason_serde() {
        let json = serde_json::to_string(&StopReason::EndTurn).unwrap();
        assert_eq!(json, "\"end_turn\"");
        let parsed: StopReason = serde_json::from_str("\"max_tokens\"").unwrap();
        assert_eq!(parsed, StopReason::MaxTokens);
    }

    #[test]
    fn test_estimated_input_tokens_rounds_up() {
        let mut request = CompletionRequest::new("abcdefghi", 100);
        // 9 chars -> 3 tokens
        assert_eq!(request.estimated_input_tokens(), 3);

        request.system = Some("abc".to_string());
        // 12 chars -> 3 tokens
        assert_eq!(request.estimated_input_tokens(), 3);
    }

    #[test]
    fn test_estimated_total_includes_completion_allowance() {
        let request = CompletionRequest::new("abcd", 50);
        assert_eq!(request.estimated_total_tokens(), 51);
    }

    #[test]
    fn test_token_estimate_override() {
        let mut request = CompletionRequest::new("a long prompt", 500);
        request.token_estimate = Some(42);
        assert_eq!(request.estimated_total_tokens(), 42);
    }

    #[test]
    fn test_request_model_defaults_to_none_when_absent() {
        let json = r#"{"messages":[{"role":"user","content":"hi"}],"max_tokens":10}"#;
        let request: CompletionRequest = serde_json::from_str(json).unwrap();
        assert!(request.model.is_none());
        assert!(request.token_estimate.is_none());
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = Usage {
            input_tokens: u32::MAX,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), u32::MAX);
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
