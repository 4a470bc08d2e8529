//! Chat Requests
//!
//! The request model handed to a [`ChatBackend`](crate::backend::ChatBackend),
//! plus the lenient parser for the JSON payload duplex clients send.
//!
//! # Leniency
//!
//! Client payloads are parsed field by field rather than through a strict
//! `Deserialize` derive. A malformed item never aborts the whole request:
//!
//! - a missing or non-array `messages` becomes an empty conversation
//! - a message with an unknown `type` is skipped; a missing `type` means `USER`
//! - an option whose value has the wrong JSON type is dropped
//! - unknown option keys are dropped
//!
//! Only a payload that is not a JSON object at all is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::messages::RequestId;

/// Errors from parsing a client chat payload
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload is not valid JSON
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object
    #[error("Chat payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Who authored a conversation message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End user
    User,
    /// System instructions
    System,
    /// Model output from earlier turns
    Assistant,
}

impl MessageRole {
    /// Parse a client-supplied message type
    ///
    /// Accepts `USER`, `SYSTEM`, `ASSISTANT` and the `AI` alias, ignoring case.
    /// Anything else (including `CUSTOM`) yields `None`.
    #[must_use]
    pub fn from_client_type(kind: &str) -> Option<Self> {
        match kind.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(Self::User),
            "SYSTEM" => Some(Self::System),
            "ASSISTANT" | "AI" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// Role name as the backend wire format expects it
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of the conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the turn
    pub role: MessageRole,
    /// Turn text
    pub text: String,
}

impl Message {
    /// Create a message
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, text)
    }
}

/// Generation options, each independently present or absent
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Sampling temperature
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff
    pub top_k: Option<u32>,
    /// Penalty for frequently repeated tokens
    pub frequency_penalty: Option<f64>,
    /// Penalty for tokens already present
    pub presence_penalty: Option<f64>,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
    /// Maximum tokens to generate
    pub max_output_tokens: Option<u32>,
    /// Tool specifications, passed through to the backend as JSON objects
    pub tools: Option<Vec<Value>>,
    /// Whether the model should emit its reasoning
    pub think: Option<bool>,
}

impl ChatOptions {
    /// Build options from a JSON object, dropping unknown or mistyped entries
    #[must_use]
    pub fn from_json(object: &Map<String, Value>) -> Self {
        let mut options = Self::default();

        for (key, value) in object {
            let accepted = match key.as_str() {
                "temperature" => set(&mut options.temperature, value.as_f64()),
                "top_p" => set(&mut options.top_p, value.as_f64()),
                "top_k" => set(&mut options.top_k, as_u32(value)),
                "frequency_penalty" => set(&mut options.frequency_penalty, value.as_f64()),
                "presence_penalty" => set(&mut options.presence_penalty, value.as_f64()),
                "max_output_tokens" => set(&mut options.max_output_tokens, as_u32(value)),
                "think" => set(&mut options.think, value.as_bool()),
                "stop" => set(&mut options.stop, string_list(value)),
                "tools" => set(&mut options.tools, object_list(value)),
                _ => {
                    tracing::debug!(option = %key, "Dropping unknown chat option");
                    continue;
                }
            };

            if !accepted {
                tracing::warn!(option = %key, value = %value, "Dropping mistyped chat option");
            }
        }

        options
    }

    /// Whether no option is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    let accepted = value.is_some();
    if accepted {
        *slot = value;
    }
    accepted
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let stops: Vec<String> = value
        .as_array()?
        .iter()
        .filter_map(|s| s.as_str().map(String::from))
        .collect();
    (!stops.is_empty()).then_some(stops)
}

fn object_list(value: &Value) -> Option<Vec<Value>> {
    let tools: Vec<Value> = value
        .as_array()?
        .iter()
        .filter(|t| t.is_object())
        .cloned()
        .collect();
    (!tools.is_empty()).then_some(tools)
}

/// A chat operation for the backend
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Backend model identifier
    pub model: String,
    /// Ordered conversation
    pub messages: Vec<Message>,
    /// Generation options
    pub options: ChatOptions,
}

impl ChatRequest {
    /// Create a request for a model with no messages
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append a message
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Replace the options
    #[must_use]
    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

/// A chat payload received from a duplex client
///
/// Shape: `{requestId?, model?, messages: [{type, text}], options?: {...}}`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientChatMessage {
    /// Client-chosen request id (absent or blank ids are `None`)
    pub request_id: Option<RequestId>,
    /// Requested model, if any
    pub model: Option<String>,
    /// Parsed conversation
    pub messages: Vec<Message>,
    /// Parsed options
    pub options: ChatOptions,
}

impl ClientChatMessage {
    /// Parse a client payload
    ///
    /// # Errors
    ///
    /// Returns an error only when the payload is not a JSON object.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let json: Value = serde_json::from_str(payload)?;
        let object = match json {
            Value::Object(object) => object,
            other => return Err(ParseError::NotAnObject(json_kind(&other))),
        };

        let request_id = object
            .get("requestId")
            .and_then(scalar_text)
            .and_then(|id| RequestId::parse(&id));

        let model = object
            .get("model")
            .and_then(scalar_text)
            .filter(|m| !m.trim().is_empty());

        let messages = match object.get("messages") {
            Some(Value::Array(items)) => parse_messages(items),
            Some(Value::Null) | None => {
                tracing::debug!("No messages in chat payload");
                Vec::new()
            }
            Some(other) => {
                tracing::warn!(kind = json_kind(other), "Ignoring non-array messages field");
                Vec::new()
            }
        };

        let options = match object.get("options") {
            Some(Value::Object(options)) => ChatOptions::from_json(options),
            _ => ChatOptions::default(),
        };

        Ok(Self {
            request_id,
            model,
            messages,
            options,
        })
    }

    /// Turn the payload into a backend request
    ///
    /// A missing model falls back to `default_model`.
    #[must_use]
    pub fn into_request(self, default_model: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            messages: self.messages,
            options: self.options,
        }
    }
}

fn parse_messages(items: &[Value]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(items.len());

    for item in items {
        let Some(object) = item.as_object() else {
            tracing::warn!(kind = json_kind(item), "Skipping non-object message");
            continue;
        };

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("USER");
        let Some(role) = MessageRole::from_client_type(kind) else {
            tracing::warn!(message_type = %kind, "Unknown message type, skipping message");
            continue;
        };

        let text = object.get("text").and_then(scalar_text).unwrap_or_default();
        messages.push(Message { role, text });
    }

    tracing::debug!(
        received = items.len(),
        accepted = messages.len(),
        "Parsed client messages"
    );
    messages
}

/// Text of a scalar JSON value; `None` for null, arrays and objects
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
