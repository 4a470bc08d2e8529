//! Stream Messages
//!
//! Events produced while a chat operation streams, and the JSON frames they
//! become on a client connection.
//!
//! Every frame has the same shape:
//!
//! ```json
//! {"type": "token", "requestId": "r1", "data": "He"}
//! ```
//!
//! `requestId` is omitted only for errors that could not be tied to a request
//! (for example a payload that failed to parse).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier correlating one chat operation with its connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh unique request ID
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept a caller-supplied ID, rejecting blank ones
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    /// The ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of output pushed to a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// An incremental fragment of generated text
    Token {
        /// Fragment text
        text: String,
    },
    /// The operation completed
    Done {
        /// Aggregate response text
        final_text: String,
    },
    /// The operation failed
    Error {
        /// Human-readable failure description
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token { .. })
    }

    /// Frame this event for a request
    #[must_use]
    pub fn into_frame(self, request_id: RequestId) -> StreamFrame {
        let (kind, data) = match self {
            Self::Token { text } => (FrameKind::Token, text),
            Self::Done { final_text } => (FrameKind::Done, final_text),
            Self::Error { message } => (FrameKind::Error, message),
        };
        StreamFrame {
            kind,
            request_id: Some(request_id),
            data,
        }
    }
}

/// Frame discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Carries a token
    Token,
    /// Carries the final text
    Done,
    /// Carries an error message
    Error,
}

/// Wire frame sent to a duplex client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Frame type
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Request the frame belongs to
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Token, final text, or error message
    pub data: String,
}

impl StreamFrame {
    /// Create a token frame
    pub fn token(request_id: RequestId, text: impl Into<String>) -> Self {
        StreamEvent::Token { text: text.into() }.into_frame(request_id)
    }

    /// Create a done frame
    pub fn done(request_id: RequestId, final_text: impl Into<String>) -> Self {
        StreamEvent::Done {
            final_text: final_text.into(),
        }
        .into_frame(request_id)
    }

    /// Create an error frame, optionally not tied to any request
    pub fn error(request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Error,
            request_id,
            data: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_parse() {
        assert!(RequestId::parse("").is_none());
        assert!(RequestId::parse(" \t ").is_none());
        assert_eq!(RequestId::parse(" r1 ").unwrap().as_str(), "r1");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().trim().is_empty());
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = StreamFrame::token(RequestId::from("r1"), "He");
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "token", "requestId": "r1", "data": "He"}));

        let frame = StreamFrame::done(RequestId::from("r1"), "Hello");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "done", "requestId": "r1", "data": "Hello"}));
    }

    #[test]
    fn test_unrouted_error_frame_omits_request_id() {
        let frame = StreamFrame::error(None, "bad payload");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "error", "data": "bad payload"}));
    }

    #[test]
    fn test_terminal_events() {
        assert!(!StreamEvent::Token { text: "a".into() }.is_terminal());
        assert!(StreamEvent::Done {
            final_text: "a".into()
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            message: "boom".into()
        }
        .is_terminal());
    }
}
