//! Ollama Backend Implementation
//!
//! Chat backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (streaming)
//! - `/api/tags` - List available models
//!
//! Streaming responses are newline-delimited JSON. Each line carries a
//! `message.content` fragment; the last one has `"done": true`. Failures
//! arrive as a line with an `error` field.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use super::traits::{BackendConfig, ChatBackend, ModelInfo, StreamingToken};
use crate::request::ChatRequest;

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Connection and default generation settings
    config: BackendConfig,
    /// HTTP client
    http_client: reqwest::Client,
}

/// One parsed line of an Ollama chat stream
#[derive(Debug, PartialEq, Eq)]
enum ChatLine {
    /// A content fragment; `done` marks the final line
    Fragment { content: String, done: bool },
    /// The server reported an error
    Failed(String),
}

/// Splits a byte stream into lines, decoding a line only once it is complete
///
/// HTTP chunks may end inside a multi-byte character, so bytes are held until
/// the newline arrives.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl OllamaBackend {
    /// Create a new Ollama backend
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            config,
            http_client,
        }
    }

    /// Backend configuration
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.config.base_url.trim_end_matches('/'))
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.config.base_url.trim_end_matches('/'))
    }

    /// Build the `/api/chat` request body
    fn build_chat_body(&self, request: &ChatRequest) -> Value {
        let model = if request.model.is_empty() {
            self.config.model.as_str()
        } else {
            request.model.as_str()
        };

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.text}))
            .collect();

        let opts = &request.options;
        let mut options = Map::new();
        options.insert(
            "temperature".to_string(),
            json!(opts.temperature.unwrap_or(self.config.temperature)),
        );
        if let Some(top_p) = opts.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(top_k) = opts.top_k {
            options.insert("top_k".to_string(), json!(top_k));
        }
        if let Some(penalty) = opts.frequency_penalty {
            options.insert("frequency_penalty".to_string(), json!(penalty));
        }
        if let Some(penalty) = opts.presence_penalty {
            options.insert("presence_penalty".to_string(), json!(penalty));
        }
        if let Some(ref stop) = opts.stop {
            options.insert("stop".to_string(), json!(stop));
        }
        if let Some(max_tokens) = opts.max_output_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "think": opts.think.unwrap_or(self.config.think),
            "options": options,
        });

        if let Some(ref tools) = opts.tools {
            body["tools"] = json!(tools);
        }

        body
    }

    /// Parse one NDJSON line; `None` for blank or unrecognised lines
    fn parse_chat_line(line: &str) -> Option<ChatLine> {
        let data: Value = serde_json::from_str(line.trim()).ok()?;

        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Some(ChatLine::Failed(error.to_string()));
        }

        let content = data
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let done = data.get("done").and_then(Value::as_bool).unwrap_or(false);

        Some(ChatLine::Fragment { content, done })
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    async fn send_streaming(
        &self,
        request: &ChatRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);
        let body = self.build_chat_body(request);

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await?;

        // Check for HTTP errors
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let mut stream = response.bytes_stream();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push(&bytes);

                while let Some(line) = buffer.next_line() {
                    match Self::parse_chat_line(&line) {
                        Some(ChatLine::Fragment { content, done }) => {
                            if !content.is_empty() {
                                full_response.push_str(&content);
                                if tx.send(StreamingToken::Token(content)).await.is_err() {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }
                            if done {
                                let _ = tx
                                    .send(StreamingToken::Complete {
                                        message: full_response,
                                    })
                                    .await;
                                return;
                            }
                        }
                        Some(ChatLine::Failed(error)) => {
                            let _ = tx.send(StreamingToken::Error(error)).await;
                            return;
                        }
                        None => {}
                    }
                }
            }

            let _ = tx
                .send(StreamingToken::Error(
                    "Ollama stream ended without a done marker".to_string(),
                ))
                .await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: Value = response.json().await?;
        Ok(parse_tags(&data))
    }
}

fn parse_tags(data: &Value) -> Vec<ModelInfo> {
    data.get("models")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let name = m.get("name")?.as_str()?.to_string();
                    let details = m.get("details");
                    let detail = |key: &str| {
                        details
                            .and_then(|d| d.get(key))
                            .and_then(Value::as_str)
                            .map(String::from)
                    };

                    Some(ModelInfo {
                        name,
                        size: m.get("size").and_then(Value::as_u64),
                        parameters: detail("parameter_size"),
                        quantization: detail("quantization_level"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ChatOptions, Message};

    fn backend() -> OllamaBackend {
        OllamaBackend::new(BackendConfig::new("http://localhost:11434/", "meditron:7b"))
    }

    #[test]
    fn test_urls_strip_trailing_slash() {
        let backend = backend();
        assert_eq!(backend.chat_url(), "http://localhost:11434/api/chat");
        assert_eq!(backend.tags_url(), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_chat_body_defaults() {
        let request = ChatRequest::new("").with_message(Message::user("hello"));
        let body = backend().build_chat_body(&request);

        assert_eq!(body["model"], "meditron:7b");
        assert_eq!(body["stream"], true);
        assert_eq!(body["think"], false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["options"]["temperature"], 0.7);
        assert!(body.get("tools").is_none());
        assert!(body["options"].get("num_predict").is_none());
    }

    #[test]
    fn test_chat_body_maps_options() {
        let options = ChatOptions {
            temperature: Some(0.2),
            top_k: Some(20),
            stop: Some(vec!["END".to_string()]),
            max_output_tokens: Some(128),
            tools: Some(vec![json!({"name": "lookup"})]),
            think: Some(true),
            ..Default::default()
        };
        let request = ChatRequest::new("llama3.2")
            .with_message(Message::system("Be brief"))
            .with_options(options);
        let body = backend().build_chat_body(&request);

        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["think"], true);
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["options"]["top_k"], 20);
        assert_eq!(body["options"]["stop"], json!(["END"]));
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["tools"], json!([{"name": "lookup"}]));
    }

    #[test]
    fn test_parse_chat_lines() {
        assert_eq!(
            OllamaBackend::parse_chat_line(
                r#"{"message":{"role":"assistant","content":"He"},"done":false}"#
            ),
            Some(ChatLine::Fragment {
                content: "He".to_string(),
                done: false
            })
        );
        assert_eq!(
            OllamaBackend::parse_chat_line(r#"{"message":{"content":""},"done":true}"#),
            Some(ChatLine::Fragment {
                content: String::new(),
                done: true
            })
        );
        assert_eq!(
            OllamaBackend::parse_chat_line(r#"{"error":"model not found"}"#),
            Some(ChatLine::Failed("model not found".to_string()))
        );
        assert_eq!(OllamaBackend::parse_chat_line("   "), None);
    }

    #[test]
    fn test_line_buffer_waits_for_whole_characters() {
        let mut buffer = LineBuffer::default();
        let text = "caf\u{e9}\nnext";
        let bytes = text.as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;

        buffer.push(&bytes[..split]);
        assert_eq!(buffer.next_line(), None);
        buffer.push(&bytes[split..]);
        assert_eq!(buffer.next_line().as_deref(), Some("caf\u{e9}\n"));
        assert_eq!(buffer.next_line(), None);
        buffer.push(b"\n");
        assert_eq!(buffer.next_line().as_deref(), Some("next\n"));
    }

    /// Serve one chunked NDJSON response whose chunks split a UTF-8 character
    async fn split_chunk_server(chunks: Vec<Vec<u8>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 8192];
            let _ = socket.read(&mut request).await.unwrap();

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/x-ndjson\r\n\
                      Transfer-Encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            for chunk in chunks {
                let mut framed = format!("{:x}\r\n", chunk.len()).into_bytes();
                framed.extend_from_slice(&chunk);
                framed.extend_from_slice(b"\r\n");
                socket.write_all(&framed).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_streaming_keeps_characters_split_across_chunks() {
        let body = "{\"message\":{\"content\":\"caf\u{e9}\"},\"done\":false}\n\
                    {\"message\":{\"content\":\"\"},\"done\":true}\n";
        let bytes = body.as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let base_url =
            split_chunk_server(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]).await;

        let backend = OllamaBackend::new(BackendConfig::new(base_url, "meditron:7b"));
        let request = ChatRequest::new("").with_message(Message::user("hi"));
        let mut rx = backend.send_streaming(&request).await.unwrap();

        let mut tokens = Vec::new();
        let terminal = loop {
            match rx.recv().await.unwrap() {
                StreamingToken::Token(text) => tokens.push(text),
                other => break other,
            }
        };

        assert_eq!(tokens, vec!["caf\u{e9}".to_string()]);
        assert_eq!(
            terminal,
            StreamingToken::Complete {
                message: "caf\u{e9}".to_string()
            }
        );
    }

    #[test]
    fn test_parse_tags() {
        let data = json!({"models": [
            {"name": "llama3.2", "size": 42, "details": {"parameter_size": "3B", "quantization_level": "Q4_K_M"}},
            {"size": 1},
            {"name": "meditron:7b"}
        ]});

        let models = parse_tags(&data);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama3.2");
        assert_eq!(models[0].size, Some(42));
        assert_eq!(models[0].parameters.as_deref(), Some("3B"));
        assert_eq!(models[0].quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(models[1].parameters, None);
    }
}
