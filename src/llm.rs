//! Language model replies
//!
//! The orchestrator only sees [`ReplySource`]. [`ChatClient`] talks to any
//! OpenAI-compatible chat completions endpoint and streams tokens over SSE.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::config::LlmConfig;
use crate::{Error, Result};

/// Capacity of the token channel of a streamed reply
const TOKEN_CAPACITY: usize = 64;

/// A reply from the language model
#[derive(Debug)]
pub enum Reply {
    /// The whole reply at once
    Complete(String),
    /// Fragments as they are generated; the channel closing ends the reply
    Stream(mpsc::Receiver<Result<String>>),
}

/// Produces replies to user prompts
#[async_trait]
pub trait ReplySource: Send + Sync {
    /// Start a reply to `prompt`
    ///
    /// # Errors
    ///
    /// Returns `Error::Upstream` if the request fails
    async fn reply(&self, prompt: &str) -> Result<Reply>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// Completed exchanges, oldest first
#[derive(Debug, Default)]
struct History {
    turns: VecDeque<(String, String)>,
    max_turns: usize,
}

impl History {
    fn record(&mut self, user: String, assistant: String) {
        self.turns.push_back((user, assistant));
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    fn messages(&self, system: &str, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2 + 2);
        messages.push(ChatMessage {
            role: "system",
            content: system.to_string(),
        });
        for (user, assistant) in &self.turns {
            messages.push(ChatMessage {
                role: "user",
                content: user.clone(),
            });
            messages.push(ChatMessage {
                role: "assistant",
                content: assistant.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt.to_string(),
        });
        messages
    }
}

/// OpenAI-compatible chat client with in-memory history
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
    api_key: SecretString,
    model: String,
    system_prompt: String,
    stream: bool,
    history: Arc<Mutex<History>>,
}

impl ChatClient {
    /// Create a client from the LLM settings
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured or the HTTP client cannot be built
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("GROQ_API_KEY or OPENAI_API_KEY required".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            stream: config.stream,
            history: Arc::new(Mutex::new(History {
                turns: VecDeque::new(),
                max_turns: config.max_history,
            })),
        })
    }

    /// Forget previous exchanges
    pub async fn clear_history(&self) {
        self.history.lock().await.turns.clear();
    }

    async fn send(&self, prompt: &str) -> Result<reqwest::Response> {
        let messages = self.history.lock().await.messages(&self.system_prompt, prompt);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: self.stream,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "chat request failed");
                Error::Upstream(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Upstream(format!("chat API error {status}: {body}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl ReplySource for ChatClient {
    async fn reply(&self, prompt: &str) -> Result<Reply> {
        tracing::debug!(model = %self.model, stream = self.stream, "requesting reply");
        let response = self.send(prompt).await?;

        if !self.stream {
            let body: ChatResponse = response
                .json()
                .await
                .map_err(|e| Error::Upstream(format!("invalid chat response: {e}")))?;
            let text = body
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();

            self.history
                .lock()
                .await
                .record(prompt.to_string(), text.clone());
            return Ok(Reply::Complete(text));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CAPACITY);
        let history = Arc::clone(&self.history);
        let prompt = prompt.to_string();
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut reply = String::new();

            'read: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Upstream(format!("reply stream failed: {e}")))).await;
                        return;
                    }
                };

                for event in decoder.push(&chunk) {
                    let data = match event {
                        SseEvent::Done => break 'read,
                        SseEvent::Data(data) => data,
                    };

                    let content = match serde_json::from_str::<StreamChunk>(&data) {
                        Ok(chunk) => chunk.choices.into_iter().next().and_then(|c| c.delta.content),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed stream chunk");
                            continue;
                        }
                    };

                    if let Some(content) = content.filter(|c| !c.is_empty()) {
                        reply.push_str(&content);
                        if tx.send(Ok(content)).await.is_err() {
                            tracing::debug!("reply abandoned by consumer");
                            return;
                        }
                    }
                }
            }

            tracing::debug!(chars = reply.len(), "reply stream complete");
            history.lock().await.record(prompt, reply);
        });

        Ok(Reply::Stream(rx))
    }
}

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Incremental `data:` line parser
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Append bytes and return every complete event
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();

            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }
        events
    }
}
