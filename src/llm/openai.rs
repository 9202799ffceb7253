//! OpenAI-compatible Chat Completions client.
//!
//! Sends `POST {base_url}/chat/completions` with `stream: true` and turns the
//! SSE response into [`ModelEvent`]s. Works against OpenAI, DeepSeek,
//! DashScope compatible mode, vLLM and Ollama's `/v1` endpoint.
//!
//! Tool call arguments arrive as fragments keyed by `index`; they are
//! accumulated and emitted as one [`ModelEvent::ToolCall`] per call once
//! the choice reports a `finish_reason` (or the stream ends).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::sse::SseLineParser;
use super::{ChatModel, FinishReason, Message, ModelEvent, ModelStream, ToolCall, ToolDefinition};
use crate::config::LlmConfig;
use crate::error::ChatError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAiChatModel {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
}

impl std::fmt::Debug for OpenAiChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatModel")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiChatModel {
    /// Build a client from `[llm]`. The API key is read from
    /// `llm.api_key_env`; local endpoints may run without one.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "no LLM API key set, sending unauthenticated requests"
            );
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    pub fn build_request(&self, messages: &[Message], tools: &[ToolDefinition]) -> Value {
        build_completions_request(&self.model, self.temperature, messages, tools)
    }
}

/// Request body for a streamed completion.
pub fn build_completions_request(
    model: &str,
    temperature: Option<f32>,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "messages": messages.iter().map(message_to_openai).collect::<Vec<_>>(),
    });
    if let Some(t) = temperature {
        body["temperature"] = json!(t);
    }
    if !tools.is_empty() {
        body["tools"] = tools_to_openai(tools);
        body["tool_choice"] = json!("auto");
    }
    body
}

fn message_to_openai(message: &Message) -> Value {
    match message {
        Message::System(content) => json!({"role": "system", "content": content}),
        Message::User(content) => json!({"role": "user", "content": content}),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut msg = json!({"role": "assistant"});
            msg["content"] = if content.is_empty() && !tool_calls.is_empty() {
                Value::Null
            } else {
                json!(content)
            };
            if !tool_calls.is_empty() {
                msg["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments},
                        })
                    })
                    .collect();
            }
            msg
        }
        Message::Tool { call_id, content } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": content,
        }),
    }
}

fn tools_to_openai(tools: &[ToolDefinition]) -> Value {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                },
            })
        })
        .collect()
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> ChatError {
    let message = extract_error_message(body);
    match status.as_u16() {
        401 | 403 => ChatError::Auth(format!("model endpoint rejected credentials: {message}")),
        429 => ChatError::Request(format!("model endpoint rate limited: {message}")),
        code => ChatError::Request(format!("model endpoint HTTP {code}: {message}")),
    }
}

fn map_send_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Timeout(format!("model request timed out: {e}"))
    } else {
        ChatError::Request(format!("model request failed: {e}"))
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(String::from))
        })
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Collects streamed tool-call fragments by their `index`.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u64, id: Option<&str>, name: Option<&str>, args: Option<&str>) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            call.name.push_str(name);
        }
        if let Some(args) = args {
            call.arguments.push_str(args);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Completed calls in index order. Calls without a name are dropped.
    pub fn drain(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .filter_map(|(index, call)| {
                if call.name.is_empty() {
                    tracing::warn!(index, "dropping streamed tool call without a name");
                    return None;
                }
                Some(ToolCall {
                    id: if call.id.is_empty() {
                        format!("call_{index}")
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments: if call.arguments.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        call.arguments
                    },
                })
            })
            .collect()
    }
}

/// Turns `data:` payloads of a completion stream into model events.
#[derive(Debug, Default)]
pub struct CompletionDecoder {
    calls: ToolCallAccumulator,
    finished: bool,
}

impl CompletionDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: &str) -> Result<Vec<ModelEvent>, ChatError> {
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable completion chunk");
                return Ok(Vec::new());
            }
        };
        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(ChatError::Stream(message));
        }
        if self.finished {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return Ok(events);
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(ModelEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for (position, call) in calls.iter().enumerate() {
                    let index = call
                        .get("index")
                        .and_then(Value::as_u64)
                        .unwrap_or(position as u64);
                    let function = call.get("function");
                    self.calls.push(
                        index,
                        call.get("id").and_then(Value::as_str),
                        function.and_then(|f| f.get("name")).and_then(Value::as_str),
                        function
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str),
                    );
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            events.extend(self.complete(FinishReason::from_wire(reason)));
        }
        Ok(events)
    }

    /// Events owed once the byte stream has ended.
    pub fn finish(&mut self) -> Vec<ModelEvent> {
        if self.finished {
            return Vec::new();
        }
        self.complete(FinishReason::Stop)
    }

    fn complete(&mut self, reason: FinishReason) -> Vec<ModelEvent> {
        self.finished = true;
        let calls = self.calls.drain();
        // some providers report "stop" even when the turn carries tool calls
        let reason = if calls.is_empty() {
            reason
        } else {
            FinishReason::ToolCalls
        };
        let mut events: Vec<ModelEvent> = calls.into_iter().map(ModelEvent::ToolCall).collect();
        events.push(ModelEvent::Finished(reason));
        events
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelStream, ChatError> {
        let body = self.build_request(messages, tools);
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }

        let stream = async_stream::stream! {
            let mut bytes = response.bytes_stream();
            let mut parser = SseLineParser::new();
            let mut decoder = CompletionDecoder::new();
            loop {
                let (events, at_end) = match bytes.next().await {
                    Some(Ok(chunk)) => (parser.push(&chunk), false),
                    Some(Err(e)) => {
                        yield Err(if e.is_timeout() {
                            ChatError::Timeout(format!("model stream timed out: {e}"))
                        } else {
                            ChatError::Stream(format!("stream read error: {e}"))
                        });
                        return;
                    }
                    None => (parser.flush().into_iter().collect(), true),
                };
                for event in events {
                    if event.is_done() {
                        continue;
                    }
                    match decoder.decode(&event.data) {
                        Ok(decoded) => {
                            for model_event in decoded {
                                yield Ok(model_event);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                if at_end {
                    break;
                }
            }
            for model_event in decoder.finish() {
                yield Ok(model_event);
            }
        };
        Ok(Box::pin(stream))
    }
}
