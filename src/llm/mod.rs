//! Chat model abstraction.
//!
//! The orchestrator talks to a [`ChatModel`]: given a transcript and the
//! tools visible to this request, it returns a stream of [`ModelEvent`]s.
//! Text arrives as deltas; tool calls arrive whole, after their argument
//! fragments have been accumulated. [`openai::OpenAiChatModel`] implements
//! the trait for any OpenAI-compatible Chat Completions endpoint.

pub mod openai;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;

use crate::error::ChatError;

/// A function the model may call, in OpenAI function-calling shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// A completed tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the arguments, exactly as the model produced it.
    pub arguments: String,
}

/// One entry of the transcript sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(String),
    User(String),
    Assistant {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    /// Always the last event of a successful stream.
    Finished(FinishReason),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ChatError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start one streamed completion.
    ///
    /// Errors returned here happen before any output (connection refused,
    /// bad credentials); errors inside the stream happen mid-response.
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelStream, ChatError>;
}
