//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use iiot_assistant::error::ChatError;
use iiot_assistant::llm::{
    ChatModel, FinishReason, Message, ModelEvent, ModelStream, ToolCall, ToolDefinition,
};
use iiot_assistant_core::embedding::Embedder;

/// One step of a scripted model round.
#[derive(Clone)]
pub enum Step {
    Text(&'static str),
    Call(&'static str, &'static str, &'static str),
    Fail(ChatError),
    /// Stop producing output without ending the stream.
    Hang,
}

/// A [`ChatModel`] that plays back one scripted round per call and
/// records what it was sent. Once the script runs out every round is an
/// empty `stop`.
#[derive(Default)]
pub struct ScriptedModel {
    rounds: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<(Vec<Message>, Vec<ToolDefinition>)>>,
}

impl ScriptedModel {
    pub fn new(rounds: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Tool-calling rounds forever.
    pub fn looping_tool_calls(rounds: usize) -> Arc<Self> {
        Self::new(
            (0..rounds)
                .map(|_| vec![Step::Call("call_x", "device_status", r#"{"deviceId":"Motor-01"}"#)])
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<(Vec<Message>, Vec<ToolDefinition>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Tool names offered in round `n`.
    pub fn offered_tools(&self, n: usize) -> Vec<String> {
        self.requests.lock().unwrap()[n]
            .1
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelStream, ChatError> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), tools.to_vec()));
        let steps = self.rounds.lock().unwrap().pop_front().unwrap_or_default();

        Ok(Box::pin(async_stream::stream! {
            let mut called = false;
            for step in steps {
                match step {
                    Step::Text(t) => yield Ok(ModelEvent::TextDelta(t.to_string())),
                    Step::Call(id, name, args) => {
                        called = true;
                        yield Ok(ModelEvent::ToolCall(ToolCall {
                            id: id.to_string(),
                            name: name.to_string(),
                            arguments: args.to_string(),
                        }));
                    }
                    Step::Fail(e) => {
                        yield Err(e);
                        return;
                    }
                    Step::Hang => futures_util::future::pending::<()>().await,
                }
            }
            let reason = if called { FinishReason::ToolCalls } else { FinishReason::Stop };
            yield Ok(ModelEvent::Finished(reason));
        }))
    }
}

/// Deterministic bag-of-words embedder over a fixed vocabulary.
pub struct BagOfWordsEmbedder {
    vocabulary: Vec<&'static str>,
}

impl BagOfWordsEmbedder {
    pub fn new(vocabulary: Vec<&'static str>) -> Self {
        Self { vocabulary }
    }
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        self.vocabulary.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                self.vocabulary
                    .iter()
                    .map(|word| lower.matches(word).count() as f32)
                    .collect()
            })
            .collect())
    }
}
