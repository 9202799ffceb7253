//! Streaming conversation orchestrator.
//!
//! [`Orchestrator::converse`] runs one user turn end to end and returns a
//! lazy stream of text fragments:
//!
//! ```text
//! select capabilities(mode)
//!   → retrieve reference context (auto/docs)
//!   → append user turn
//!   → loop: stream model round
//!             text deltas ─────────────► yielded in arrival order
//!             tool calls ──► ToolRegistry::invoke ──► results fed back
//!   → append one assistant turn with the full text
//! ```
//!
//! The session mutex is held for the whole call. If the call fails, is
//! cancelled, or its stream is dropped before completion, the user turn is
//! removed again so the history keeps alternating user/assistant.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use iiot_assistant_core::capability::{CapabilityRegistry, CapabilitySet};
use iiot_assistant_core::embedding::Embedder;
use iiot_assistant_core::models::{ChatTurn, Mode, Role};
use iiot_assistant_core::search::{format_reference_context, retrieve, RetrievalParams};
use iiot_assistant_core::store::KnowledgeStore;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::error::ChatError;
use crate::llm::{ChatModel, Message, ModelEvent, ToolCall};
use crate::session::{Session, SessionHandle};
use crate::tools::{ToolContext, ToolRegistry};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorLimits {
    pub max_tool_rounds: usize,
    pub tool_timeout: Option<Duration>,
    /// Exchanges kept in session history, `0` for unlimited.
    pub max_history_turns: usize,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            tool_timeout: Some(Duration::from_secs(30)),
            max_history_turns: 20,
        }
    }
}

impl OrchestratorLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tool_rounds: config.llm.max_tool_rounds,
            tool_timeout: (config.tools.timeout_secs > 0)
                .then(|| Duration::from_secs(config.tools.timeout_secs)),
            max_history_turns: config.sessions.max_turns,
        }
    }
}

/// Wrap the user's question with retrieved reference material.
pub fn augment_prompt(message: &str, reference: &str) -> String {
    format!(
        "Answer the user's question using the reference material below.\n[Reference material]\n{reference}\n[Question]\n{message}"
    )
}

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    capabilities: CapabilityRegistry,
    store: Arc<dyn KnowledgeStore>,
    embedder: Option<Arc<dyn Embedder>>,
    retrieval: RetrievalParams,
    ctx: ToolContext,
    limits: OrchestratorLimits,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRegistry>,
        capabilities: CapabilityRegistry,
        store: Arc<dyn KnowledgeStore>,
        embedder: Option<Arc<dyn Embedder>>,
        ctx: ToolContext,
    ) -> Self {
        Self {
            model,
            tools,
            capabilities,
            store,
            embedder,
            retrieval: RetrievalParams::default(),
            ctx,
            limits: OrchestratorLimits::default(),
        }
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalParams) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_limits(mut self, limits: OrchestratorLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Reference block for `message`, or `None` when the mode skips
    /// retrieval, embeddings are disabled, or nothing clears the floor.
    pub async fn reference_context(&self, message: &str, mode: Mode) -> Option<String> {
        if !mode.uses_retrieval() {
            return None;
        }
        let Some(embedder) = &self.embedder else {
            tracing::debug!("embeddings disabled, retrieval skipped");
            return None;
        };
        match retrieve(self.store.as_ref(), embedder.as_ref(), message, self.retrieval).await {
            Ok(chunks) if chunks.is_empty() => None,
            Ok(chunks) => {
                tracing::debug!(chunks = chunks.len(), top = chunks[0].score, "reference context retrieved");
                Some(format_reference_context(&chunks))
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, answering without reference context");
                None
            }
        }
    }

    /// Run one conversational turn. The returned stream is finite and not
    /// restartable; dropping it or firing `cancel` stops it promptly.
    pub fn converse(
        self: &Arc<Self>,
        session: SessionHandle,
        message: String,
        mode: Mode,
        cancel: CancellationToken,
    ) -> TokenStream {
        let this = Arc::clone(self);
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("converse", %request_id, %mode);
        let inner: TokenStream = Box::pin(async_stream::stream! {
            let locked = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                guard = session.lock_owned() => Some(guard),
            };
            let Some(session) = locked else {
                tracing::info!("conversation cancelled while waiting for session");
                yield Err(ChatError::Cancelled);
                return;
            };
            let mut turn = PendingTurn::begin(session);
            let capabilities = this.capabilities.select(mode);
            tracing::info!(
                session = %turn.session.id,
                tools = capabilities.tools.len(),
                "conversation turn started"
            );

            let retrieved = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                reference = this.reference_context(&message, mode) => Some(reference),
            };
            let user_content = match retrieved {
                None => {
                    tracing::info!("conversation cancelled during retrieval");
                    yield Err(ChatError::Cancelled);
                    return;
                }
                Some(Some(reference)) => augment_prompt(&message, &reference),
                Some(None) => message,
            };
            turn.session.history.push(ChatTurn::user(user_content));

            let definitions = this.tools.definitions_for(&capabilities);
            let mut transcript = build_transcript(&capabilities, &turn.session.history);
            let mut full_text = String::new();
            let mut rounds = 0usize;

            loop {
                let started = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = this.model.stream_chat(&transcript, &definitions) => Some(result),
                };
                let mut model_stream = match started {
                    None => {
                        tracing::info!("conversation cancelled");
                        yield Err(ChatError::Cancelled);
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "model request failed");
                        yield Err(e);
                        return;
                    }
                    Some(Ok(stream)) => stream,
                };

                let mut round_text = String::new();
                let mut calls: Vec<ToolCall> = Vec::new();
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = model_stream.next() => Some(item),
                    };
                    match next {
                        None => {
                            tracing::info!("conversation cancelled");
                            yield Err(ChatError::Cancelled);
                            return;
                        }
                        Some(None) => break,
                        Some(Some(Ok(ModelEvent::TextDelta(delta)))) => {
                            round_text.push_str(&delta);
                            full_text.push_str(&delta);
                            yield Ok(delta);
                        }
                        Some(Some(Ok(ModelEvent::ToolCall(call)))) => calls.push(call),
                        Some(Some(Ok(ModelEvent::Finished(reason)))) => {
                            tracing::debug!(round = rounds, ?reason, "model round finished");
                        }
                        Some(Some(Err(e))) => {
                            tracing::warn!(error = %e, "model stream failed");
                            yield Err(e);
                            return;
                        }
                    }
                }

                if calls.is_empty() {
                    break;
                }
                rounds += 1;
                if rounds > this.limits.max_tool_rounds {
                    tracing::warn!(limit = this.limits.max_tool_rounds, "tool round limit exceeded");
                    yield Err(ChatError::ToolRoundsExceeded(this.limits.max_tool_rounds));
                    return;
                }

                transcript.push(Message::Assistant {
                    content: round_text,
                    tool_calls: calls.clone(),
                });
                for call in calls {
                    if cancel.is_cancelled() {
                        yield Err(ChatError::Cancelled);
                        return;
                    }
                    tracing::info!(tool = %call.name, round = rounds, "invoking tool");
                    let result = this.invoke_detached(&call, &capabilities).await;
                    transcript.push(Message::Tool {
                        call_id: call.id,
                        content: result,
                    });
                }
            }

            turn.commit(full_text, this.limits.max_history_turns);
            tracing::info!(rounds, "conversation turn completed");
        });
        Box::pin(InSpan { inner, span })
    }

    /// Run a tool call on its own task so that dropping the conversation
    /// stream does not abort a call that has already started.
    async fn invoke_detached(&self, call: &ToolCall, capabilities: &CapabilitySet) -> String {
        let tools = Arc::clone(&self.tools);
        let ctx = self.ctx.clone();
        let capabilities = capabilities.clone();
        let name = call.name.clone();
        let arguments = call.arguments.clone();
        let timeout = self.limits.tool_timeout;
        let handle = tokio::spawn(
            async move {
                tools
                    .invoke(&name, &arguments, &capabilities, &ctx, timeout)
                    .await
            }
            .instrument(tracing::Span::current()),
        );
        match handle.await {
            Ok(result) => result,
            Err(e) => format!("Error: tool '{}' failed: {}", call.name, e),
        }
    }
}

/// Enters the request span around every poll of the turn's stream, so
/// everything logged by the turn carries its request id.
struct InSpan {
    inner: TokenStream,
    span: tracing::Span,
}

impl Stream for InSpan {
    type Item = Result<String, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _enter = this.span.enter();
        this.inner.as_mut().poll_next(cx)
    }
}

/// System prompt, then the session history.
fn build_transcript(capabilities: &CapabilitySet, history: &[ChatTurn]) -> Vec<Message> {
    let mut transcript = Vec::with_capacity(history.len() + 1);
    if !capabilities.system_prompt.is_empty() {
        transcript.push(Message::System(capabilities.system_prompt.clone()));
    }
    transcript.extend(history.iter().map(|turn| match turn.role {
        Role::System => Message::System(turn.content.clone()),
        Role::User => Message::User(turn.content.clone()),
        Role::Assistant => Message::Assistant {
            content: turn.content.clone(),
            tool_calls: Vec::new(),
        },
    }));
    transcript
}

/// Session lock plus rollback: unless committed, the history is restored
/// to its length at `begin` when this is dropped.
struct PendingTurn {
    session: OwnedMutexGuard<Session>,
    base_len: usize,
    committed: bool,
}

impl PendingTurn {
    fn begin(mut session: OwnedMutexGuard<Session>) -> Self {
        session.touch();
        let base_len = session.history.len();
        Self {
            session,
            base_len,
            committed: false,
        }
    }

    fn commit(&mut self, assistant_text: String, max_turns: usize) {
        self.session.history.push(ChatTurn::assistant(assistant_text));
        self.session.trim_history(max_turns);
        self.session.touch();
        self.committed = true;
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        if !self.committed {
            self.session.history.truncate(self.base_len);
        }
    }
}
