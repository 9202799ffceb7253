//! # IIoT Assistant
//!
//! A conversational assistant for industrial-IoT operations consoles. A
//! user asks in natural language; the assistant retrieves supporting
//! context from a local knowledge directory, lets the model call backend
//! tools (device telemetry, SQL analytics, media and file lookup), and
//! streams the answer back token by token. Structured commands the model
//! embeds in its reply ("render a chart", "offer a file") are detected and
//! delivered as typed actions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Knowledge  │──▶│ Chunk+Embed │──▶│ In-memory    │
//! │ directory  │   │  (ingest)   │   │ vector index │
//! └────────────┘   └─────────────┘   └──────┬───────┘
//!                                           │ retrieve
//!   POST /chat ──▶ Orchestrator ◀───────────┘
//!                   │  ▲   │
//!          tool call│  │   │tokens
//!                   ▼  │   ▼
//!              ToolRegistry  dispatch ──▶ SSE display events
//!                   │
//!                   └── PushChannel ──▶ GET /push (SSE)
//! ```
//!
//! Pure logic (data model, chunking, retrieval, capability table, action
//! detection) lives in the `iiot-assistant-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`extract`] | Text extraction for PDF, DOCX, XLSX, Markdown, text |
//! | [`embedding`] | OpenAI-compatible and Ollama embedders |
//! | [`ingest`] | Knowledge directory scan, chunk, embed, index |
//! | [`llm`] | Streaming chat-completions client with tool calling |
//! | [`tools`] | Tool trait, registry and the console tools |
//! | [`orchestrator`] | One conversational turn as a token stream |
//! | [`dispatch`] | Action detection over the token stream |
//! | [`session`] | Per-session conversation history |
//! | [`push`] | Out-of-band broadcast channel |
//! | [`db`] | Read-only SQLite pool and demo database |
//! | [`server`] | Axum HTTP/SSE server |
//! | [`error`] | Conversation error type |

pub mod config;
pub mod db;
pub mod dispatch;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod orchestrator;
pub mod push;
pub mod server;
pub mod session;
pub mod tools;
