//! # IIoT Assistant Core
//!
//! Shared, I/O-free logic for the IIoT assistant: data models, chunking,
//! knowledge store abstraction, retrieval ranking, mode capability
//! registry, and the embedded-action detector.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem code. The
//! `iiot-assistant` service crate supplies the concrete embedders, model
//! client, tools, and transport.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Modes, chunks, chat turns, push events, action payloads |
//! | [`chunk`] | Line-boundary chunker and chunk id sequence |
//! | [`embedding`] | [`Embedder`](embedding::Embedder) trait and cosine similarity |
//! | [`store`] | [`KnowledgeStore`](store::KnowledgeStore) trait and in-memory index |
//! | [`search`] | Top-K retrieval with a relevance floor |
//! | [`capability`] | Mode → tools + system prompt registry |
//! | [`action`] | Streaming action detector and lenient payload parser |

pub mod action;
pub mod capability;
pub mod chunk;
pub mod embedding;
pub mod models;
pub mod search;
pub mod store;
