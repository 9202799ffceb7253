//! `search_files`: find a document in the knowledge directory and hand the
//! model a `send_file` action to relay as a download card.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use iiot_assistant_core::capability::TOOL_SEARCH_FILES;
use iiot_assistant_core::models::ActionPayload;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{file_url, required_str, Tool, ToolContext};
use crate::config::FILES_MOUNT;

pub struct SearchFilesTool {
    root: PathBuf,
}

impl SearchFilesTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Relative paths whose file name contains `keyword`
    /// (case-insensitive), in sorted traversal order.
    pub fn find(&self, keyword: &str) -> Vec<PathBuf> {
        let needle = keyword.to_lowercase();
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&needle)
            })
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| p.to_path_buf())
            })
            .collect()
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        TOOL_SEARCH_FILES
    }

    fn description(&self) -> &str {
        "Find a file in the document library by name or keyword and produce a download card for it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": { "type": "string", "description": "File name or keyword to search for" }
            },
            "required": ["keyword"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let keyword = required_str(&params, "keyword")?;
        if !self.root.is_dir() {
            return Ok("The document library directory is not configured or does not exist.".into());
        }

        let root = self.root.clone();
        let keyword_owned = keyword.to_string();
        let tool = SearchFilesTool::new(root);
        let matches = tokio::task::spawn_blocking(move || tool.find(&keyword_owned)).await?;

        let Some(first) = matches.first() else {
            return Ok(format!("No file matching '{keyword}' was found."));
        };
        let file_name = first
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url = file_url(&ctx.public_url, FILES_MOUNT, first)?;
        tracing::debug!(%keyword, matches = matches.len(), file = %file_name, "file search matched");

        let action = serde_json::to_string(&ActionPayload::SendFile {
            file_name: file_name.clone(),
            url,
        })?;
        Ok(format!(
            "Found file: {file_name}. Reply with exactly the following JSON and nothing else:\n{action}"
        ))
    }
}
