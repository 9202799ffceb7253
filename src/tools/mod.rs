//! Tool trait, registry and the reference tools.
//!
//! A [`Tool`] is a named, schema-described operation the model may call
//! during generation. Results are always text handed back to the model;
//! the registry converts every failure (unknown tool, malformed arguments,
//! timeout, execution error) into such text, so a tool can never abort a
//! conversation.
//!
//! ```text
//! ┌──────────────────────────── ToolRegistry ────────────────────────────┐
//! │ device_status  control_device  show_camera  show_device_image        │
//! │ execute_sql_query  search_files                                       │
//! └───────────────┬──────────────────────────────────────────────────────┘
//!                 │ invoke(name, args, capabilities)
//!                 ▼
//!        only tools in the request's CapabilitySet are callable
//! ```

pub mod database;
pub mod device;
pub mod files;
pub mod media;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use iiot_assistant_core::capability::CapabilitySet;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::llm::ToolDefinition;
use crate::push::PushChannel;

pub use device::DeviceCache;

/// An operation the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name the model calls, e.g. `"device_status"`.
    fn name(&self) -> &str;

    /// One-line description the model uses to decide whether to call it.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. `params` is always a JSON object.
    ///
    /// Return `Ok` with instructive text for outcomes the model should
    /// react to (no rows, no match); return `Err` for genuine failures.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

/// What tools can reach while executing.
#[derive(Clone)]
pub struct ToolContext {
    pub push: PushChannel,
    /// Externally reachable base URL of this server, without trailing `/`.
    pub public_url: String,
}

impl ToolContext {
    pub fn new(push: PushChannel, public_url: impl Into<String>) -> Self {
        Self {
            push,
            public_url: public_url.into(),
        }
    }
}

/// Entry of `GET /tools/list` and `assistant tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register the reference tools wired to the configured backends.
    pub fn from_config(config: &Config, devices: DeviceCache) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(device::DeviceStatusTool::new(devices.clone())));
        registry.register(Arc::new(device::ControlDeviceTool::new(devices)));
        registry.register(Arc::new(media::ShowCameraTool::new(
            config.tools.camera_url_template.clone(),
        )));
        registry.register(Arc::new(media::ShowDeviceImageTool::new(
            config.image_root(),
            config.image_mount(),
        )));
        let pool = match &config.tools.database_url {
            Some(url) => Some(crate::db::connect_read_only(url)?),
            None => None,
        };
        registry.register(Arc::new(database::SqlQueryTool::new(
            pool,
            config.tools.sql_max_rows,
        )));
        registry.register(Arc::new(files::SearchFilesTool::new(
            config.knowledge.root.clone(),
        )));
        Ok(registry)
    }

    /// Register a tool. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Definitions sent to the model for one request, in capability order.
    pub fn definitions_for(&self, capabilities: &CapabilitySet) -> Vec<ToolDefinition> {
        capabilities
            .tools
            .iter()
            .filter_map(|name| match self.find(name) {
                Some(tool) => Some(ToolDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                }),
                None => {
                    tracing::warn!(tool = %name, mode = %capabilities.mode, "capability names an unregistered tool");
                    None
                }
            })
            .collect()
    }

    /// Execute one model-requested call and return the text result.
    ///
    /// Never fails: every error becomes a result string for the model.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &str,
        capabilities: &CapabilitySet,
        ctx: &ToolContext,
        timeout: Option<Duration>,
    ) -> String {
        let tool = match self.find(name) {
            Some(tool) if capabilities.allows(name) => tool,
            _ => {
                tracing::warn!(tool = %name, mode = %capabilities.mode, "model requested a tool outside the capability set");
                return format!(
                    "Error: unknown tool '{}'. Available tools: {}.",
                    name,
                    capabilities.tools.join(", ")
                );
            }
        };

        let params = match parse_arguments(arguments) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "malformed tool arguments");
                return format!("Error: invalid arguments for tool '{name}': {e}");
            }
        };

        let started = Instant::now();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(params, ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(tool = %name, ?limit, "tool timed out");
                    return format!("Error: tool '{name}' timed out after {limit:?}.");
                }
            },
            None => tool.execute(params, ctx).await,
        };

        match outcome {
            Ok(text) => {
                tracing::info!(tool = %name, elapsed_ms = started.elapsed().as_millis() as u64, "tool call completed");
                text
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool call failed");
                format!("Error: tool '{name}' failed: {e:#}")
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_arguments(arguments: &str) -> Result<Value> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_json::from_str(arguments)?;
    if !value.is_object() {
        bail!("expected a JSON object");
    }
    Ok(value)
}

/// Read a required string argument. Key lookup falls back to a
/// case-insensitive match since models are inconsistent about casing.
pub fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    let value = params.get(key).or_else(|| {
        params.as_object().and_then(|map| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    });
    match value.and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(anyhow!("missing required argument '{key}'")),
    }
}

/// Download URL for a file under a static mount, with each path segment
/// percent-encoded.
pub fn file_url(public_url: &str, mount: &str, relative: &Path) -> Result<String> {
    let mut url = reqwest::Url::parse(public_url)
        .map_err(|e| anyhow!("invalid public url '{public_url}': {e}"))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow!("public url '{public_url}' cannot be a base"))?;
        segments.pop_if_empty().push(mount);
        for component in relative.components() {
            segments.push(&component.as_os_str().to_string_lossy());
        }
    }
    Ok(url.to_string())
}
