//! Configuration parsing and validation.
//!
//! The assistant is configured through a TOML file (default
//! `config/assistant.toml`). Every section is optional; [`Config::minimal`]
//! is what an empty file produces.
//!
//! # Example
//!
//! ```toml
//! [llm]
//! base_url = "https://dashscope.aliyuncs.com/compatible-mode/v1"
//! model = "deepseek-v3"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-v3"
//! dims = 1024
//! url = "https://dashscope.aliyuncs.com/compatible-mode/v1"
//!
//! [knowledge]
//! root = "./Data"
//!
//! [server]
//! bind = "0.0.0.0:5109"
//! public_url = "http://192.168.1.20:5109"
//!
//! [tools]
//! database_url = "sqlite://./data/mes.sqlite"
//!
//! [modes.iot]
//! tools = ["device_status", "show_camera"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use iiot_assistant_core::capability::{CapabilityProfile, CapabilityRegistry};
use iiot_assistant_core::models::Mode;
use iiot_assistant_core::search::RetrievalParams;
use serde::Deserialize;

/// URL path segment serving the knowledge directory.
pub const FILES_MOUNT: &str = "files";
/// URL path segment serving `tools.image_dir`, when set.
pub const IMAGES_MOUNT: &str = "images";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    /// Per-mode overrides keyed by `auto`, `docs`, `db`, `iot`.
    #[serde(default)]
    pub modes: HashMap<String, ModeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
            temperature: None,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "deepseek-v3".to_string()
}
fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_tool_rounds() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL. Defaults to the OpenAI API or `http://localhost:11434`
    /// for Ollama.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f32,
    #[serde(default = "default_true")]
    pub ingest_on_startup: bool,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            root: default_knowledge_root(),
            max_chunk_chars: default_max_chunk_chars(),
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            ingest_on_startup: true,
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_knowledge_root() -> PathBuf {
    PathBuf::from("Data")
}
fn default_max_chunk_chars() -> usize {
    iiot_assistant_core::chunk::DEFAULT_MAX_CHUNK_CHARS
}
fn default_top_k() -> usize {
    3
}
fn default_min_relevance() -> f32 {
    0.15
}
fn default_true() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

impl KnowledgeConfig {
    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            top_k: self.top_k,
            min_relevance: self.min_relevance,
        }
    }

    /// Compile `exclude_globs`. An empty list matches nothing.
    pub fn exclude_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_globs {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid knowledge.exclude_globs entry '{}'", pattern))?,
            );
        }
        Ok(builder.build()?)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL used to build download links.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5109".to_string()
}

impl ServerConfig {
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    #[serde(default = "default_push_capacity")]
    pub capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            capacity: default_push_capacity(),
        }
    }
}

fn default_push_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// User/assistant exchanges kept per session; older ones are dropped.
    /// `0` keeps everything.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            max_turns: default_max_turns(),
        }
    }
}

fn default_idle_ttl_secs() -> u64 {
    3600
}

fn default_max_turns() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// SQLite URL for `execute_sql_query`. The tool is not registered when unset.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_sql_max_rows")]
    pub sql_max_rows: usize,
    /// Directory searched by `show_device_image`. Defaults to the knowledge root.
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    /// `{location}` is replaced with the requested camera location.
    #[serde(default = "default_camera_url_template")]
    pub camera_url_template: String,
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
    #[serde(default = "default_true")]
    pub simulate_devices: bool,
    #[serde(default = "default_simulate_interval_ms")]
    pub simulate_interval_ms: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sql_max_rows: default_sql_max_rows(),
            image_dir: None,
            camera_url_template: default_camera_url_template(),
            devices: default_devices(),
            simulate_devices: true,
            simulate_interval_ms: default_simulate_interval_ms(),
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_sql_max_rows() -> usize {
    200
}
fn default_camera_url_template() -> String {
    "rtsp://192.168.1.100/{location}_stream".to_string()
}
fn default_devices() -> Vec<String> {
    vec![
        "Motor-01".to_string(),
        "Motor-02".to_string(),
        "Pump-01".to_string(),
    ]
}
fn default_simulate_interval_ms() -> u64 {
    1000
}
fn default_tool_timeout_secs() -> u64 {
    30
}

/// Prompt text overrides. `file` names a TOML table of `key = "text"`
/// entries; inline keys win over the file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(flatten)]
    pub inline: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModeConfig {
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl Config {
    /// The configuration an empty file produces.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Build the mode registry: built-in table, then prompt file, then
    /// inline prompts, then per-mode overrides.
    pub fn capability_registry(&self) -> Result<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::builtin();

        if let Some(path) = &self.prompts.file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompts file: {}", path.display()))?;
            let table: HashMap<String, String> = toml::from_str(&content)
                .with_context(|| format!("Failed to parse prompts file: {}", path.display()))?;
            for (key, text) in table {
                registry.set_prompt(key, text);
            }
        }
        for (key, text) in &self.prompts.inline {
            registry.set_prompt(key.clone(), text.clone());
        }

        for (name, overrides) in &self.modes {
            let mode = Mode::try_from_label(name)
                .with_context(|| format!("Unknown mode '{}' in [modes]", name))?;
            let base = registry
                .profile(mode)
                .cloned()
                .unwrap_or_else(|| CapabilityProfile::new(&[], mode.as_str()));
            registry.set_profile(
                mode,
                CapabilityProfile {
                    tools: overrides.tools.clone().unwrap_or(base.tools),
                    prompt_key: overrides.prompt.clone().unwrap_or(base.prompt_key),
                },
            );
        }

        registry.validate()?;
        Ok(registry)
    }

    /// Directory searched by `show_device_image`.
    pub fn image_root(&self) -> PathBuf {
        self.tools
            .image_dir
            .clone()
            .unwrap_or_else(|| self.knowledge.root.clone())
    }

    /// Static mount the image directory is served under: its own
    /// `/images` mount when configured, otherwise the knowledge `/files`.
    pub fn image_mount(&self) -> &'static str {
        if self.tools.image_dir.is_some() {
            IMAGES_MOUNT
        } else {
            FILES_MOUNT
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.knowledge.max_chunk_chars == 0 {
            bail!("knowledge.max_chunk_chars must be > 0");
        }
        if self.knowledge.top_k < 1 {
            bail!("knowledge.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.knowledge.min_relevance) {
            bail!("knowledge.min_relevance must be in [-1.0, 1.0]");
        }
        self.knowledge.exclude_set()?;

        if self.llm.max_tool_rounds < 1 {
            bail!("llm.max_tool_rounds must be >= 1");
        }
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        if self.push.capacity == 0 {
            bail!("push.capacity must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        self.capability_registry()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_minimal() {
        let config = parse_config("").unwrap();
        assert_eq!(config.knowledge.max_chunk_chars, 500);
        assert_eq!(config.knowledge.top_k, 3);
        assert!((config.knowledge.min_relevance - 0.15).abs() < f32::EPSILON);
        assert_eq!(config.llm.max_tool_rounds, 8);
        assert_eq!(config.tools.devices.len(), 3);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn public_url_defaults_to_bind() {
        let config = parse_config("[server]\nbind = \"0.0.0.0:8080\"\n").unwrap();
        assert_eq!(config.server.public_url(), "http://0.0.0.0:8080");
        let config =
            parse_config("[server]\npublic_url = \"http://plant.local:5109/\"\n").unwrap();
        assert_eq!(config.server.public_url(), "http://plant.local:5109");
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = parse_config("[knowledge]\nmax_chunk_chars = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_chunk_chars"));
    }

    #[test]
    fn rejects_enabled_embedding_without_dims() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n").unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse_config(
            "[embedding]\nprovider = \"magic\"\nmodel = \"m\"\ndims = 4\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn mode_overrides_apply() {
        let config = parse_config(
            "[prompts]\nterse = \"Be brief.\"\n\n[modes.iot]\ntools = [\"device_status\"]\nprompt = \"terse\"\n",
        )
        .unwrap();
        let registry = config.capability_registry().unwrap();
        let set = registry.select(Mode::Iot);
        assert_eq!(set.tools, vec!["device_status".to_string()]);
        assert_eq!(set.system_prompt, "Be brief.");
        assert!(registry.select(Mode::Db).allows("execute_sql_query"));
    }

    #[test]
    fn rejects_unknown_mode_and_prompt() {
        let err = parse_config("[modes.weather]\ntools = []\n").unwrap_err();
        assert!(format!("{:#}", err).contains("weather"));
        let err = parse_config("[modes.db]\nprompt = \"missing\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("missing"));
    }

    #[test]
    fn prompts_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.toml");
        std::fs::write(&path, "docs = \"Answer from the manuals.\"\n").unwrap();
        let config = parse_config(&format!(
            "[prompts]\nfile = \"{}\"\n",
            path.display().to_string().replace('\\', "/")
        ))
        .unwrap();
        let registry = config.capability_registry().unwrap();
        assert_eq!(registry.select(Mode::Docs).system_prompt, "Answer from the manuals.");
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../config/assistant.example.toml")).unwrap();
        assert_eq!(config.embedding.dims, Some(1024));
        assert_eq!(config.server.public_url(), "http://192.168.1.20:5109");
        assert_eq!(config.image_mount(), FILES_MOUNT);
    }

    #[test]
    fn rejects_bad_exclude_glob() {
        assert!(parse_config("[knowledge]\nexclude_globs = [\"a[\"]\n").is_err());
    }
}
