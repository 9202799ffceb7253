//! Mode → capability registry.
//!
//! A [`CapabilityRegistry`] is a table of profiles, one per [`Mode`], each
//! naming an ordered list of tools and a prompt key, plus a table of prompt
//! texts. [`CapabilityRegistry::select`] is a pure lookup; everything it
//! returns is data, so deployments change tool bundles and prompts from
//! configuration without code changes.
//!
//! The built-in table:
//!
//! | Mode | Tools | Prompt |
//! |------|-------|--------|
//! | `auto` | every built-in tool | `auto` |
//! | `docs` | `search_files` | `docs` |
//! | `db` | `execute_sql_query` | `db` |
//! | `iot` | device and media tools | `iot` |

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::models::Mode;

pub const TOOL_DEVICE_STATUS: &str = "device_status";
pub const TOOL_CONTROL_DEVICE: &str = "control_device";
pub const TOOL_SHOW_CAMERA: &str = "show_camera";
pub const TOOL_SHOW_DEVICE_IMAGE: &str = "show_device_image";
pub const TOOL_EXECUTE_SQL: &str = "execute_sql_query";
pub const TOOL_SEARCH_FILES: &str = "search_files";

const SQL_RULES: &str = "\
SQL rules (mandatory):
1. Use only the tables and columns listed in the schema below.
2. Generate SELECT statements only. Never UPDATE, DELETE, INSERT, or alter the schema.
Database schema:
1. ProductionData (DeviceId, OutputQuantity, DefectQuantity, RecordTime)
2. DeviceAlarms (DeviceId, AlarmCode, DurationMinutes, AlarmTime)
3. MesOrders (OrderNo, ProductCode, TargetQuantity, CompletedQuantity, OrderStatus, PlanStartTime, ActualEndTime)";

const CHART_RULES: &str = "\
When the user asks for a chart or trend, reply with nothing but one JSON object:
{\"action\": \"render_chart\", \"title\": \"...\", \"chartType\": \"Bar\" or \"Line\", \"xAxis\": [\"label\", ...], \"series\": [number, ...]}";

const FILE_RULES: &str = "\
When a file search succeeds, reply with exactly the JSON object the tool gives you and nothing else.";

/// Tools and prompt key assigned to one mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityProfile {
    pub tools: Vec<String>,
    pub prompt_key: String,
}

impl CapabilityProfile {
    pub fn new(tools: &[&str], prompt_key: &str) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            prompt_key: prompt_key.to_string(),
        }
    }
}

/// What one request is allowed to use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySet {
    pub mode: Mode,
    pub tools: Vec<String>,
    pub system_prompt: String,
}

impl CapabilitySet {
    pub fn allows(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CapabilityError {
    #[error("mode '{mode}' references unknown prompt '{key}'")]
    UnknownPrompt { mode: Mode, key: String },
}

#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    profiles: BTreeMap<&'static str, (Mode, CapabilityProfile)>,
    prompts: BTreeMap<String, String>,
}

impl CapabilityRegistry {
    /// An empty registry. Every mode must be given a profile before use.
    pub fn empty() -> Self {
        Self {
            profiles: BTreeMap::new(),
            prompts: BTreeMap::new(),
        }
    }

    /// The default console bundles and prompts.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.set_profile(
            Mode::Auto,
            CapabilityProfile::new(
                &[
                    TOOL_DEVICE_STATUS,
                    TOOL_CONTROL_DEVICE,
                    TOOL_SHOW_CAMERA,
                    TOOL_SHOW_DEVICE_IMAGE,
                    TOOL_EXECUTE_SQL,
                    TOOL_SEARCH_FILES,
                ],
                "auto",
            ),
        );
        registry.set_profile(Mode::Docs, CapabilityProfile::new(&[TOOL_SEARCH_FILES], "docs"));
        registry.set_profile(Mode::Db, CapabilityProfile::new(&[TOOL_EXECUTE_SQL], "db"));
        registry.set_profile(
            Mode::Iot,
            CapabilityProfile::new(
                &[
                    TOOL_DEVICE_STATUS,
                    TOOL_CONTROL_DEVICE,
                    TOOL_SHOW_CAMERA,
                    TOOL_SHOW_DEVICE_IMAGE,
                ],
                "iot",
            ),
        );

        registry.set_prompt(
            "auto",
            format!(
                "You are an all-round industrial IoT assistant in Auto mode. You may combine \
                 database queries, live device telemetry, camera feeds, and the local file \
                 library to solve the user's problem.\n{SQL_RULES}\n{CHART_RULES}\n{FILE_RULES}"
            ),
        );
        registry.set_prompt(
            "docs",
            format!(
                "You are an industrial equipment maintenance expert in Docs mode. Answer from \
                 the reference material provided with the question, or look up files the user \
                 needs in the local file library.\n{FILE_RULES}"
            ),
        );
        registry.set_prompt(
            "db",
            format!(
                "You are a data analysis expert for industrial IoT and MES systems in DB mode.\n\
                 {SQL_RULES}\n{CHART_RULES}"
            ),
        );
        registry.set_prompt(
            "iot",
            "You are the device control center assistant in IoT mode. You read live device \
             status, send device commands, and bring up camera feeds and device images."
                .to_string(),
        );
        registry
    }

    pub fn set_profile(&mut self, mode: Mode, profile: CapabilityProfile) {
        self.profiles.insert(mode.as_str(), (mode, profile));
    }

    pub fn set_prompt(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.prompts.insert(key.into(), text.into());
    }

    pub fn profile(&self, mode: Mode) -> Option<&CapabilityProfile> {
        self.profiles.get(mode.as_str()).map(|(_, p)| p)
    }

    /// All configured profiles, ordered by mode name.
    pub fn profiles(&self) -> impl Iterator<Item = (Mode, &CapabilityProfile)> {
        self.profiles.values().map(|(m, p)| (*m, p))
    }

    /// Check that every profile's prompt key resolves.
    pub fn validate(&self) -> Result<(), CapabilityError> {
        for (mode, profile) in self.profiles() {
            if !self.prompts.contains_key(&profile.prompt_key) {
                return Err(CapabilityError::UnknownPrompt {
                    mode,
                    key: profile.prompt_key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the capability set for `mode`.
    ///
    /// A mode without a profile resolves as [`Mode::Auto`]; if Auto is also
    /// missing the set is empty.
    pub fn select(&self, mode: Mode) -> CapabilitySet {
        let (mode, profile) = match self.profiles.get(mode.as_str()) {
            Some((m, p)) => (*m, Some(p)),
            None => (Mode::Auto, self.profile(Mode::Auto)),
        };
        match profile {
            Some(profile) => CapabilitySet {
                mode,
                tools: profile.tools.clone(),
                system_prompt: self
                    .prompts
                    .get(&profile.prompt_key)
                    .cloned()
                    .unwrap_or_default(),
            },
            None => CapabilitySet {
                mode,
                tools: Vec::new(),
                system_prompt: String::new(),
            },
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_validates() {
        assert_eq!(CapabilityRegistry::builtin().validate(), Ok(()));
    }

    #[test]
    fn test_select_is_deterministic() {
        let registry = CapabilityRegistry::builtin();
        assert_eq!(registry.select(Mode::Db), registry.select(Mode::Db));
    }

    #[test]
    fn test_db_and_iot_are_disjoint() {
        let registry = CapabilityRegistry::builtin();
        let db = registry.select(Mode::Db);
        let iot = registry.select(Mode::Iot);
        assert!(db.tools.iter().all(|t| !iot.allows(t)));
        assert!(!iot.allows(TOOL_EXECUTE_SQL));
        assert!(db.allows(TOOL_EXECUTE_SQL));
    }

    #[test]
    fn test_prompts_encode_domain_constraints() {
        let registry = CapabilityRegistry::builtin();
        let db = registry.select(Mode::Db).system_prompt;
        assert!(db.contains("SELECT statements only"));
        assert!(db.contains("ProductionData"));
        assert_ne!(db, registry.select(Mode::Iot).system_prompt);
    }

    #[test]
    fn test_auto_has_every_tool() {
        let registry = CapabilityRegistry::builtin();
        let auto = registry.select(Mode::Auto);
        for mode in Mode::ALL {
            for tool in registry.select(mode).tools {
                assert!(auto.allows(&tool), "auto missing {tool}");
            }
        }
    }

    #[test]
    fn test_missing_profile_falls_back_to_auto() {
        let mut registry = CapabilityRegistry::empty();
        registry.set_profile(Mode::Auto, CapabilityProfile::new(&["a"], "p"));
        registry.set_prompt("p", "prompt");
        let set = registry.select(Mode::Db);
        assert_eq!(set.mode, Mode::Auto);
        assert_eq!(set.tools, vec!["a".to_string()]);
        assert_eq!(set.system_prompt, "prompt");
    }

    #[test]
    fn test_unknown_prompt_rejected() {
        let mut registry = CapabilityRegistry::builtin();
        registry.set_profile(Mode::Iot, CapabilityProfile::new(&[], "nope"));
        assert_eq!(
            registry.validate(),
            Err(CapabilityError::UnknownPrompt {
                mode: Mode::Iot,
                key: "nope".into()
            })
        );
    }
}
