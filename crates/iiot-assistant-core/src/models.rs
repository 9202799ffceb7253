//! Core data models shared by the ingestion, retrieval, and conversation
//! pipeline.
//!
//! Wire-facing types ([`PushEvent`], [`ActionPayload`]) serialize with the
//! camelCase field names the console client expects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating mode selecting a capability bundle for one request.
///
/// Unknown or missing labels resolve to [`Mode::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Docs,
    Db,
    Iot,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Auto, Mode::Docs, Mode::Db, Mode::Iot];

    /// Strict parse: `auto`, `docs`, `db`, `iot` (case-insensitive), or a
    /// console label whose parenthesised suffix is one of those, such as
    /// `"数据报表 (DB)"`.
    pub fn try_from_label(label: &str) -> Option<Mode> {
        let label = label.trim();
        let key = match (label.rfind('('), label.ends_with(')')) {
            (Some(open), true) => &label[open + 1..label.len() - 1],
            _ => label,
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Mode::Auto),
            "docs" => Some(Mode::Docs),
            "db" => Some(Mode::Db),
            "iot" => Some(Mode::Iot),
            _ => None,
        }
    }

    /// Lenient parse used for inbound requests.
    pub fn from_label(label: Option<&str>) -> Mode {
        label.and_then(Mode::try_from_label).unwrap_or_default()
    }

    /// Whether requests in this mode are augmented with retrieved context.
    pub fn uses_retrieval(self) -> bool {
        matches!(self, Mode::Auto | Mode::Docs)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Docs => "docs",
            Mode::Db => "db",
            Mode::Iot => "iot",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded unit of ingested text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeChunk {
    /// `doc_chunk_{n}`, unique within one ingestion run.
    pub id: String,
    pub text: String,
    /// Provenance label, the source file name.
    pub source_description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Image,
    Video,
    Text,
}

/// Out-of-band notification broadcast to every connected consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub role: Role,
    pub media_type: MediaType,
    pub content: String,
    pub media_path: Option<String>,
}

impl PushEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            media_type: MediaType::Text,
            content: content.into(),
            media_path: None,
        }
    }

    pub fn media(
        media_type: MediaType,
        content: impl Into<String>,
        media_path: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            media_type,
            content: content.into(),
            media_path: Some(media_path.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ChartType {
    #[default]
    Bar,
    Line,
}

/// A structured command the model embedded in its reply text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionPayload {
    #[serde(rename_all = "camelCase")]
    RenderChart {
        title: String,
        chart_type: ChartType,
        x_axis: Vec<String>,
        series: Vec<f64>,
    },
    #[serde(rename_all = "camelCase")]
    SendFile { file_name: String, url: String },
}

impl ActionPayload {
    pub fn name(&self) -> &'static str {
        match self {
            ActionPayload::RenderChart { .. } => "render_chart",
            ActionPayload::SendFile { .. } => "send_file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_labels() {
        assert_eq!(Mode::try_from_label("DB"), Some(Mode::Db));
        assert_eq!(Mode::try_from_label(" iot "), Some(Mode::Iot));
        assert_eq!(Mode::try_from_label("数据报表 (DB)"), Some(Mode::Db));
        assert_eq!(Mode::try_from_label("知识问答 (Docs)"), Some(Mode::Docs));
        assert_eq!(Mode::try_from_label("weather"), None);
    }

    #[test]
    fn test_unknown_mode_falls_back_to_auto() {
        assert_eq!(Mode::from_label(Some("weather")), Mode::Auto);
        assert_eq!(Mode::from_label(None), Mode::Auto);
    }

    #[test]
    fn test_retrieval_modes() {
        assert!(Mode::Auto.uses_retrieval());
        assert!(Mode::Docs.uses_retrieval());
        assert!(!Mode::Db.uses_retrieval());
        assert!(!Mode::Iot.uses_retrieval());
    }

    #[test]
    fn test_push_event_wire_shape() {
        let ev = PushEvent::media(MediaType::Video, "camera", "rtsp://cam/line1_stream");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["mediaType"], "Video");
        assert_eq!(json["mediaPath"], "rtsp://cam/line1_stream");
    }

    #[test]
    fn test_action_payload_wire_shape() {
        let payload = ActionPayload::RenderChart {
            title: "Output".into(),
            chart_type: ChartType::Line,
            x_axis: vec!["Mon".into()],
            series: vec![3.0],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["action"], "render_chart");
        assert_eq!(json["chartType"], "Line");
        assert_eq!(json["xAxis"][0], "Mon");

        let file = ActionPayload::SendFile {
            file_name: "manual.pdf".into(),
            url: "http://host/files/manual.pdf".into(),
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["action"], "send_file");
        assert_eq!(json["fileName"], "manual.pdf");
    }
}
