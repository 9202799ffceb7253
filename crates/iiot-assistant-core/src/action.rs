//! Embedded-action detection for streamed model output.
//!
//! The model may answer with a JSON command (`render_chart`, `send_file`)
//! instead of prose. [`ActionDetector`] watches the token stream: while the
//! reply looks like prose it forwards tokens as they arrive; once the reply
//! opens with `{` or a code fence it stops forwarding, asks the caller to
//! show a placeholder, and keeps accumulating. At end of stream the full
//! text is re-scanned and parsed leniently, prose replies included, so an
//! action echoed after a lead-in sentence is still delivered. A structured
//! reply that turns out not to be a valid action is handed back verbatim.
//!
//! Model output is untrusted. Nothing here panics on malformed input.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{ActionPayload, ChartType};

/// Text shown while a structured reply is being accumulated.
pub const PLACEHOLDER_TEXT: &str = "Preparing a structured result...";

const ACTION_NAMES: [&str; 2] = ["render_chart", "send_file"];
const FENCE: &str = "```";

/// What the caller should do after feeding one token.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorStep {
    /// Display this text now.
    Forward(String),
    /// The reply looks structured; display a neutral placeholder.
    Placeholder,
    /// Nothing to display yet.
    Hold,
}

/// Final disposition of a reply once the stream has ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Everything was already forwarded.
    Passthrough,
    /// A valid action. A placeholder, if one was shown, should be discarded;
    /// forwarded prose stays.
    Action(ActionPayload),
    /// Show this full text verbatim in place of anything held back.
    Fallback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Undecided,
    Plain,
    Structured,
}

/// Incremental detector over one reply's token stream.
#[derive(Debug)]
pub struct ActionDetector {
    text: String,
    state: State,
}

impl Default for ActionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDetector {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            state: State::Undecided,
        }
    }

    /// Full text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_structured(&self) -> bool {
        self.state == State::Structured
    }

    /// Feed the next token.
    ///
    /// Leading whitespace and a partial code fence are held until the first
    /// decisive character arrives, then released in order on the prose path.
    pub fn push(&mut self, token: &str) -> DetectorStep {
        self.text.push_str(token);
        match self.state {
            State::Plain => DetectorStep::Forward(token.to_string()),
            State::Structured => DetectorStep::Hold,
            State::Undecided => {
                let head = self.text.trim_start();
                if head.is_empty() || (head.len() < FENCE.len() && FENCE.starts_with(head)) {
                    DetectorStep::Hold
                } else if head.starts_with('{') || head.starts_with(FENCE) {
                    self.state = State::Structured;
                    DetectorStep::Placeholder
                } else {
                    self.state = State::Plain;
                    DetectorStep::Forward(self.text.clone())
                }
            }
        }
    }

    /// End of stream.
    pub fn finish(self) -> Verdict {
        match self.state {
            State::Plain => match parse_embedded_action(&self.text) {
                Ok(payload) => Verdict::Action(payload),
                Err(_) => Verdict::Passthrough,
            },
            State::Undecided if self.text.is_empty() => Verdict::Passthrough,
            State::Undecided => Verdict::Fallback(self.text),
            State::Structured => match parse_embedded_action(&self.text) {
                Ok(payload) => Verdict::Action(payload),
                Err(_) => Verdict::Fallback(self.text),
            },
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ActionParseError {
    #[error("no JSON object in text")]
    NoObject,
    #[error("no recognized action name in candidate object")]
    UnknownAction,
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),
    #[error("field '{0}' has the wrong shape")]
    InvalidField(&'static str),
}

/// Locate, parse, and validate an action object embedded in `text`.
///
/// The candidate spans from the first `{` to the last `}`; it must mention
/// a recognized action name. Field names are matched case-insensitively
/// (`fileName`, `filename`, and `file_name` are all accepted), trailing
/// commas are tolerated, and numbers may be quoted.
pub fn parse_embedded_action(text: &str) -> Result<ActionPayload, ActionParseError> {
    let span = candidate_span(text).ok_or(ActionParseError::NoObject)?;
    let lower = span.to_lowercase();
    if !ACTION_NAMES.iter().any(|name| lower.contains(name)) {
        return Err(ActionParseError::UnknownAction);
    }

    let value = parse_lenient_json(span)?;
    let obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(ActionParseError::NoObject),
    };

    let action = string_field(&obj, &["action"])
        .ok_or(ActionParseError::MissingField("action"))?
        .to_lowercase();
    match action.as_str() {
        "render_chart" => render_chart(&obj),
        "send_file" => send_file(&obj),
        _ => Err(ActionParseError::UnknownAction),
    }
}

fn candidate_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Parse JSON after removing trailing commas and lowercasing object keys.
pub fn parse_lenient_json(span: &str) -> Result<Value, ActionParseError> {
    let cleaned = strip_trailing_commas(span);
    let value: Value =
        serde_json::from_str(&cleaned).map_err(|e| ActionParseError::Json(e.to_string()))?;
    Ok(lowercase_keys(value))
}

/// Drop commas that directly precede `}` or `]`, ignoring string contents.
fn strip_trailing_commas(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n)).filter(|v| !v.is_null())
}

fn string_field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    field(obj, names)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn render_chart(obj: &Map<String, Value>) -> Result<ActionPayload, ActionParseError> {
    let title = string_field(obj, &["title"]).ok_or(ActionParseError::MissingField("title"))?;

    let chart_type = match field(obj, &["charttype", "chart_type"]).and_then(Value::as_str) {
        Some(s) if s.trim().eq_ignore_ascii_case("line") => ChartType::Line,
        _ => ChartType::Bar,
    };

    let x_axis = match field(obj, &["xaxis", "x_axis"]) {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(ActionParseError::InvalidField("xAxis")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(ActionParseError::InvalidField("xAxis")),
    };

    let series_items = match field(obj, &["series"]) {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ActionParseError::InvalidField("series")),
        None => return Err(ActionParseError::MissingField("series")),
    };
    // `[{"name": ..., "data": [...]}]` is accepted; the first series wins.
    let series_items = match series_items.first() {
        Some(Value::Object(first)) => match first.get("data") {
            Some(Value::Array(data)) => data,
            _ => return Err(ActionParseError::InvalidField("series")),
        },
        _ => series_items,
    };
    let series = series_items
        .iter()
        .map(number_value)
        .collect::<Option<Vec<f64>>>()
        .ok_or(ActionParseError::InvalidField("series"))?;
    if series.is_empty() {
        return Err(ActionParseError::MissingField("series"));
    }

    Ok(ActionPayload::RenderChart {
        title: title.to_string(),
        chart_type,
        x_axis,
        series,
    })
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn send_file(obj: &Map<String, Value>) -> Result<ActionPayload, ActionParseError> {
    let file_name = string_field(obj, &["filename", "file_name"])
        .ok_or(ActionParseError::MissingField("fileName"))?;
    let url = string_field(obj, &["url"]).ok_or(ActionParseError::MissingField("url"))?;
    Ok(ActionPayload::SendFile {
        file_name: file_name.to_string(),
        url: url.to_string(),
    })
}
