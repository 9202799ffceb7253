//! Action dispatch over a token stream.
//!
//! [`dispatch`] runs an [`ActionDetector`] over the orchestrator's tokens and
//! yields [`DisplayEvent`]s for the console:
//!
//! | Reply shape | Events |
//! |-------------|--------|
//! | prose | `text`* `done` |
//! | valid action JSON | `placeholder` `action` `done` |
//! | prose, then action JSON | `text`* `action` `done` |
//! | `{`-prefixed but invalid | `placeholder` `replace` `done` |
//! | model error mid-reply | … `replace`? `error` |

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use iiot_assistant_core::action::{ActionDetector, DetectorStep, Verdict, PLACEHOLDER_TEXT};
use iiot_assistant_core::models::ActionPayload;
use serde::Serialize;

use crate::orchestrator::TokenStream;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    /// Append this text to the reply.
    Text { delta: String },
    /// Show a neutral placeholder while a structured reply accumulates.
    Placeholder { text: String },
    /// Render this command and discard the placeholder, if one is shown.
    Action { payload: ActionPayload },
    /// Replace whatever is displayed with this full text.
    Replace { text: String },
    Error { code: String, message: String },
    Done,
}

impl DisplayEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            DisplayEvent::Text { .. } => "text",
            DisplayEvent::Placeholder { .. } => "placeholder",
            DisplayEvent::Action { .. } => "action",
            DisplayEvent::Replace { .. } => "replace",
            DisplayEvent::Error { .. } => "error",
            DisplayEvent::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DisplayEvent::Error { .. } | DisplayEvent::Done)
    }
}

pub type DisplayStream = Pin<Box<dyn Stream<Item = DisplayEvent> + Send>>;

pub fn dispatch(mut tokens: TokenStream) -> DisplayStream {
    Box::pin(async_stream::stream! {
        let mut detector = ActionDetector::new();
        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => match detector.push(&token) {
                    DetectorStep::Forward(text) => yield DisplayEvent::Text { delta: text },
                    DetectorStep::Placeholder => yield DisplayEvent::Placeholder {
                        text: PLACEHOLDER_TEXT.to_string(),
                    },
                    DetectorStep::Hold => {}
                },
                Err(e) => {
                    let structured = detector.is_structured();
                    let held = detector.text().to_string();
                    let verdict = detector.finish();
                    if structured {
                        yield DisplayEvent::Replace { text: held };
                    } else if let Verdict::Fallback(text) = verdict {
                        yield DisplayEvent::Replace { text };
                    }
                    yield DisplayEvent::Error {
                        code: e.code().to_string(),
                        message: e.message(),
                    };
                    return;
                }
            }
        }

        match detector.finish() {
            Verdict::Passthrough => {}
            Verdict::Action(payload) => {
                tracing::info!(action = payload.name(), "structured action dispatched");
                yield DisplayEvent::Action { payload };
            }
            Verdict::Fallback(text) => {
                tracing::debug!("structured-looking reply was not a valid action, showing text");
                yield DisplayEvent::Replace { text };
            }
        }
        yield DisplayEvent::Done;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use iiot_assistant_core::models::ChartType;

    fn tokens(items: Vec<Result<&str, ChatError>>) -> TokenStream {
        let owned: Vec<Result<String, ChatError>> =
            items.into_iter().map(|r| r.map(String::from)).collect();
        Box::pin(futures_util::stream::iter(owned))
    }

    async fn run(items: Vec<Result<&str, ChatError>>) -> Vec<DisplayEvent> {
        dispatch(tokens(items)).collect().await
    }

    #[tokio::test]
    async fn prose_forwarded_incrementally() {
        let events = run(vec![Ok("Motor-01 "), Ok("is "), Ok("running.")]).await;
        assert_eq!(
            events,
            vec![
                DisplayEvent::Text { delta: "Motor-01 ".into() },
                DisplayEvent::Text { delta: "is ".into() },
                DisplayEvent::Text { delta: "running.".into() },
                DisplayEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn split_action_yields_one_payload() {
        let events = run(vec![
            Ok("{\"action\""),
            Ok(":\"render_chart\",\"title\":\"Output\",\"chartType\":\"Line\","),
            Ok("\"xAxis\":[\"Mon\",\"Tue\"],\"series\":[820,910]}"),
        ])
        .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name(), "placeholder");
        assert_eq!(
            events[1],
            DisplayEvent::Action {
                payload: ActionPayload::RenderChart {
                    title: "Output".into(),
                    chart_type: ChartType::Line,
                    x_axis: vec!["Mon".into(), "Tue".into()],
                    series: vec![820.0, 910.0],
                }
            }
        );
        assert_eq!(events[2], DisplayEvent::Done);
    }

    #[tokio::test]
    async fn action_after_prose_follows_streamed_text() {
        let events = run(vec![
            Ok("Found it: "),
            Ok("{\"action\":\"send_file\",\"fileName\":\"pump.pdf\","),
            Ok("\"url\":\"http://h/files/pump.pdf\"}"),
        ])
        .await;
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], DisplayEvent::Text { delta: "Found it: ".into() });
        assert!(events[..3].iter().all(|e| e.name() == "text"));
        assert_eq!(
            events[3],
            DisplayEvent::Action {
                payload: ActionPayload::SendFile {
                    file_name: "pump.pdf".into(),
                    url: "http://h/files/pump.pdf".into(),
                }
            }
        );
        assert_eq!(events[4], DisplayEvent::Done);
    }

    #[tokio::test]
    async fn invalid_json_replaced_verbatim() {
        let events = run(vec![Ok("{ this is "), Ok("not json")]).await;
        assert_eq!(
            events,
            vec![
                DisplayEvent::Placeholder { text: PLACEHOLDER_TEXT.into() },
                DisplayEvent::Replace { text: "{ this is not json".into() },
                DisplayEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn error_while_structured_flushes_then_errors() {
        let events = run(vec![
            Ok("{\"action\":\"send_"),
            Err(ChatError::Stream("connection reset".into())),
        ])
        .await;
        assert_eq!(events[1], DisplayEvent::Replace { text: "{\"action\":\"send_".into() });
        assert_eq!(
            events[2],
            DisplayEvent::Error {
                code: "STREAM_FAILED".into(),
                message: "connection reset".into()
            }
        );
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn error_after_prose_keeps_partial_output() {
        let events = run(vec![Ok("Partial "), Err(ChatError::Cancelled)]).await;
        assert_eq!(
            events,
            vec![
                DisplayEvent::Text { delta: "Partial ".into() },
                DisplayEvent::Error {
                    code: "CANCELLED".into(),
                    message: "request cancelled".into()
                },
            ]
        );
    }

    #[test]
    fn serialized_shape() {
        let json = serde_json::to_value(DisplayEvent::Action {
            payload: ActionPayload::SendFile {
                file_name: "a.pdf".into(),
                url: "http://h/files/a.pdf".into(),
            },
        })
        .unwrap();
        assert_eq!(json["type"], "action");
        assert_eq!(json["payload"]["action"], "send_file");
        assert_eq!(json["payload"]["fileName"], "a.pdf");
        assert_eq!(serde_json::to_value(DisplayEvent::Done).unwrap()["type"], "done");
    }
}
