mod common;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::{BagOfWordsEmbedder, ScriptedModel, Step};
use futures_util::StreamExt;
use iiot_assistant::config::KnowledgeConfig;
use iiot_assistant::dispatch::{dispatch, DisplayEvent};
use iiot_assistant::error::ChatError;
use iiot_assistant::ingest::{run_ingest, IngestStrategy};
use iiot_assistant::llm::Message;
use iiot_assistant::orchestrator::{Orchestrator, OrchestratorLimits};
use iiot_assistant::push::PushChannel;
use iiot_assistant::session::{Session, SessionHandle};
use iiot_assistant::tools::device::{ControlDeviceTool, DeviceReading, DeviceStatusTool};
use iiot_assistant::tools::{DeviceCache, Tool, ToolContext, ToolRegistry};
use iiot_assistant_core::capability::{CapabilityProfile, CapabilityRegistry};
use iiot_assistant_core::embedding::Embedder;
use iiot_assistant_core::models::{ActionPayload, ChartType, Mode, Role};
use iiot_assistant_core::store::memory::InMemoryIndex;
use iiot_assistant_core::store::KnowledgeStore;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Counts executions; fails when `fail` is set.
struct ProbeTool {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl Tool for ProbeTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "probe"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("sensor bus offline");
        }
        Ok(format!("{} ok", self.name))
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    sql_calls: Arc<AtomicUsize>,
    devices: DeviceCache,
}

async fn harness(model: Arc<ScriptedModel>) -> Harness {
    harness_with(model, None, Arc::new(InMemoryIndex::new())).await
}

async fn harness_with(
    model: Arc<ScriptedModel>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Arc<dyn KnowledgeStore>,
) -> Harness {
    let devices = DeviceCache::new();
    devices
        .record(
            "Motor-01",
            DeviceReading {
                status: "Running".into(),
                temperature: 48.2,
                vibration: 1.25,
                updated_at: Utc::now(),
            },
        )
        .await;

    let sql_calls = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(DeviceStatusTool::new(devices.clone())));
    tools.register(Arc::new(ControlDeviceTool::new(devices.clone())));
    tools.register(Arc::new(ProbeTool {
        name: "execute_sql_query",
        calls: sql_calls.clone(),
        fail: false,
    }));
    tools.register(Arc::new(ProbeTool {
        name: "flaky",
        calls: Arc::new(AtomicUsize::new(0)),
        fail: true,
    }));

    let mut capabilities = CapabilityRegistry::builtin();
    capabilities.set_profile(
        Mode::Iot,
        CapabilityProfile::new(&["device_status", "control_device", "flaky"], "iot"),
    );

    let ctx = ToolContext::new(PushChannel::new(), "http://localhost:5109");
    let orchestrator = Orchestrator::new(
        model,
        Arc::new(tools),
        capabilities,
        store,
        embedder,
        ctx,
    )
    .with_limits(OrchestratorLimits {
        max_tool_rounds: 3,
        tool_timeout: Some(Duration::from_secs(5)),
        ..OrchestratorLimits::default()
    });

    Harness {
        orchestrator: Arc::new(orchestrator),
        sql_calls,
        devices,
    }
}

fn session(id: &str) -> SessionHandle {
    Arc::new(Mutex::new(Session::new(id)))
}

async fn collect(
    h: &Harness,
    session: &SessionHandle,
    message: &str,
    mode: Mode,
) -> Vec<Result<String, ChatError>> {
    h.orchestrator
        .converse(
            session.clone(),
            message.to_string(),
            mode,
            CancellationToken::new(),
        )
        .collect()
        .await
}

fn tool_results(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Tool { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_text_streams_in_order_and_commits_one_turn() {
    let model = ScriptedModel::new(vec![vec![
        Step::Text("Motor-01 "),
        Step::Text("is "),
        Step::Text("running."),
    ]]);
    let h = harness(model.clone()).await;
    let s = session("a");

    let tokens = collect(&h, &s, "How is Motor-01?", Mode::Auto).await;
    let tokens: Vec<String> = tokens.into_iter().map(|t| t.unwrap()).collect();
    assert_eq!(tokens, vec!["Motor-01 ", "is ", "running."]);

    let history = s.lock().await.history.clone();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "How is Motor-01?");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Motor-01 is running.");
}

#[tokio::test]
async fn test_tool_result_fed_back_to_model() {
    let model = ScriptedModel::new(vec![
        vec![Step::Call("call_1", "device_status", r#"{"deviceId":"motor-01"}"#)],
        vec![Step::Text("It is running at 48.2 °C.")],
    ]);
    let h = harness(model.clone()).await;
    let s = session("a");

    let tokens = collect(&h, &s, "Status of motor-01?", Mode::Iot).await;
    assert!(tokens.iter().all(|t| t.is_ok()));
    assert_eq!(model.request_count(), 2);

    let (second, _) = &model.requests()[1];
    let results = tool_results(second);
    assert_eq!(results.len(), 1);
    assert!(results[0].starts_with("Device Motor-01 live data"));
    assert!(second.iter().any(|m| matches!(
        m,
        Message::Assistant { tool_calls, .. } if tool_calls.len() == 1 && tool_calls[0].id == "call_1"
    )));

    // tool rounds stay out of the session history
    let history = s.lock().await.history.clone();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "It is running at 48.2 °C.");
}

#[tokio::test]
async fn test_failing_tool_error_text_reaches_model() {
    let model = ScriptedModel::new(vec![
        vec![Step::Call("call_1", "flaky", "{}")],
        vec![Step::Text("The sensor bus is offline.")],
    ]);
    let h = harness(model.clone()).await;
    let s = session("a");

    let tokens = collect(&h, &s, "Read the sensors", Mode::Iot).await;
    assert!(tokens.iter().all(|t| t.is_ok()));

    let (second, _) = &model.requests()[1];
    assert_eq!(
        tool_results(second),
        vec!["Error: tool 'flaky' failed: sensor bus offline".to_string()]
    );
}

#[tokio::test]
async fn test_modes_receive_disjoint_tools_and_out_of_mode_call_refused() {
    let model = ScriptedModel::new(vec![
        vec![Step::Call("call_1", "execute_sql_query", r#"{"sqlQuery":"SELECT 1"}"#)],
        vec![Step::Text("I cannot query the database in this mode.")],
        vec![Step::Text("ok")],
    ]);
    let h = harness(model.clone()).await;

    collect(&h, &session("iot"), "Show production data", Mode::Iot).await;
    collect(&h, &session("db"), "Show production data", Mode::Db).await;

    let iot_tools = model.offered_tools(0);
    let db_tools = model.offered_tools(2);
    assert_eq!(iot_tools, vec!["device_status", "control_device", "flaky"]);
    assert_eq!(db_tools, vec!["execute_sql_query"]);
    assert!(iot_tools.iter().all(|t| !db_tools.contains(t)));

    assert_eq!(h.sql_calls.load(Ordering::SeqCst), 0);
    let (second, _) = &model.requests()[1];
    assert!(tool_results(second)[0].starts_with("Error: unknown tool 'execute_sql_query'"));
}

#[tokio::test]
async fn test_tool_round_limit_is_terminal() {
    let model = ScriptedModel::looping_tool_calls(10);
    let h = harness(model.clone()).await;
    let s = session("a");

    let tokens = collect(&h, &s, "Loop", Mode::Iot).await;
    assert_eq!(tokens.len(), 1);
    assert!(matches!(tokens[0], Err(ChatError::ToolRoundsExceeded(3))));
    assert_eq!(model.request_count(), 4);
    assert!(s.lock().await.history.is_empty());
}

#[tokio::test]
async fn test_model_error_after_tokens_rolls_back_history() {
    let model = ScriptedModel::new(vec![vec![
        Step::Text("Partial "),
        Step::Fail(ChatError::Stream("connection reset".into())),
    ]]);
    let h = harness(model).await;
    let s = session("a");

    let tokens = collect(&h, &s, "Explain", Mode::Db).await;
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].as_deref().unwrap(), "Partial ");
    assert!(matches!(tokens[1], Err(ChatError::Stream(_))));
    assert!(s.lock().await.history.is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_one_consumer_only() {
    let model = ScriptedModel::new(vec![
        vec![Step::Text("hello"), Step::Hang],
        vec![Step::Text("other session answer")],
    ]);
    let h = harness(model).await;
    let cancelled = session("cancelled");
    let other = session("other");

    let cancel = CancellationToken::new();
    let mut stream = h.orchestrator.converse(
        cancelled.clone(),
        "Tell me everything".into(),
        Mode::Db,
        cancel.clone(),
    );
    assert_eq!(stream.next().await.unwrap().unwrap(), "hello");

    // a second session proceeds while the first is stalled
    let answer = collect(&h, &other, "Quick question", Mode::Db).await;
    assert_eq!(answer.len(), 1);
    assert_eq!(answer[0].as_deref().unwrap(), "other session answer");

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("cancellation was not observed");
    assert!(matches!(next, Some(Err(ChatError::Cancelled))));
    assert!(stream.next().await.is_none());

    assert!(cancelled.lock().await.history.is_empty());
    assert_eq!(other.lock().await.history.len(), 2);
}

#[tokio::test]
async fn test_cancel_while_queued_behind_busy_session() {
    let model = ScriptedModel::new(vec![vec![Step::Text("first"), Step::Hang]]);
    let h = harness(model.clone()).await;
    let shared = session("shared");

    let mut first = h.orchestrator.converse(
        shared.clone(),
        "Long report".into(),
        Mode::Db,
        CancellationToken::new(),
    );
    assert_eq!(first.next().await.unwrap().unwrap(), "first");

    let cancel = CancellationToken::new();
    let mut second = h.orchestrator.converse(
        shared.clone(),
        "Another question".into(),
        Mode::Db,
        cancel.clone(),
    );
    // queued on the session lock
    assert!(
        tokio::time::timeout(Duration::from_millis(100), second.next())
            .await
            .is_err()
    );

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("queued request ignored its cancellation");
    assert!(matches!(next, Some(Err(ChatError::Cancelled))));
    assert!(second.next().await.is_none());
    assert_eq!(model.request_count(), 1);

    drop(first);
    assert!(shared.lock().await.history.is_empty());
}

#[tokio::test]
async fn test_dropping_stream_releases_session_and_rolls_back() {
    let model = ScriptedModel::new(vec![vec![Step::Text("hello"), Step::Hang]]);
    let h = harness(model).await;
    let s = session("a");

    let mut stream = h.orchestrator.converse(
        s.clone(),
        "Tell me everything".into(),
        Mode::Db,
        CancellationToken::new(),
    );
    assert_eq!(stream.next().await.unwrap().unwrap(), "hello");
    drop(stream);

    let guard = tokio::time::timeout(Duration::from_secs(1), s.lock())
        .await
        .expect("session lock not released");
    assert!(guard.history.is_empty());
}

#[tokio::test]
async fn test_history_carried_into_next_turn() {
    let model = ScriptedModel::new(vec![
        vec![Step::Text("Motor-01 is running.")],
        vec![Step::Text("Yes, still running.")],
    ]);
    let h = harness(model.clone()).await;
    let s = session("a");

    collect(&h, &s, "How is Motor-01?", Mode::Db).await;
    collect(&h, &s, "And now?", Mode::Db).await;

    let (second, _) = &model.requests()[1];
    assert!(matches!(&second[0], Message::System(_)));
    assert_eq!(second[1], Message::User("How is Motor-01?".into()));
    assert_eq!(
        second[2],
        Message::Assistant {
            content: "Motor-01 is running.".into(),
            tool_calls: vec![]
        }
    );
    assert_eq!(second[3], Message::User("And now?".into()));
    assert_eq!(s.lock().await.history.len(), 4);
}

#[tokio::test]
async fn test_history_capped_to_recent_exchanges() {
    let model = ScriptedModel::new(vec![
        vec![Step::Text("one")],
        vec![Step::Text("two")],
        vec![Step::Text("three")],
    ]);
    let orchestrator = Arc::new(
        Orchestrator::new(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            CapabilityRegistry::builtin(),
            Arc::new(InMemoryIndex::new()),
            None,
            ToolContext::new(PushChannel::new(), "http://localhost:5109"),
        )
        .with_limits(OrchestratorLimits {
            max_history_turns: 2,
            ..OrchestratorLimits::default()
        }),
    );
    let s = session("long-lived");

    for question in ["q1", "q2", "q3"] {
        let tokens: Vec<_> = orchestrator
            .converse(s.clone(), question.into(), Mode::Db, CancellationToken::new())
            .collect()
            .await;
        assert!(tokens.iter().all(|t| t.is_ok()));
    }

    let history = s.lock().await.history.clone();
    let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["q2", "two", "q3", "three"]);

    // the third call saw both earlier exchanges, still within the cap
    let (third, _) = &model.requests()[2];
    assert!(third.iter().any(|m| matches!(m, Message::User(c) if c == "q1")));
}

#[tokio::test]
async fn test_control_command_queued_through_tool_call() {
    let model = ScriptedModel::new(vec![
        vec![Step::Call(
            "call_1",
            "control_device",
            r#"{"deviceId":"Motor-01","command":"Stop"}"#,
        )],
        vec![Step::Text("Stop command sent.")],
    ]);
    let h = harness(model).await;

    collect(&h, &session("a"), "Stop Motor-01", Mode::Iot).await;
    assert_eq!(
        h.devices.pending_command("Motor-01").await.as_deref(),
        Some("Stop")
    );
}

#[tokio::test]
async fn test_retrieval_augments_docs_but_not_db_mode() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("pump-manual.md"),
        "Pump maintenance: replace the pump seal every 2000 hours.",
    )
    .unwrap();
    fs::write(
        dir.path().join("motor-guide.txt"),
        "Motor bearings need grease every month.",
    )
    .unwrap();

    let embedder: Arc<dyn Embedder> =
        Arc::new(BagOfWordsEmbedder::new(vec!["pump", "seal", "motor", "bearing"]));
    let store: Arc<dyn KnowledgeStore> = Arc::new(InMemoryIndex::new());
    let knowledge = KnowledgeConfig {
        root: dir.path().to_path_buf(),
        ..KnowledgeConfig::default()
    };
    let report = run_ingest(
        &knowledge,
        embedder.as_ref(),
        8,
        store.as_ref(),
        IngestStrategy::Append,
    )
    .await
    .unwrap();
    assert_eq!(report.files_ingested, 2);

    let model = ScriptedModel::new(vec![vec![Step::Text("ok")], vec![Step::Text("ok")]]);
    let h = harness_with(model.clone(), Some(embedder), store).await;

    collect(&h, &session("docs"), "When do I change the pump seal?", Mode::Docs).await;
    collect(&h, &session("db"), "When do I change the pump seal?", Mode::Db).await;

    let (docs, _) = &model.requests()[0];
    match docs.last().unwrap() {
        Message::User(content) => {
            assert!(content.contains("[Reference material]"));
            assert!(content.contains("[pump-manual.md] Pump maintenance"));
            assert!(!content.contains("motor-guide.txt"));
            assert!(content.ends_with("[Question]\nWhen do I change the pump seal?"));
        }
        other => panic!("expected user message, got {other:?}"),
    }

    let (db, _) = &model.requests()[1];
    assert_eq!(
        db.last().unwrap(),
        &Message::User("When do I change the pump seal?".into())
    );
}

#[tokio::test]
async fn test_split_action_dispatched_as_one_payload() {
    let model = ScriptedModel::new(vec![vec![
        Step::Text("{\"action\""),
        Step::Text(":\"render_chart\",\"title\":\"Motor-01 output\",\"chartType\":\"Bar\","),
        Step::Text("\"xAxis\":[\"Mon\",\"Tue\"],\"series\":[820,910]}"),
    ]]);
    let h = harness(model).await;

    let tokens = h.orchestrator.converse(
        session("a"),
        "Chart Motor-01 output".into(),
        Mode::Db,
        CancellationToken::new(),
    );
    let events: Vec<DisplayEvent> = dispatch(tokens).collect().await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].name(), "placeholder");
    assert_eq!(
        events[1],
        DisplayEvent::Action {
            payload: ActionPayload::RenderChart {
                title: "Motor-01 output".into(),
                chart_type: ChartType::Bar,
                x_axis: vec!["Mon".into(), "Tue".into()],
                series: vec![820.0, 910.0],
            }
        }
    );
    assert_eq!(events[2], DisplayEvent::Done);
    assert!(events.iter().all(|e| e.name() != "text"));
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_turn_logs_carry_request_span() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let model = ScriptedModel::new(vec![
        vec![Step::Call("call_1", "device_status", r#"{"deviceId":"Motor-01"}"#)],
        vec![Step::Text("Running.")],
    ]);
    let h = harness(model).await;
    let s = session("a");
    let tokens = collect(&h, &s, "Status?", Mode::Iot).await;
    assert!(tokens.iter().all(|t| t.is_ok()));

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let turn_lines: Vec<&str> = output
        .lines()
        .filter(|l| {
            l.contains("conversation turn started")
                || l.contains("invoking tool")
                || l.contains("conversation turn completed")
        })
        .collect();
    assert_eq!(turn_lines.len(), 3, "log output:\n{output}");
    let span_prefix = turn_lines[0]
        .split("}:")
        .next()
        .filter(|p| p.contains("converse{request_id="))
        .expect("turn log line outside the request span");
    let request = &span_prefix[span_prefix.find("request_id=").unwrap()..];
    assert!(turn_lines.iter().all(|l| l.contains(request)));
}
