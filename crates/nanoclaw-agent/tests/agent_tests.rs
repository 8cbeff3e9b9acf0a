//! Tests for nanoclaw-agent: SessionStore, persistence, ContextBuilder, AgentRuntime, MessageBus

use nanoclaw_agent::*;
use nanoclaw_core::{
    ChannelIdentity, Error, InboundMessage, NewSession, Outbound, Result, SessionKey,
    TerminationReason, ToolStatus, Turn, TurnContent, TurnRole,
};
use nanoclaw_llm::{ContentBlock, LlmContent, LlmProvider, LlmTool, ScriptStep, ScriptedProvider};
use nanoclaw_tools::{create_default_registry, Tool, ToolContext, ToolResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn identity() -> ChannelIdentity {
    ChannelIdentity::new("cli", "local")
}

fn active_count(sessions: &[nanoclaw_core::SessionSummary]) -> usize {
    sessions.iter().filter(|s| s.active).count()
}

// ===========================================================================
// SessionStore
// ===========================================================================

#[tokio::test]
async fn at_most_one_override_through_any_sequence() {
    let store = SessionStore::in_memory();
    let id = identity();

    store.create(&id, NewSession::titled("a").with_key("a")).await.unwrap();
    store.create(&id, NewSession::titled("b").with_key("b")).await.unwrap();
    store.create(&id, NewSession::titled("c").with_key("c")).await.unwrap();
    assert_eq!(active_count(&store.list(&id).await), 0);

    for step in ["a", "b", "reset", "c", "c", "a", "reset", "reset", "b"] {
        if step == "reset" {
            store.reset(&id).await.unwrap();
        } else {
            store.switch(&id, step).await.unwrap();
        }
        let count = active_count(&store.list(&id).await);
        let expected = if step == "reset" { 0 } else { 1 };
        assert_eq!(count, expected, "after {}", step);
    }

    let active: Vec<_> = store.list(&id).await.into_iter().filter(|s| s.active).collect();
    assert_eq!(active[0].key.as_str(), "cli:local:b");
}

#[tokio::test]
async fn reset_returns_to_default_and_is_idempotent() {
    let store = SessionStore::in_memory();
    let id = identity();

    store.create(&id, NewSession::titled("x").with_key("x")).await.unwrap();
    store.switch(&id, "x").await.unwrap();
    store.reset(&id).await.unwrap();
    store.reset(&id).await.unwrap();

    let active = store.resolve_active(&id).await.unwrap();
    assert_eq!(active.key, id.default_session_key());
    assert!(!active.is_active_override);
    assert!(store.current(&id).await.is_none());
}

#[tokio::test]
async fn create_switch_resolve_reset() {
    let store = SessionStore::in_memory();
    let id = identity();

    let s2 = store
        .create(&id, NewSession::titled("research").with_key("s2"))
        .await
        .unwrap();
    assert_eq!(s2.key.as_str(), "cli:local:s2");
    assert_eq!(s2.title, "research");
    assert!(!s2.active);

    // create does not activate
    assert_eq!(
        store.resolve_active_key(&id).await.unwrap(),
        id.default_session_key()
    );

    store.switch(&id, "s2").await.unwrap();
    let active = store.resolve_active(&id).await.unwrap();
    assert_eq!(active.key, s2.key);
    assert!(active.is_active_override);

    store.reset(&id).await.unwrap();
    assert_eq!(
        store.resolve_active_key(&id).await.unwrap(),
        id.default_session_key()
    );
}

#[tokio::test]
async fn default_session_is_created_lazily() {
    let store = SessionStore::in_memory();
    assert!(store.is_empty());
    let key = store.resolve_active_key(&identity()).await.unwrap();
    assert_eq!(key.as_str(), "cli:local");
    assert_eq!(store.len(), 1);
    store.resolve_active_key(&identity()).await.unwrap();
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn switch_rejects_unknown_and_foreign_keys() {
    let store = SessionStore::in_memory();
    let me = identity();
    let other = ChannelIdentity::new("ws", "someone");
    store
        .create(&other, NewSession::default().with_key("theirs"))
        .await
        .unwrap();

    assert!(matches!(
        store.switch(&me, "nope").await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        store.switch(&me, "ws:someone:theirs").await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(store.current(&me).await.is_none());
}

#[tokio::test]
async fn full_and_bare_keys_resolve_to_the_same_session() {
    let store = SessionStore::in_memory();
    let id = identity();
    store
        .create(&id, NewSession::default().with_key("My Notes"))
        .await
        .unwrap();

    let a = store.switch(&id, "my notes").await.unwrap();
    let b = store.switch(&id, "cli:local:my-notes").await.unwrap();
    assert_eq!(a.key, b.key);
}

#[tokio::test]
async fn duplicate_create_is_rejected_unless_allowed() {
    let store = SessionStore::in_memory();
    let id = identity();
    store.create(&id, NewSession::default().with_key("dup")).await.unwrap();

    let err = store
        .create(&id, NewSession::default().with_key("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateName(ref k) if k == "cli:local:dup"));

    let reused = store
        .create(
            &id,
            NewSession {
                key: Some("dup".into()),
                allow_existing: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(reused.key.as_str(), "cli:local:dup");
    assert_eq!(store.list(&id).await.len(), 1);
}

#[tokio::test]
async fn generated_keys_are_unique() {
    let store = SessionStore::in_memory();
    let id = identity();
    let a = store.create(&id, NewSession::default()).await.unwrap();
    let b = store.create(&id, NewSession::default()).await.unwrap();
    assert_ne!(a.key, b.key);
    assert!(a.key.as_str().starts_with("cli:local:"));
    assert!(b.key.as_str().starts_with("cli:local:"));
}

#[tokio::test]
async fn seed_becomes_title() {
    let store = SessionStore::in_memory();
    let s = store
        .create(
            &identity(),
            NewSession {
                seed: Some("Plan the Lisbon trip\nwith details".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(s.title, "Plan the Lisbon trip");
}

#[tokio::test]
async fn list_is_newest_first_and_scoped_to_identity() {
    let store = SessionStore::in_memory();
    let id = identity();
    store.create(&id, NewSession::default().with_key("old")).await.unwrap();
    store.create(&id, NewSession::default().with_key("new")).await.unwrap();
    store
        .create(&ChannelIdentity::new("ws", "x"), NewSession::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    store
        .append(&SessionKey::new("cli:local:old"), Turn::user("bump"))
        .await
        .unwrap();

    let keys: Vec<String> = store
        .list(&id)
        .await
        .into_iter()
        .map(|s| s.key.to_string())
        .collect();
    assert_eq!(keys, vec!["cli:local:old", "cli:local:new"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_all_kept_in_order() {
    let store = Arc::new(SessionStore::in_memory());
    let key = store.resolve_active_key(&identity()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store.append(&key, Turn::user(format!("m{}", i))).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let transcript = store.transcript(&key).await.unwrap();
    assert_eq!(transcript.len(), 50);
    assert!(transcript
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    let mut texts: Vec<&str> = transcript.iter().filter_map(|t| t.as_text()).collect();
    texts.sort();
    texts.dedup();
    assert_eq!(texts.len(), 50);
}

#[tokio::test]
async fn append_to_missing_session_fails() {
    let store = SessionStore::in_memory();
    let err = store
        .append(&SessionKey::new("cli:local:ghost"), Turn::user("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn delete_clears_override() {
    let store = SessionStore::in_memory();
    let id = identity();
    store.create(&id, NewSession::default().with_key("gone")).await.unwrap();
    store.switch(&id, "gone").await.unwrap();

    let key = store.delete(&id, "gone").await.unwrap();
    assert_eq!(key.as_str(), "cli:local:gone");
    assert!(store.current(&id).await.is_none());
    assert!(store.get(&key).await.is_none());
    assert!(matches!(
        store.delete(&id, "gone").await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn clear_empties_transcript_but_keeps_title() {
    let store = SessionStore::in_memory();
    let id = identity();
    let s = store
        .create(&id, NewSession::titled("Keep me").with_key("k"))
        .await
        .unwrap();
    store.append(&s.key, Turn::user("a")).await.unwrap();
    store.clear(&s.key).await.unwrap();

    let session = store.get(&s.key).await.unwrap();
    assert!(session.transcript.is_empty());
    assert_eq!(session.display_title(), "Keep me");
}

// ===========================================================================
// Persistence
// ===========================================================================

#[tokio::test]
async fn sessions_and_override_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = identity();
    {
        let store = SessionStore::open(dir.path()).unwrap();
        let s = store
            .create(&id, NewSession::titled("Research").with_key("research"))
            .await
            .unwrap();
        store.switch(&id, "research").await.unwrap();
        store.append(&s.key, Turn::user("hello")).await.unwrap();
        store.append(&s.key, Turn::assistant("hi")).await.unwrap();
    }

    let store = SessionStore::open(dir.path()).unwrap();
    let active = store.resolve_active(&id).await.unwrap();
    assert_eq!(active.key.as_str(), "cli:local:research");
    assert_eq!(active.title.as_deref(), Some("Research"));
    assert_eq!(active.transcript.len(), 2);
    assert_eq!(active.transcript[1].as_text(), Some("hi"));
}

#[tokio::test]
async fn dangling_override_is_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("_active.json"),
        r#"{"cli:local": "cli:local:missing"}"#,
    )
    .unwrap();

    let store = SessionStore::open(dir.path()).unwrap();
    assert!(store.current(&identity()).await.is_none());
    assert_eq!(
        store.resolve_active_key(&identity()).await.unwrap(),
        identity().default_session_key()
    );
}

#[tokio::test]
async fn concurrent_creates_of_one_key_persist_only_the_winner() {
    let dir = tempfile::tempdir().unwrap();
    let id = identity();
    let store = SessionStore::open(dir.path()).unwrap();

    let (a, b) = tokio::join!(
        store.create(&id, NewSession::titled("Alpha").with_key("shared")),
        store.create(&id, NewSession::titled("Beta").with_key("shared")),
    );
    let (winner, loser) = match (a, b) {
        (Ok(w), Err(e)) | (Err(e), Ok(w)) => (w, e),
        other => panic!("expected one create to win, got {:?}", other),
    };
    assert!(matches!(loser, Error::DuplicateName(_)));

    let reopened = SessionStore::open(dir.path()).unwrap();
    let on_disk = reopened.get(&winner.key).await.unwrap();
    assert_eq!(on_disk.display_title(), winner.title);
}

#[tokio::test]
async fn similar_keys_keep_separate_files() {
    let dir = tempfile::tempdir().unwrap();
    let id = identity();
    {
        let store = SessionStore::open(dir.path()).unwrap();
        for key in ["cli:local:a_b", "cli:local:a:b"] {
            let s = store
                .create(&id, NewSession::default().with_key(key))
                .await
                .unwrap();
            store.append(&s.key, Turn::user(key)).await.unwrap();
        }
    }

    let store = SessionStore::open(dir.path()).unwrap();
    for key in ["cli:local:a_b", "cli:local:a:b"] {
        let turns = store.transcript(&SessionKey::new(key)).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].as_text(), Some(key));
    }
}

#[tokio::test]
async fn delete_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let id = identity();
    let store = SessionStore::open(dir.path()).unwrap();
    let s = store
        .create(&id, NewSession::default().with_key("tmp"))
        .await
        .unwrap();

    let path = JsonlStore::open(dir.path()).unwrap().path_for(&s.key);
    assert!(path.exists());
    store.delete(&id, "tmp").await.unwrap();
    assert!(!path.exists());

    let reopened = SessionStore::open(dir.path()).unwrap();
    assert!(reopened.get(&s.key).await.is_none());
}

// ===========================================================================
// ContextBuilder
// ===========================================================================

fn tool_def(name: &str) -> LlmTool {
    LlmTool {
        name: name.into(),
        description: format!("{} things", name),
        input_schema: json!({"type": "object"}),
    }
}

#[test]
fn context_order_is_system_tools_transcript() {
    let id = identity();
    let mut session = Session::new(id.default_session_key(), id, None);
    session.transcript = vec![
        Turn::user("hi"),
        Turn::assistant("hello"),
        Turn::user("again"),
    ];

    let msgs = ContextBuilder::new(100_000).build(
        &session,
        Some("You are helpful."),
        &[tool_def("echo"), tool_def("message")],
    );

    assert_eq!(msgs.len(), 5);
    assert_eq!(msgs[0].role, "system");
    assert_eq!(msgs[0].text(), "You are helpful.");
    assert_eq!(msgs[1].role, "system");
    assert!(msgs[1].text().contains("- echo: echo things"));
    assert!(msgs[1].text().contains("- message: message things"));
    assert_eq!(msgs[2].text(), "hi");
    assert_eq!(msgs[3].role, "assistant");
    assert_eq!(msgs[4].text(), "again");
}

#[test]
fn context_without_prompt_or_tools_is_just_the_transcript() {
    let msgs = ContextBuilder::new(100_000).build_from_turns(&[Turn::user("x")], None, &[]);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].role, "user");
}

#[test]
fn truncation_drops_oldest_and_keeps_latest_user() {
    let turns = vec![
        Turn::user("a".repeat(2000)),
        Turn::assistant("b".repeat(2000)),
        Turn::user("c".repeat(2000)),
        Turn::assistant("d".repeat(2000)),
        Turn::user("latest question"),
    ];
    let builder = ContextBuilder::new(50);
    let msgs = builder.build_from_turns(&turns, Some("sys"), &[]);

    assert_eq!(msgs[0].role, "system");
    let last = msgs.last().unwrap();
    assert_eq!(last.role, "user");
    assert_eq!(last.text(), "latest question");
    assert_eq!(msgs.len(), 2);

    // Same input, same output.
    assert_eq!(msgs, builder.build_from_turns(&turns, Some("sys"), &[]));
}

#[test]
fn tool_records_render_as_assistant_tool_use() {
    let turns = vec![
        Turn::user("go"),
        Turn::tool_call("c1", "echo", json!({"text": "x"})),
        Turn::tool_result("c1", "echo", "echo: x", ToolStatus::Ok),
        Turn::assistant("done"),
    ];
    let msgs = ContextBuilder::new(100_000).build_from_turns(&turns, None, &[]);
    assert_eq!(msgs.len(), 4);
    assert_eq!(msgs[1].role, "assistant");
    assert!(matches!(
        &msgs[1].content,
        LlmContent::Blocks(b) if matches!(&b[0], ContentBlock::ToolUse { id, .. } if id == "c1")
    ));
    assert_eq!(msgs[2].role, "user");
    assert!(matches!(
        &msgs[2].content,
        LlmContent::Blocks(b) if matches!(&b[0], ContentBlock::ToolResult { is_error: None, .. })
    ));
}

// ===========================================================================
// AgentRuntime
// ===========================================================================

struct EchoTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo text back"
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ToolResult::text(format!("echo: {}", args["text"].as_str().unwrap_or_default()))
    }
}

struct SleepyTool;

#[async_trait::async_trait]
impl Tool for SleepyTool {
    fn name(&self) -> &str {
        "sleepy"
    }
    fn description(&self) -> &str {
        "Takes forever"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
        tokio::time::sleep(Duration::from_secs(60)).await;
        ToolResult::text("woke up")
    }
}

struct BigTool;

#[async_trait::async_trait]
impl Tool for BigTool {
    fn name(&self) -> &str {
        "big"
    }
    fn description(&self) -> &str {
        "Returns a lot"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::text("x".repeat(100))
    }
}

struct Harness {
    runtime: Arc<AgentRuntime>,
    provider: Arc<ScriptedProvider>,
    store: Arc<SessionStore>,
    echo_calls: Arc<AtomicUsize>,
}

fn harness_with(provider: ScriptedProvider, config: AgentConfig) -> Harness {
    let store = Arc::new(SessionStore::in_memory());
    let provider = Arc::new(provider);
    let echo_calls = Arc::new(AtomicUsize::new(0));

    let mut registry = create_default_registry(
        store.clone(),
        std::env::temp_dir().join("nanoclaw-agent-tests-media"),
    )
    .unwrap();
    registry
        .register(EchoTool {
            calls: echo_calls.clone(),
        })
        .unwrap();
    registry.register(SleepyTool).unwrap();
    registry.register(BigTool).unwrap();

    let runtime = Arc::new(AgentRuntime::new(
        provider.clone() as Arc<dyn LlmProvider>,
        registry,
        store.clone(),
        config,
    ));
    Harness {
        runtime,
        provider,
        store,
        echo_calls,
    }
}

fn harness(steps: Vec<ScriptStep>) -> Harness {
    harness_with(ScriptedProvider::new(steps), AgentConfig::default())
}

async fn run(h: &Harness, text: &str) -> (TurnOutcome, Vec<AgentEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let outcome = h
        .runtime
        .run_turn(&identity(), text, tx, CancellationToken::new())
        .await
        .unwrap();
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    (outcome, events)
}

async fn transcript(h: &Harness) -> Vec<Turn> {
    let key = h.store.resolve_active_key(&identity()).await.unwrap();
    h.store.transcript(&key).await.unwrap()
}

fn roles(turns: &[Turn]) -> Vec<TurnRole> {
    turns.iter().map(|t| t.role).collect()
}

fn result_status(turn: &Turn) -> Option<ToolStatus> {
    match &turn.content {
        TurnContent::ToolResult { status, .. } => Some(*status),
        _ => None,
    }
}

#[tokio::test]
async fn plain_reply_is_a_final_answer() {
    let h = harness(vec![ScriptStep::text("hello")]);
    let (outcome, events) = run(&h, "hi").await;

    assert_eq!(outcome.reason, TerminationReason::FinalAnswer);
    assert_eq!(outcome.reply.as_deref(), Some("hello"));
    assert_eq!(outcome.iterations, 0);

    let turns = transcript(&h).await;
    assert_eq!(roles(&turns), vec![TurnRole::User, TurnRole::Assistant]);
    assert_eq!(turns[0].as_text(), Some("hi"));
    assert_eq!(turns[1].as_text(), Some("hello"));

    assert_eq!(
        events,
        vec![
            AgentEvent::Reply("hello".into()),
            AgentEvent::Done {
                reason: TerminationReason::FinalAnswer
            }
        ]
    );
}

#[tokio::test]
async fn three_tool_calls_are_announced_run_and_recorded_in_order() {
    let h = harness(vec![
        ScriptStep::tool_calls(vec![
            ("echo", json!({"text": "one"})),
            ("echo", json!({"text": "two"})),
            ("echo", json!({"text": "three"})),
        ]),
        ScriptStep::text("all done"),
    ]);
    let (outcome, events) = run(&h, "do three things").await;

    assert_eq!(outcome.reason, TerminationReason::FinalAnswer);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 3);

    // Notification, then result, for each call in order.
    let tool_events: Vec<(String, &str)> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolCall(n) => Some((n.call_id.clone(), "call")),
            AgentEvent::ToolResult { call_id, .. } => Some((call_id.clone(), "result")),
            _ => None,
        })
        .collect();
    assert_eq!(
        tool_events,
        vec![
            ("call_1_0".to_string(), "call"),
            ("call_1_0".to_string(), "result"),
            ("call_1_1".to_string(), "call"),
            ("call_1_1".to_string(), "result"),
            ("call_1_2".to_string(), "call"),
            ("call_1_2".to_string(), "result"),
        ]
    );
    match &events[0] {
        AgentEvent::ToolCall(n) => {
            assert_eq!(n.name, "echo");
            assert_eq!(n.summary, "[tool:echo] text=one");
            assert_eq!(n.identity, identity());
        }
        other => panic!("expected a tool call first, got {:?}", other),
    }

    let turns = transcript(&h).await;
    assert_eq!(
        roles(&turns),
        vec![
            TurnRole::User,
            TurnRole::ToolCall,
            TurnRole::ToolResult,
            TurnRole::ToolCall,
            TurnRole::ToolResult,
            TurnRole::ToolCall,
            TurnRole::ToolResult,
            TurnRole::Assistant,
        ]
    );
    assert_eq!(turns[6].render(), "echo: three");

    // The second model call saw all three results.
    let requests = h.provider.requests().await;
    assert_eq!(requests.len(), 2);
    let results_seen = requests[1]
        .messages
        .iter()
        .filter_map(|m| match &m.content {
            LlmContent::Blocks(b) => Some(
                b.iter()
                    .filter(|x| matches!(x, ContentBlock::ToolResult { .. }))
                    .count(),
            ),
            _ => None,
        })
        .sum::<usize>();
    assert_eq!(results_seen, 3);
}

#[tokio::test]
async fn iteration_limit_of_one_runs_exactly_one_tool() {
    let provider = ScriptedProvider::new(vec![
        ScriptStep::tool_call("echo", json!({"text": "a"})),
        ScriptStep::tool_call("echo", json!({"text": "b"})),
        ScriptStep::tool_call("echo", json!({"text": "c"})),
    ]);
    let h = harness_with(
        provider,
        AgentConfig {
            max_iterations: 1,
            ..Default::default()
        },
    );
    let (outcome, _) = run(&h, "loop forever").await;

    assert_eq!(outcome.reason, TerminationReason::IterationLimit);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.call_count().await, 1);

    let turns = transcript(&h).await;
    let last = turns.last().unwrap();
    assert_eq!(last.role, TurnRole::Assistant);
    assert!(last.render().contains("limit of 1 tool iterations"));
    assert_eq!(outcome.reply.as_deref(), last.as_text());
}

#[tokio::test]
async fn interim_text_is_kept_in_the_limit_notice() {
    let provider = ScriptedProvider::new(vec![ScriptStep::ToolCalls {
        text: "Working on it".into(),
        calls: vec![("echo".into(), json!({"text": "a"}))],
    }]);
    let h = harness_with(
        provider,
        AgentConfig {
            max_iterations: 1,
            ..Default::default()
        },
    );
    let (outcome, _) = run(&h, "go").await;
    let reply = outcome.reply.unwrap();
    assert!(reply.starts_with("Working on it"));
    assert!(reply.contains("[stopped: limit of 1 tool iterations reached]"));
}

#[tokio::test]
async fn unknown_tool_and_bad_args_fail_the_call_not_the_turn() {
    let h = harness(vec![
        ScriptStep::tool_calls(vec![
            ("nonexistent", json!({})),
            ("echo", json!({"text": 5})),
        ]),
        ScriptStep::text("recovered"),
    ]);
    let (outcome, _) = run(&h, "try").await;

    assert_eq!(outcome.reason, TerminationReason::FinalAnswer);
    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 0);

    let turns = transcript(&h).await;
    assert_eq!(result_status(&turns[2]), Some(ToolStatus::Failed));
    assert!(turns[2].render().contains("unknown tool: nonexistent"));
    assert_eq!(result_status(&turns[4]), Some(ToolStatus::Failed));
    assert!(turns[4].render().contains("text"));
    assert_eq!(turns.last().unwrap().as_text(), Some("recovered"));
}

#[tokio::test]
async fn long_tool_output_is_truncated() {
    let h = harness_with(
        ScriptedProvider::new(vec![
            ScriptStep::tool_call("big", json!({})),
            ScriptStep::text("ok"),
        ]),
        AgentConfig {
            max_tool_result_chars: 10,
            ..Default::default()
        },
    );
    run(&h, "go").await;
    let turns = transcript(&h).await;
    assert_eq!(
        turns[2].render(),
        format!("{}...[truncated, 100 total chars]", "x".repeat(10))
    );
}

#[tokio::test]
async fn provider_failure_is_fatal_but_keeps_the_transcript() {
    let h = harness(vec![
        ScriptStep::tool_call("echo", json!({"text": "a"})),
        ScriptStep::Fail("upstream 500".into()),
    ]);
    let (outcome, events) = run(&h, "hi").await;

    assert_eq!(outcome.reason, TerminationReason::FatalError);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("upstream 500"));
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Error(_))));

    let turns = transcript(&h).await;
    assert_eq!(
        roles(&turns),
        vec![TurnRole::User, TurnRole::ToolCall, TurnRole::ToolResult]
    );
}

#[tokio::test]
async fn timeout_cancels_the_running_tool() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::tool_call("sleepy", json!({}))]),
        AgentConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
    );
    let started = std::time::Instant::now();
    let (outcome, _) = run(&h, "wait").await;

    assert_eq!(outcome.reason, TerminationReason::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));

    let turns = transcript(&h).await;
    assert_eq!(result_status(&turns[2]), Some(ToolStatus::Cancelled));
    assert_eq!(
        turns.last().unwrap().as_text(),
        Some("[turn interrupted: timeout]")
    );
}

#[tokio::test]
async fn timeout_abandons_a_stalled_model_call() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::Stall]),
        AgentConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let (outcome, _) = run(&h, "hello?").await;
    assert_eq!(outcome.reason, TerminationReason::Timeout);
    assert_eq!(
        roles(&transcript(&h).await),
        vec![TurnRole::User, TurnRole::Assistant]
    );
}

#[tokio::test]
async fn cancellation_is_recorded() {
    let h = harness(vec![ScriptStep::tool_call("sleepy", json!({}))]);
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(256);

    let runtime = h.runtime.clone();
    let token = cancel.clone();
    let task =
        tokio::spawn(async move { runtime.run_turn(&identity(), "go", tx, token).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.reason, TerminationReason::Cancelled);

    let turns = transcript(&h).await;
    assert_eq!(result_status(&turns[2]), Some(ToolStatus::Cancelled));
    assert_eq!(
        turns.last().unwrap().as_text(),
        Some("[turn interrupted: cancelled]")
    );
}

#[tokio::test]
async fn turns_on_one_session_never_interleave() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::text("first"), ScriptStep::text("second")])
            .with_latency(Duration::from_millis(50)),
        AgentConfig::default(),
    );

    let (a, b) = tokio::join!(run(&h, "one"), run(&h, "two"));
    assert_eq!(a.0.reason, TerminationReason::FinalAnswer);
    assert_eq!(b.0.reason, TerminationReason::FinalAnswer);

    let turns = transcript(&h).await;
    assert_eq!(
        roles(&turns),
        vec![
            TurnRole::User,
            TurnRole::Assistant,
            TurnRole::User,
            TurnRole::Assistant
        ]
    );
}

#[tokio::test]
async fn queued_turn_gets_its_own_timeout() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::Stall, ScriptStep::text("second reply")]),
        AgentConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );

    let (a, b) = tokio::join!(run(&h, "first"), run(&h, "second"));
    assert_eq!(a.0.reason, TerminationReason::Timeout);
    assert_eq!(b.0.reason, TerminationReason::FinalAnswer);
    assert_eq!(b.0.reply.as_deref(), Some("second reply"));

    let texts: Vec<_> = transcript(&h)
        .await
        .iter()
        .map(|t| t.as_text().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        texts,
        vec!["first", "[turn interrupted: timeout]", "second", "second reply"]
    );
}

#[tokio::test]
async fn turn_cancelled_while_queued_is_still_recorded() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::tool_call("sleepy", json!({}))]),
        AgentConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
    );
    let queued_cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(256);

    let first = run(&h, "first");
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.runtime
            .run_turn(&identity(), "second", tx.clone(), queued_cancel.clone())
            .await
            .unwrap()
    };
    let cancel_soon = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queued_cancel.cancel();
    };
    let (a, b, _) = tokio::join!(first, second, cancel_soon);

    assert_eq!(a.0.reason, TerminationReason::Timeout);
    assert_eq!(b.reason, TerminationReason::Cancelled);
    assert_eq!(h.provider.call_count().await, 1);

    let turns = transcript(&h).await;
    let n = turns.len();
    assert_eq!(turns[n - 2].as_text(), Some("second"));
    assert_eq!(
        turns[n - 1].as_text(),
        Some("[turn interrupted: cancelled]")
    );
}

#[tokio::test]
async fn message_queued_behind_a_switch_goes_to_the_new_session() {
    let h = harness_with(
        ScriptedProvider::new(vec![
            ScriptStep::tool_call(
                "session_manage",
                json!({"action": "create", "session_key": "research"}),
            ),
            ScriptStep::text("switched"),
            ScriptStep::text("in research now"),
        ])
        .with_latency(Duration::from_millis(100)),
        AgentConfig::default(),
    );

    let late = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        run(&h, "what now?").await
    };
    let (a, b) = tokio::join!(run(&h, "start a research session"), late);

    assert_eq!(a.0.session, identity().default_session_key());
    assert_eq!(b.0.session.as_str(), "cli:local:research");
    assert_eq!(b.0.reply.as_deref(), Some("in research now"));
}

#[tokio::test]
async fn message_tool_output_is_forwarded_as_an_event() {
    let h = harness(vec![
        ScriptStep::tool_call("message", json!({"content": "progress update"})),
        ScriptStep::text("done"),
    ]);
    let (_, events) = run(&h, "go").await;

    let sent: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Message(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "progress update");
    assert_eq!(sent[0].identity, identity());
}

#[tokio::test]
async fn session_switch_from_a_tool_applies_to_the_next_message() {
    let h = harness(vec![
        ScriptStep::tool_call(
            "session_manage",
            json!({"action": "create", "session_key": "research", "title": "Research"}),
        ),
        ScriptStep::text("switched"),
        ScriptStep::text("in research now"),
    ]);

    let (outcome, _) = run(&h, "start a research session").await;
    assert_eq!(outcome.session, identity().default_session_key());

    let default_turns = h
        .store
        .transcript(&identity().default_session_key())
        .await
        .unwrap();
    assert!(default_turns[2]
        .render()
        .contains("Created and activated session: cli:local:research (title: Research)"));
    assert_eq!(default_turns.last().unwrap().as_text(), Some("switched"));

    let (outcome, _) = run(&h, "what now?").await;
    assert_eq!(outcome.session.as_str(), "cli:local:research");
    assert_eq!(
        roles(&transcript(&h).await),
        vec![TurnRole::User, TurnRole::Assistant]
    );
}

#[tokio::test]
async fn system_prompt_includes_tool_prompts() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::text("ok")]),
        AgentConfig {
            system_prompt: Some("Base prompt.".into()),
            ..Default::default()
        },
    );
    run(&h, "hi").await;

    let prompt = h.runtime.system_prompt().unwrap();
    assert!(prompt.starts_with("Base prompt."));
    assert!(prompt.contains("session_manage"));

    let request = &h.provider.requests().await[0];
    assert_eq!(request.messages[0].role, "system");
    assert_eq!(request.messages[0].text(), prompt);
    assert_eq!(request.tools.as_ref().map(|t| t.len()), Some(5));
}

// ===========================================================================
// MessageBus
// ===========================================================================

struct RecordingChannel {
    name: String,
    seen: std::sync::Mutex<Vec<Outbound>>,
}

impl RecordingChannel {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            seen: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Outbound> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, outbound: &Outbound) -> Result<()> {
        self.seen.lock().unwrap().push(outbound.clone());
        Ok(())
    }
}

#[tokio::test]
async fn bus_delivers_notifications_then_reply() {
    let h = harness(vec![
        ScriptStep::tool_call("echo", json!({"text": "x"})),
        ScriptStep::text("finished"),
    ]);
    let bus = MessageBus::new(h.runtime.clone());
    let channel = RecordingChannel::new("cli");
    bus.register_channel(channel.clone());

    let dispatched = bus
        .handle(InboundMessage::new(identity(), "go"))
        .await
        .unwrap();
    assert_eq!(dispatched.outcome.reason, TerminationReason::FinalAnswer);
    assert_eq!(dispatched.delivered, 2);
    assert_eq!(dispatched.failed, 0);

    let seen = channel.seen();
    assert!(matches!(&seen[0], Outbound::ToolCall(n) if n.name == "echo"));
    assert!(matches!(&seen[1], Outbound::Message(m) if m.text == "finished"));
    assert!(!bus.is_running(&identity()));
}

#[tokio::test]
async fn bus_counts_undeliverable_output() {
    let h = harness(vec![ScriptStep::text("nobody hears this")]);
    let bus = MessageBus::new(h.runtime.clone());

    let dispatched = bus
        .handle(InboundMessage::new(identity(), "hello"))
        .await
        .unwrap();
    assert_eq!(dispatched.outcome.reason, TerminationReason::FinalAnswer);
    assert_eq!(dispatched.delivered, 0);
    assert_eq!(dispatched.failed, 1);

    let err = bus
        .deliver(&Outbound::Message(nanoclaw_core::OutboundMessage::text(
            identity(),
            "x",
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelNotFound(ref c) if c == "cli"));
}

#[tokio::test]
async fn bus_abort_cancels_the_running_turn() {
    let h = harness(vec![ScriptStep::Stall]);
    let bus = Arc::new(MessageBus::new(h.runtime.clone()));
    bus.register_channel(RecordingChannel::new("cli"));

    let handle = bus.dispatch(InboundMessage::new(identity(), "think hard"));
    for _ in 0..100 {
        if bus.is_running(&identity()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.abort(&identity()), 1);

    let dispatched = handle.await.unwrap().unwrap();
    assert_eq!(dispatched.outcome.reason, TerminationReason::Cancelled);
    assert_eq!(bus.abort(&identity()), 0);
}

#[tokio::test]
async fn bus_run_consumes_the_inbound_queue() {
    let h = harness(vec![ScriptStep::text("pong")]);
    let bus = Arc::new(MessageBus::new(h.runtime.clone()));
    let channel = RecordingChannel::new("cli");
    bus.register_channel(channel.clone());

    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(bus.clone().run(rx));
    tx.send(InboundMessage::new(identity(), "ping")).await.unwrap();

    for _ in 0..200 {
        if !channel.seen().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(&channel.seen()[0], Outbound::Message(m) if m.text == "pong"));

    drop(tx);
    runner.await.unwrap();
}
