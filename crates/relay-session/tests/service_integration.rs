use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use relay_provider::{
    AdapterRequest, AdapterSet, Content, ContextMessage, CredentialStore, ModelCost,
    ProviderAdapter, ProviderError, RateLimitInfo, RateLimiter, ResponseSchema, RetryConfig, Role,
    StreamEvent, StreamHandle, UsageRecord, Vendor, WirePayload,
};
use relay_session::{
    ConversationContext, EventSink, LlmService, ServiceConfig, ServiceEvent, ServiceRequest,
};
use relay_tool::{Tool, ToolContext, ToolError, ToolPolicy, ToolResult};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Item = Result<StreamEvent, ProviderError>;

enum Script {
    Events(Vec<Item>),
    /// Events, then a stream that never ends.
    Hang(Vec<Item>),
    Fail(ProviderError),
    /// Tool calls executed through the request's tools, then `Done`.
    Tools(Vec<(&'static str, serde_json::Value)>),
}

struct ScriptedAdapter {
    vendor: Vendor,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<AdapterRequest>>,
    opened: AtomicUsize,
    cancels: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    fn new(vendor: Vendor, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            vendor,
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> AdapterRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    async fn stream(&self, request: AdapterRequest) -> Result<StreamHandle, ProviderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Events(vec![Ok(StreamEvent::Done)]));

        let cancels = self.cancels.clone();
        let on_cancel = move || {
            cancels.fetch_add(1, Ordering::SeqCst);
        };

        let handle = match script {
            Script::Events(events) => StreamHandle::from_stream(stream::iter(events)),
            Script::Hang(events) => {
                StreamHandle::from_stream(stream::iter(events).chain(stream::pending::<Item>()))
            }
            Script::Fail(error) => return Err(error),
            Script::Tools(calls) => {
                let mut events = Vec::new();
                for (i, (name, args)) in calls.into_iter().enumerate() {
                    let call_id = format!("call_{i}");
                    events.push(Ok(StreamEvent::ToolStart {
                        call_id: call_id.clone(),
                        name: name.to_string(),
                        args: args.clone(),
                    }));
                    let tool = request.tools.iter().find(|t| t.id() == name).unwrap();
                    let ctx = ToolContext::new(request.abort.clone()).with_call_id(&call_id);
                    events.push(Ok(match tool.execute(args, ctx).await {
                        Ok(result) => StreamEvent::ToolEnd {
                            call_id,
                            name: name.to_string(),
                            result: result.output,
                        },
                        Err(err) => StreamEvent::ToolError {
                            call_id,
                            name: name.to_string(),
                            error: err.to_string(),
                        },
                    }));
                }
                events.push(Ok(StreamEvent::TextDelta("done".into())));
                events.push(Ok(StreamEvent::Done));
                StreamHandle::from_stream(stream::iter(events))
            }
        };
        Ok(handle.with_cancel(on_cancel))
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ServiceEvent>>,
    cancel_on_chunk: Option<CancellationToken>,
    cancel_on_wait: Option<CancellationToken>,
}

impl RecordingSink {
    fn cancelling(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel_on_chunk: Some(token),
            ..Default::default()
        })
    }

    fn cancelling_on_wait(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel_on_wait: Some(token),
            ..Default::default()
        })
    }

    fn events(&self) -> Vec<ServiceEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    fn chunks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServiceEvent::Chunk { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ServiceEvent) {
        let trigger = match event {
            ServiceEvent::Chunk { .. } => self.cancel_on_chunk.as_ref(),
            ServiceEvent::RateLimitWait { .. } => self.cancel_on_wait.as_ref(),
            _ => None,
        };
        self.events.lock().unwrap().push(event);
        if let Some(token) = trigger {
            token.cancel();
        }
    }
}

#[derive(Default)]
struct RecordingLimiter {
    initial_wait: AtomicUsize,
    requests: AtomicUsize,
    updates: Mutex<Vec<(String, String, Option<u64>)>>,
}

impl RateLimiter for RecordingLimiter {
    fn check_and_wait(&self, _provider: &str, _model: &str) -> u64 {
        self.initial_wait.swap(0, Ordering::SeqCst) as u64
    }

    fn record_request(&self, _provider: &str, _model: &str) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn update_from_error(
        &self,
        provider: &str,
        model: &str,
        error: &ProviderError,
        _info: Option<&RateLimitInfo>,
    ) {
        let retry_after = match error {
            ProviderError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        };
        self.updates
            .lock()
            .unwrap()
            .push((provider.to_string(), model.to_string(), retry_after));
    }
}

struct ReadFile {
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for ReadFile {
    fn id(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}})
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolResult::simple("read", format!("{} #{n}", args["path"])))
    }
}

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        retry: RetryConfig {
            max_attempts: 3,
            max_cumulative_wait_ms: 1_000,
            initial_delay_ms: 1,
            backoff_factor: 2,
            max_delay_ms: 5,
        },
        ..Default::default()
    }
}

fn all_keys() -> Arc<CredentialStore> {
    Arc::new(
        CredentialStore::new()
            .with_key("openai", "sk-test")
            .with_key("anthropic", "sk-ant-test")
            .with_key("gemini", "g-test"),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn service(adapter: Arc<ScriptedAdapter>, sink: Arc<RecordingSink>) -> LlmService {
    init_tracing();
    LlmService::new(AdapterSet::new().with(adapter), all_keys(), fast_config()).with_sink(sink)
}

fn text(fragment: &str) -> Item {
    Ok(StreamEvent::TextDelta(fragment.to_string()))
}

fn usage(input: u64, output: u64) -> Item {
    Ok(StreamEvent::Usage(UsageRecord::new(input, output)))
}

fn done() -> Item {
    Ok(StreamEvent::Done)
}

#[tokio::test]
async fn test_streams_chunks_and_records_history() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![text("Hel"), text("lo"), usage(10, 2), done()])],
    );
    let sink = Arc::new(RecordingSink::default());
    let svc = service(adapter.clone(), sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    assert!(response.is_success(), "{:?}", response.error);
    assert_eq!(response.text, "Hello");
    assert_eq!(sink.chunks(), vec!["Hel", "lo"]);
    assert_eq!(sink.count("token_usage"), 1);
    assert_eq!(sink.count("usage_breakdown"), 1);
    assert_eq!(sink.count("error"), 0);

    assert_eq!(ctx.messages.len(), 2);
    assert_eq!(ctx.messages[0], ContextMessage::user("hi"));
    assert_eq!(ctx.messages[1], ContextMessage::assistant("Hello"));
    assert_eq!(adapter.last_request().model, "gpt-4o");
}

#[tokio::test]
async fn test_cumulative_usage_is_emitted_as_deltas() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![
            usage(100, 10),
            text("ok"),
            usage(100, 30),
            usage(100, 30),
            done(),
        ])],
    );
    let sink = Arc::new(RecordingSink::default());
    let mut config = fast_config();
    config
        .pricing
        .insert("openai/gpt-4o".into(), ModelCost::new(2.5, 10.0));
    let svc = LlmService::new(AdapterSet::new().with(adapter), all_keys(), config)
        .with_sink(sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    svc.send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    let totals: Vec<u64> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServiceEvent::TokenUsage { usage, .. } => Some(usage.total_tokens),
            _ => None,
        })
        .collect();
    assert_eq!(totals, vec![110, 20]);

    let breakdown = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServiceEvent::UsageBreakdown { breakdown, .. } => Some(breakdown),
            _ => None,
        })
        .unwrap();
    assert_eq!(breakdown.total_tokens, 130);
    assert!(breakdown.cost.is_some());
}

#[tokio::test]
async fn test_anthropic_never_receives_system_messages() {
    let adapter = ScriptedAdapter::new(
        Vendor::Anthropic,
        vec![Script::Events(vec![text("ok"), done()])],
    );
    let svc = service(adapter.clone(), Arc::new(RecordingSink::default()));
    let mut ctx = ConversationContext::new()
        .with_provider("anthropic", "claude-sonnet-4-20250514")
        .with_system_instructions("You are terse.")
        .with_message(ContextMessage::system("Prefer Rust."))
        .with_message(ContextMessage::user("first"))
        .with_message(ContextMessage::assistant("reply"));

    svc.send(&mut ctx, ServiceRequest::new("second"), CancellationToken::new())
        .await;

    let request = adapter.last_request();
    let WirePayload::SystemAndMessages { system, messages } = &request.payload else {
        panic!("expected separated system blocks");
    };
    assert!(messages.iter().all(|m| m.role != Role::System));
    assert_eq!(messages.len(), 3);
    let system_text: Vec<&str> = system.iter().map(|b| b.text.as_str()).collect();
    assert_eq!(system_text, vec!["You are terse.", "Prefer Rust."]);
    assert!(request.sampling.include_thoughts);
}

#[tokio::test]
async fn test_user_message_is_not_duplicated() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![text("yo"), done()])],
    );
    let svc = service(adapter.clone(), Arc::new(RecordingSink::default()));
    let mut ctx = ConversationContext::new()
        .with_provider("openai", "gpt-4o")
        .with_message(ContextMessage::user("hi"));

    svc.send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    let roles: Vec<Role> = ctx.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(adapter.last_request().payload.messages().len(), 1);
}

#[tokio::test]
async fn test_stateless_call_leaves_context_untouched() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![text("4"), done()])],
    );
    let svc = service(adapter.clone(), Arc::new(RecordingSink::default()));
    let mut ctx = ConversationContext::new()
        .with_provider("openai", "gpt-4o")
        .with_system_instructions("persisted")
        .with_message(ContextMessage::user("earlier"))
        .with_message(ContextMessage::assistant("answer"));
    let before = ctx.clone();

    let response = svc
        .send(
            &mut ctx,
            ServiceRequest::new("2+2?")
                .stateless()
                .with_system_instructions("just the number"),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.text, "4");
    assert_eq!(ctx, before);

    let messages = adapter.last_request().payload.messages().to_vec();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].content, Content::from("just the number"));
    assert_eq!(messages[1].content, Content::from("2+2?"));
}

#[tokio::test]
async fn test_gemini_resent_text_is_deduplicated() {
    let adapter = ScriptedAdapter::new(
        Vendor::Gemini,
        vec![Script::Events(vec![
            text("Hel"),
            text("Hello"),
            text("Hello world"),
            text("Hello world"),
            done(),
        ])],
    );
    let sink = Arc::new(RecordingSink::default());
    let svc = service(adapter, sink.clone());
    let mut ctx = ConversationContext::new().with_provider("google", "gemini-2.5-flash");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("greet"), CancellationToken::new())
        .await;

    assert_eq!(response.text, "Hello world");
    assert_eq!(sink.chunks(), vec!["Hel", "lo", " world"]);
}

#[tokio::test]
async fn test_cancel_mid_stream_returns_partial_text() {
    let cancel = CancellationToken::new();
    let adapter = ScriptedAdapter::new(Vendor::OpenAi, vec![Script::Hang(vec![text("partial")])]);
    let sink = RecordingSink::cancelling(cancel.clone());
    let svc = service(adapter.clone(), sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc.send(&mut ctx, ServiceRequest::new("go"), cancel).await;

    assert!(response.is_cancelled(), "{:?}", response.error);
    assert_eq!(response.text, "partial");
    assert_eq!(adapter.cancels(), 1);
    assert_eq!(adapter.opened(), 1);
    assert_eq!(sink.count("token_usage"), 1);
    assert_eq!(sink.count("error"), 0);
    assert_eq!(sink.count("usage_breakdown"), 0);
    // The user message stays, no assistant reply is recorded.
    assert_eq!(ctx.messages.len(), 1);
}

#[tokio::test]
async fn test_cancel_before_start_opens_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let adapter = ScriptedAdapter::new(Vendor::OpenAi, vec![]);
    let sink = Arc::new(RecordingSink::default());
    let svc = service(adapter.clone(), sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc.send(&mut ctx, ServiceRequest::new("go"), cancel).await;

    assert!(response.is_cancelled());
    assert!(response.text.is_empty());
    assert_eq!(adapter.opened(), 0);
    assert!(sink.events().is_empty());
    assert!(ctx.messages.is_empty());
}

#[tokio::test]
async fn test_rate_limited_attempt_is_retried() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![
            Script::Fail(ProviderError::rate_limited("slow down", Some(1))),
            Script::Events(vec![text("ok"), done()]),
        ],
    );
    let sink = Arc::new(RecordingSink::default());
    let limiter = Arc::new(RecordingLimiter::default());
    let svc = service(adapter.clone(), sink.clone()).with_rate_limiter(limiter.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    assert!(response.is_success(), "{:?}", response.error);
    assert_eq!(response.text, "ok");
    assert_eq!(adapter.opened(), 2);
    assert_eq!(limiter.requests.load(Ordering::SeqCst), 2);
    assert_eq!(
        *limiter.updates.lock().unwrap(),
        vec![("openai".to_string(), "gpt-4o".to_string(), Some(1))]
    );
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ServiceEvent::RateLimitWait { attempt: 1, wait_ms: 1, .. }
    )));
}

#[tokio::test]
async fn test_proactive_rate_limit_wait_is_announced() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![text("ok"), done()])],
    );
    let sink = Arc::new(RecordingSink::default());
    let limiter = Arc::new(RecordingLimiter::default());
    limiter.initial_wait.store(5, Ordering::SeqCst);
    let svc = service(adapter, sink.clone()).with_rate_limiter(limiter);
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    assert!(response.is_success());
    assert!(matches!(
        sink.events().first(),
        Some(ServiceEvent::RateLimitWait { wait_ms: 5, attempt: 0, .. })
    ));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![
            Script::Fail(ProviderError::api_error(503, "overloaded")),
            Script::Fail(ProviderError::api_error(503, "overloaded")),
            Script::Fail(ProviderError::api_error(503, "overloaded")),
            Script::Events(vec![text("never"), done()]),
        ],
    );
    let sink = Arc::new(RecordingSink::default());
    let svc = service(adapter.clone(), sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    assert_eq!(adapter.opened(), 3);
    assert!(response.error.unwrap().contains("overloaded"));
    assert_eq!(sink.count("error"), 1);
    assert_eq!(sink.count("rate_limit_wait"), 0);
}

#[tokio::test]
async fn test_cancel_during_proactive_wait() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![text("ok"), done()])],
    );
    let cancel = CancellationToken::new();
    let sink = RecordingSink::cancelling_on_wait(cancel.clone());
    let limiter = Arc::new(RecordingLimiter::default());
    limiter.initial_wait.store(60_000, Ordering::SeqCst);
    let svc = service(adapter.clone(), sink.clone()).with_rate_limiter(limiter);
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        svc.send(&mut ctx, ServiceRequest::new("hi"), cancel),
    )
    .await
    .expect("cancelled wait must resolve immediately");

    assert!(response.is_cancelled());
    assert!(response.text.is_empty());
    assert_eq!(adapter.opened(), 0);
    assert_eq!(sink.count("rate_limit_wait"), 1);
    assert_eq!(sink.count("error"), 0);
    assert_eq!(sink.count("token_usage"), 0);
    assert_eq!(sink.count("usage_breakdown"), 0);
}

#[tokio::test]
async fn test_cancel_during_retry_backoff() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![
            Script::Fail(ProviderError::rate_limited("slow down", Some(30_000))),
            Script::Events(vec![text("never"), done()]),
        ],
    );
    let cancel = CancellationToken::new();
    let sink = RecordingSink::cancelling_on_wait(cancel.clone());
    let mut config = fast_config();
    config.retry.max_cumulative_wait_ms = 600_000;
    let svc = LlmService::new(AdapterSet::new().with(adapter.clone()), all_keys(), config)
        .with_sink(sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        svc.send(&mut ctx, ServiceRequest::new("hi"), cancel),
    )
    .await
    .expect("cancelled backoff must resolve immediately");

    assert!(response.is_cancelled());
    assert_eq!(adapter.opened(), 1);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ServiceEvent::RateLimitWait { attempt: 1, wait_ms: 30_000, .. }
    )));
    assert_eq!(sink.count("error"), 0);
    assert_eq!(sink.count("token_usage"), 1);
    assert_eq!(sink.count("usage_breakdown"), 0);
}

#[tokio::test]
async fn test_failure_after_output_is_not_retried() {
    let adapter = ScriptedAdapter::new(
        Vendor::OpenAi,
        vec![Script::Events(vec![
            text("half"),
            Err(ProviderError::NetworkError("connection reset".into())),
        ])],
    );
    let sink = Arc::new(RecordingSink::default());
    let svc = service(adapter.clone(), sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    assert_eq!(adapter.opened(), 1);
    assert_eq!(response.text, "half");
    assert!(response.error.unwrap().contains("connection reset"));
    assert_eq!(sink.count("error"), 1);
    assert_eq!(sink.count("token_usage"), 1);
}

#[tokio::test]
async fn test_missing_credential() {
    let adapter = ScriptedAdapter::new(Vendor::Anthropic, vec![]);
    let sink = Arc::new(RecordingSink::default());
    let svc = LlmService::new(
        AdapterSet::new().with(adapter.clone()),
        Arc::new(CredentialStore::new()),
        fast_config(),
    )
    .with_sink(sink.clone());
    let mut ctx = ConversationContext::new().with_provider("anthropic", "claude-3-5-haiku");

    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;

    assert!(response.error.unwrap().contains("No API key"));
    assert_eq!(adapter.opened(), 0);
    assert_eq!(sink.count("error"), 1);
    assert!(ctx.messages.is_empty());
}

#[tokio::test]
async fn test_unknown_and_unsupported_providers() {
    let adapter = ScriptedAdapter::new(Vendor::OpenAi, vec![]);
    let svc = service(adapter.clone(), Arc::new(RecordingSink::default()));

    let mut ctx = ConversationContext::new();
    let response = svc
        .send(&mut ctx, ServiceRequest::new("hi"), CancellationToken::new())
        .await;
    assert!(response.error.unwrap().contains("No provider"));

    let response = svc
        .send(
            &mut ctx,
            ServiceRequest::new("hi").with_provider("mistral"),
            CancellationToken::new(),
        )
        .await;
    assert!(response.error.unwrap().contains("Unsupported provider: mistral"));

    // Known vendor, but no adapter registered for it.
    let response = svc
        .send(
            &mut ctx,
            ServiceRequest::new("hi").with_provider("gemini"),
            CancellationToken::new(),
        )
        .await;
    assert!(response.error.unwrap().contains("Unsupported provider"));
    assert_eq!(adapter.opened(), 0);
}

#[tokio::test]
async fn test_invalid_response_schema_is_surfaced() {
    let adapter = ScriptedAdapter::new(Vendor::OpenAi, vec![]);
    let sink = Arc::new(RecordingSink::default());
    let svc = service(adapter.clone(), sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    let response = svc
        .send(
            &mut ctx,
            ServiceRequest::new("hi")
                .with_response_schema(ResponseSchema::new("answer", json!(42))),
            CancellationToken::new(),
        )
        .await;

    assert!(response
        .error
        .unwrap()
        .starts_with("Invalid response schema"));
    assert_eq!(adapter.opened(), 0);
    assert_eq!(sink.count("error"), 1);
}

#[tokio::test]
async fn test_tool_policy_is_request_scoped() {
    let read = Arc::new(ReadFile {
        calls: AtomicUsize::new(0),
    });
    let tools: Vec<Arc<dyn Tool>> = vec![read.clone()];
    let calls = || {
        Script::Tools(vec![
            ("read", json!({"path": "src/lib.rs"})),
            ("read", json!({"path": "src/lib.rs"})),
        ])
    };
    let adapter = ScriptedAdapter::new(Vendor::OpenAi, vec![calls(), calls()]);
    let sink = Arc::new(RecordingSink::default());
    let mut config = fast_config();
    config.tool_policy = ToolPolicy {
        max_calls_per_signature: Some(1),
        ..Default::default()
    };
    let svc = LlmService::new(AdapterSet::new().with(adapter), all_keys(), config)
        .with_sink(sink.clone());
    let mut ctx = ConversationContext::new().with_provider("openai", "gpt-4o");

    for _ in 0..2 {
        let response = svc
            .send(
                &mut ctx,
                ServiceRequest::new("read it").with_tools(tools.clone()),
                CancellationToken::new(),
            )
            .await;
        assert!(response.is_success());
    }

    // One live call per request; the repeat inside each request is locked.
    assert_eq!(read.calls.load(Ordering::SeqCst), 2);
    let locked: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServiceEvent::ToolError { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(locked.len(), 2);
    assert!(locked.iter().all(|e| e.starts_with("read_locked")));
    assert_eq!(sink.count("tool_start"), 4);
    assert_eq!(sink.count("tool_end"), 2);
}
