use relay_provider::{
    format_messages, format_single, resolve_sampling, sleep_with_cancel, with_retries,
    AdapterRequest, AdapterSet, Content, ContextMessage, CredentialSource, InputBreakdown,
    IsRetryable, OutputBreakdown, PricingTable, ProviderAdapter, ProviderError, RateLimiter,
    ReasoningEffort, ResponseSchema, Role, SleepCancelled, SlidingWindowLimiter, StepBreakdown,
    StreamEvent, Vendor, WirePayload,
};
use relay_tool::{PolicyScope, Tool};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::context::ConversationContext;
use crate::error::{is_cancellation_message, ServiceError};
use crate::events::{EventSink, NoopSink, ServiceEvent};
use crate::merge::{MergeMode, TextMerger};
use crate::tokens::TokenCounter;
use crate::usage::{ToolCallRecord, UsageAccumulator};

/// One call into the service.
#[derive(Clone, Default)]
pub struct ServiceRequest {
    pub message: Content,
    pub tools: Vec<Arc<dyn Tool>>,
    pub response_schema: Option<ResponseSchema>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Stateless call: the conversation is neither read nor written.
    pub skip_history: bool,
    /// Replaces the conversation's system instructions for this call only.
    pub system_instructions: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ServiceRequest {
    pub fn new(message: impl Into<Content>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn stateless(mut self) -> Self {
        self.skip_history = true;
        self
    }

    pub fn with_system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.system_instructions = Some(instructions.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }
}

impl fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tools: Vec<&str> = self.tools.iter().map(|t| t.id()).collect();
        f.debug_struct("ServiceRequest")
            .field("message", &self.message)
            .field("tools", &tools)
            .field("response_schema", &self.response_schema)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("skip_history", &self.skip_history)
            .field("system_instructions", &self.system_instructions)
            .field("reasoning_effort", &self.reasoning_effort)
            .finish()
    }
}

/// Outcome of one call. A present `error` is authoritative even when
/// `text` holds partial output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceResponse {
    pub text: String,
    pub reasoning: Option<String>,
    pub error: Option<String>,
}

impl ServiceResponse {
    fn failed(error: &ServiceError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_deref().is_some_and(is_cancellation_message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    ResolvingProvider,
    Formatting,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

struct Turn {
    request_id: String,
    state: TurnState,
}

impl Turn {
    fn new() -> Self {
        Self {
            request_id: relay_core::id::request_id(),
            state: TurnState::Idle,
        }
    }

    fn advance(&mut self, next: TurnState) {
        debug!(request_id = %self.request_id, from = ?self.state, to = ?next, "turn state");
        self.state = next;
    }
}

struct Resolved {
    vendor: Vendor,
    model: String,
    credential: String,
}

struct Prepared {
    request: AdapterRequest,
    input_estimate: InputBreakdown,
}

/// Streaming progress carried across attempts.
struct Progress {
    merger: TextMerger,
    reasoning: String,
    usage: UsageAccumulator,
    attempts: u32,
    saw_output: bool,
}

impl Progress {
    fn new(mode: MergeMode) -> Self {
        Self {
            merger: TextMerger::new(mode),
            reasoning: String::new(),
            usage: UsageAccumulator::new(),
            attempts: 0,
            saw_output: false,
        }
    }

    fn reasoning(&self) -> Option<String> {
        (!self.reasoning.is_empty()).then(|| self.reasoning.clone())
    }
}

/// A failed streaming attempt. Attempts that already produced output are
/// never retried.
#[derive(Debug)]
struct AttemptFailure {
    error: ProviderError,
    after_output: bool,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl IsRetryable for AttemptFailure {
    fn is_retryable(&self) -> Option<String> {
        if self.after_output {
            return None;
        }
        self.error.is_retryable()
    }

    fn retry_after_ms(&self) -> Option<u64> {
        self.error.retry_after_ms()
    }
}

impl From<SleepCancelled> for AttemptFailure {
    fn from(cancelled: SleepCancelled) -> Self {
        Self {
            error: cancelled.into(),
            after_output: false,
        }
    }
}

/// Sends conversational turns to vendor adapters and normalizes the result.
pub struct LlmService {
    adapters: AdapterSet,
    credentials: Arc<dyn CredentialSource>,
    rate_limiter: Arc<dyn RateLimiter>,
    sink: Arc<dyn EventSink>,
    config: ServiceConfig,
    pricing: PricingTable,
}

impl LlmService {
    pub fn new(
        adapters: AdapterSet,
        credentials: Arc<dyn CredentialSource>,
        config: ServiceConfig,
    ) -> Self {
        let rate_limiter = Arc::new(SlidingWindowLimiter::new(
            config.rate_limit.requests_per_minute,
        ));
        let pricing = config.pricing_table();
        Self {
            adapters,
            credentials,
            rate_limiter,
            sink: Arc::new(NoopSink),
            config,
            pricing,
        }
    }

    /// Builds a service from a TOML configuration file.
    pub fn from_config_file(
        adapters: AdapterSet,
        credentials: Arc<dyn CredentialSource>,
        path: impl AsRef<Path>,
    ) -> Result<Self, ServiceError> {
        let config = ServiceConfig::load_from_file(path)
            .map_err(|err| ServiceError::Config(format!("{err:#}")))?;
        Ok(Self::new(adapters, credentials, config))
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Runs one turn. Never fails outright: errors are reported in the
    /// response, next to whatever text was produced before them.
    pub async fn send(
        &self,
        ctx: &mut ConversationContext,
        request: ServiceRequest,
        cancel: CancellationToken,
    ) -> ServiceResponse {
        let mut turn = Turn::new();

        if cancel.is_cancelled() {
            info!(request_id = %turn.request_id, "request cancelled before start");
            turn.advance(TurnState::Cancelled);
            return ServiceResponse::failed(&ServiceError::Cancelled);
        }

        turn.advance(TurnState::ResolvingProvider);
        let resolved = match self.resolve(ctx, &request).await {
            Ok(resolved) => resolved,
            Err(err) => {
                let provider = request
                    .provider
                    .clone()
                    .or_else(|| ctx.provider.clone())
                    .unwrap_or_default();
                let model = request.model.clone().unwrap_or_default();
                return self.fail(&mut turn, &provider, &model, err);
            }
        };
        let provider = resolved.vendor.id();
        let model = resolved.model.clone();
        debug!(request_id = %turn.request_id, provider, model = %model, "provider resolved");

        turn.advance(TurnState::Formatting);
        let mut counter = TokenCounter::for_model(resolved.vendor, &model);
        let prepared = match self.prepare(ctx, &request, &resolved, &counter, &cancel) {
            Ok(prepared) => prepared,
            Err(err) => return self.fail(&mut turn, provider, &model, err),
        };

        turn.advance(TurnState::Streaming);
        let mode = if self.config.dedupe_text(resolved.vendor) {
            MergeMode::Deduplicate
        } else {
            MergeMode::Append
        };
        let (mut progress, outcome) = self
            .stream(
                &turn,
                resolved.vendor,
                &model,
                prepared.request,
                &cancel,
                Progress::new(mode),
            )
            .await;

        let reasoning = progress.reasoning();
        let response = match outcome {
            Ok(()) => {
                turn.advance(TurnState::Finalizing);
                let text = progress.merger.text().to_string();
                if !request.skip_history {
                    ctx.append_assistant_message(text.clone(), reasoning.clone());
                }
                self.emit_breakdown(
                    provider,
                    &model,
                    &progress,
                    &prepared.input_estimate,
                    &counter,
                );
                turn.advance(TurnState::Completed);
                ServiceResponse {
                    text,
                    reasoning,
                    error: None,
                }
            }
            Err(failure) => {
                let err = ServiceError::from(failure.error);
                self.emit_best_effort_usage(
                    provider,
                    &model,
                    &mut progress,
                    &prepared.input_estimate,
                    &counter,
                );
                let mut response = self.fail(&mut turn, provider, &model, err);
                response.text = progress.merger.text().to_string();
                response.reasoning = reasoning;
                response
            }
        };

        counter.dispose();
        response
    }

    async fn resolve(
        &self,
        ctx: &ConversationContext,
        request: &ServiceRequest,
    ) -> Result<Resolved, ServiceError> {
        let provider_id = request
            .provider
            .as_deref()
            .or(ctx.provider.as_deref())
            .or(self.config.default_provider.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ServiceError::UnknownProvider)?;

        let vendor = Vendor::from_id(provider_id)
            .ok_or_else(|| ServiceError::UnsupportedProvider(provider_id.to_string()))?;
        if self.adapters.get(vendor).is_none() {
            return Err(ServiceError::UnsupportedProvider(provider_id.to_string()));
        }

        // The context's model only applies when the context's provider is used.
        let context_model = match (&request.provider, &ctx.provider) {
            (Some(requested), Some(own)) if Vendor::from_id(requested) != Vendor::from_id(own) => {
                None
            }
            _ => ctx.model.clone(),
        };
        let model = request
            .model
            .clone()
            .or(context_model)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model(vendor));

        let credential = self
            .credentials
            .get_key(vendor.id())
            .await
            .ok_or_else(|| ServiceError::MissingCredential(vendor.id().to_string()))?;

        Ok(Resolved {
            vendor,
            model,
            credential,
        })
    }

    fn prepare(
        &self,
        ctx: &mut ConversationContext,
        request: &ServiceRequest,
        resolved: &Resolved,
        counter: &TokenCounter,
        cancel: &CancellationToken,
    ) -> Result<Prepared, ServiceError> {
        if let Some(schema) = &request.response_schema {
            schema
                .validate()
                .map_err(ServiceError::InvalidResponseSchema)?;
        }

        let system = request
            .system_instructions
            .clone()
            .or_else(|| ctx.system_instructions.clone());
        let shape = resolved.vendor.wire_shape();

        let payload = if request.skip_history {
            format_single(
                &ContextMessage::user(request.message.clone()),
                system.as_deref(),
                shape,
            )
        } else {
            ctx.append_user_message(request.message.clone());
            format_messages(&ctx.messages, system.as_deref(), shape)
        };

        let sampling = resolve_sampling(
            resolved.vendor,
            &resolved.model,
            &ctx.sampling_defaults(),
            ctx.overrides_for(&resolved.model),
            request.reasoning_effort,
        );

        let tools = PolicyScope::new(self.config.tool_policy.clone()).wrap(&request.tools);

        let adapter_request = AdapterRequest {
            credential: resolved.credential.clone(),
            model: resolved.model.clone(),
            sampling,
            payload,
            tools,
            response_schema: request.response_schema.clone(),
            abort: cancel.child_token(),
        };
        let input_estimate = estimate_input(counter, &adapter_request);

        Ok(Prepared {
            request: adapter_request,
            input_estimate,
        })
    }

    async fn stream(
        &self,
        turn: &Turn,
        vendor: Vendor,
        model: &str,
        request: AdapterRequest,
        cancel: &CancellationToken,
        progress: Progress,
    ) -> (Progress, Result<(), AttemptFailure>) {
        let provider = vendor.id();
        let Some(adapter) = self.adapters.get(vendor) else {
            let failure = AttemptFailure {
                error: ProviderError::StreamError(format!("no adapter for {provider}")),
                after_output: false,
            };
            return (progress, Err(failure));
        };
        let adapter = adapter.as_ref();

        let wait = self.rate_limiter.check_and_wait(provider, model);
        if wait > 0 {
            info!(
                request_id = %turn.request_id,
                provider,
                model,
                wait_ms = wait,
                "waiting for rate limit"
            );
            self.sink.emit(ServiceEvent::RateLimitWait {
                provider: provider.to_string(),
                model: model.to_string(),
                wait_ms: wait,
                attempt: 0,
            });
            if let Err(cancelled) = sleep_with_cancel(wait, cancel).await {
                return (progress, Err(cancelled.into()));
            }
        }

        let request = &request;
        with_retries(
            &self.config.retry,
            cancel,
            progress,
            |mut progress, attempt| async move {
                let result = self
                    .attempt(adapter, request.clone(), model, cancel, attempt, &mut progress)
                    .await;
                (progress, result)
            },
            |attempt, failure, wait_ms| {
                warn!(
                    request_id = %turn.request_id,
                    provider,
                    model,
                    attempt,
                    delay_ms = wait_ms,
                    error = %failure,
                    "retrying stream"
                );
                if failure.error.is_rate_limit() {
                    self.sink.emit(ServiceEvent::RateLimitWait {
                        provider: provider.to_string(),
                        model: model.to_string(),
                        wait_ms,
                        attempt,
                    });
                }
            },
        )
        .await
    }

    async fn attempt(
        &self,
        adapter: &dyn ProviderAdapter,
        request: AdapterRequest,
        model: &str,
        cancel: &CancellationToken,
        attempt: u32,
        progress: &mut Progress,
    ) -> Result<(), AttemptFailure> {
        let provider = adapter.vendor().id();
        progress.attempts += 1;
        self.rate_limiter.record_request(provider, model);
        debug!(provider, model, attempt, "opening stream");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            opened = adapter.stream(request) => opened,
        };
        let mut handle = match opened {
            Ok(handle) => handle,
            Err(error) => return Err(self.attempt_failed(provider, model, error, progress)),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if handle.cancel() {
                        info!(provider, model, "stream cancelled");
                    }
                    let error = ProviderError::Cancelled;
                    return Err(self.attempt_failed(provider, model, error, progress));
                }
                next = handle.next() => next,
            };

            let event = match next {
                None => return Ok(()),
                Some(Ok(event)) => event,
                Some(Err(error)) => {
                    return Err(self.attempt_failed(provider, model, error, progress));
                }
            };

            match event {
                StreamEvent::Done => return Ok(()),
                StreamEvent::Error(message) => {
                    let error = ProviderError::StreamError(message);
                    return Err(self.attempt_failed(provider, model, error, progress));
                }
                other => self.handle_event(provider, model, other, progress),
            }
        }
    }

    fn attempt_failed(
        &self,
        provider: &str,
        model: &str,
        error: ProviderError,
        progress: &Progress,
    ) -> AttemptFailure {
        if error.is_rate_limit() {
            self.rate_limiter.update_from_error(provider, model, &error, None);
        }
        AttemptFailure {
            error,
            after_output: progress.saw_output,
        }
    }

    fn handle_event(
        &self,
        provider: &str,
        model: &str,
        event: StreamEvent,
        progress: &mut Progress,
    ) {
        let provider_s = provider.to_string();
        let model_s = model.to_string();
        match event {
            StreamEvent::TextDelta(fragment) => {
                progress.saw_output = true;
                if let Some(text) = progress.merger.push(&fragment) {
                    self.sink.emit(ServiceEvent::Chunk {
                        provider: provider_s,
                        model: model_s,
                        text,
                    });
                }
            }
            StreamEvent::ReasoningDelta(text) => {
                if text.is_empty() {
                    return;
                }
                progress.saw_output = true;
                progress.reasoning.push_str(&text);
                self.sink.emit(ServiceEvent::Reasoning {
                    provider: provider_s,
                    model: model_s,
                    text,
                });
            }
            StreamEvent::ToolStart {
                call_id,
                name,
                args,
            } => {
                progress.saw_output = true;
                progress.usage.record_tool_call(ToolCallRecord {
                    name: name.clone(),
                    call_id: call_id.clone(),
                    args: args.clone(),
                    result: None,
                });
                self.sink.emit(ServiceEvent::ToolStart {
                    provider: provider_s,
                    model: model_s,
                    call_id,
                    name,
                    args,
                });
            }
            StreamEvent::ToolEnd {
                call_id,
                name,
                result,
            } => {
                progress.usage.record_tool_result(&call_id, result.clone());
                self.sink.emit(ServiceEvent::ToolEnd {
                    provider: provider_s,
                    model: model_s,
                    call_id,
                    name,
                    result,
                });
            }
            StreamEvent::ToolError {
                call_id,
                name,
                error,
            } => {
                progress.usage.record_tool_result(&call_id, error.clone());
                self.sink.emit(ServiceEvent::ToolError {
                    provider: provider_s,
                    model: model_s,
                    call_id,
                    name,
                    error,
                });
            }
            StreamEvent::Usage(record) => {
                if let Some(step) = &record.breakdown {
                    progress.usage.record_step_usage(step);
                }
                if let Some(delta) = progress.usage.record_provider_usage(record) {
                    self.sink.emit(ServiceEvent::TokenUsage {
                        provider: provider_s,
                        model: model_s,
                        usage: delta,
                        best_effort: false,
                    });
                }
            }
            StreamEvent::Done | StreamEvent::Error(_) => {}
        }
    }

    fn emit_breakdown(
        &self,
        provider: &str,
        model: &str,
        progress: &Progress,
        input_estimate: &InputBreakdown,
        counter: &TokenCounter,
    ) {
        let (tool_args, tool_results) = progress.usage.tool_io_tokens(counter);
        let mut input = *input_estimate;
        input.tool_results = input.tool_results.saturating_add(tool_results);
        let local = StepBreakdown {
            input,
            output: OutputBreakdown {
                text: counter.count(progress.merger.text()),
                reasoning: counter.count(&progress.reasoning),
                tool_calls: tool_args,
            },
        };
        let breakdown = progress
            .usage
            .final_breakdown(&local, self.pricing.lookup(provider, model));
        debug!(
            provider,
            model,
            total_tokens = breakdown.total_tokens,
            source = ?breakdown.source,
            "usage breakdown"
        );
        self.sink.emit(ServiceEvent::UsageBreakdown {
            provider: provider.to_string(),
            model: model.to_string(),
            breakdown,
        });
    }

    fn emit_best_effort_usage(
        &self,
        provider: &str,
        model: &str,
        progress: &mut Progress,
        input_estimate: &InputBreakdown,
        counter: &TokenCounter,
    ) {
        if progress.attempts == 0 {
            return;
        }
        let output = counter.count(progress.merger.text()) + counter.count(&progress.reasoning);
        if let Some(usage) = progress.usage.best_effort_usage(input_estimate.total(), output) {
            self.sink.emit(ServiceEvent::TokenUsage {
                provider: provider.to_string(),
                model: model.to_string(),
                usage,
                best_effort: true,
            });
        }
    }

    fn fail(
        &self,
        turn: &mut Turn,
        provider: &str,
        model: &str,
        err: ServiceError,
    ) -> ServiceResponse {
        if err.is_cancellation() {
            info!(request_id = %turn.request_id, provider, model, "request cancelled");
            turn.advance(TurnState::Cancelled);
        } else {
            warn!(request_id = %turn.request_id, provider, model, error = %err, "request failed");
            turn.advance(TurnState::Failed);
            self.sink.emit(ServiceEvent::Error {
                provider: provider.to_string(),
                model: model.to_string(),
                message: err.to_string(),
            });
        }
        ServiceResponse::failed(&err)
    }
}

/// Local input-token estimate by category.
fn estimate_input(counter: &TokenCounter, request: &AdapterRequest) -> InputBreakdown {
    let mut breakdown = InputBreakdown::default();

    if let WirePayload::SystemAndMessages { system, .. } = &request.payload {
        breakdown.system = system.iter().map(|b| counter.count(&b.text)).sum();
    }
    for message in request.payload.messages() {
        let tokens = counter.count(&message.content.text_lossy());
        match message.role {
            Role::System => breakdown.system += tokens,
            Role::User => breakdown.user += tokens,
            Role::Assistant => breakdown.assistant += tokens,
        }
    }

    let definitions = request.tool_definitions();
    if !definitions.is_empty() {
        match serde_json::to_string(&definitions) {
            Ok(json) => breakdown.tool_definitions = counter.count(&json),
            Err(error) => warn!(%error, "failed to serialize tool definitions"),
        }
    }
    if let Some(schema) = &request.response_schema {
        breakdown.response_schema = counter.count(&schema.schema.to_string());
    }
    breakdown
}
