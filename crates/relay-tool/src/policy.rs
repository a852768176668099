//! Per-request invocation policies layered over caller-supplied tools.
//!
//! A [`PolicyScope`] owns the call counters and result cache for one
//! request. Every tool wrapped through the same scope shares that state, and
//! a new scope starts empty, so nothing leaks between requests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::tool::{Tool, ToolContext, ToolError, ToolResult};

/// Prefix of every error produced when a call cap is hit.
pub const READ_LOCKED: &str = "read_locked";

const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "file"];
const RANGE_START_KEYS: &[&str] = &["start_line", "startLine", "offset", "start"];
const RANGE_END_KEYS: &[&str] = &["end_line", "endLine", "limit", "end"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    /// Return the cached result for a repeated signature instead of calling again.
    pub dedupe: bool,
    /// Live calls allowed per signature before the call is locked.
    pub max_calls_per_signature: Option<u32>,
    /// Live calls allowed per file (across all ranges) before the call is locked.
    pub max_calls_per_file: Option<u32>,
    /// When a capped call has a cached result, serve it instead of the lock error.
    pub force_cache: bool,
}

impl ToolPolicy {
    pub fn is_passthrough(&self) -> bool {
        !self.dedupe
            && !self.force_cache
            && self.max_calls_per_signature.is_none()
            && self.max_calls_per_file.is_none()
    }
}

/// Deterministic identity of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolSignature {
    pub key: String,
    pub file: Option<String>,
}

impl ToolSignature {
    /// Ranged reads are keyed by path and range bounds, anything else by its
    /// full canonicalized argument object.
    pub fn for_call(tool: &str, args: &serde_json::Value) -> Self {
        let file = first_str(args, PATH_KEYS).map(normalize_path);

        if let Some(path) = &file {
            let start = first_value(args, RANGE_START_KEYS);
            let end = first_value(args, RANGE_END_KEYS);
            if start.is_some() || end.is_some() {
                return Self {
                    key: format!(
                        "{tool}:{path}:{}:{}",
                        bound_text(start),
                        bound_text(end)
                    ),
                    file,
                };
            }
        }

        Self {
            key: format!("{tool}:{}", canonical_json(args)),
            file,
        }
    }
}

fn first_value<'a>(args: &'a serde_json::Value, keys: &[&str]) -> Option<&'a serde_json::Value> {
    keys.iter()
        .find_map(|k| args.get(*k))
        .filter(|v| !v.is_null())
}

fn first_str<'a>(args: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(*k).and_then(|v| v.as_str()))
}

fn bound_text(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    calls_by_signature: HashMap<String, u32>,
    calls_by_file: HashMap<String, u32>,
    results: HashMap<String, Arc<OnceCell<ToolResult>>>,
}

enum Admission {
    Cached(ToolResult),
    Locked(String),
    /// A call slot is reserved; the cell receives the result.
    Run(Arc<OnceCell<ToolResult>>),
}

/// Request-scoped policy state shared by all tools it wraps.
#[derive(Debug, Clone)]
pub struct PolicyScope {
    policy: ToolPolicy,
    state: Arc<Mutex<PolicyState>>,
}

impl PolicyScope {
    pub fn new(policy: ToolPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(PolicyState::default())),
        }
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    pub fn wrap(&self, tools: &[Arc<dyn Tool>]) -> Vec<Arc<dyn Tool>> {
        if self.policy.is_passthrough() {
            return tools.to_vec();
        }
        tools
            .iter()
            .map(|inner| {
                Arc::new(PolicyTool {
                    inner: inner.clone(),
                    scope: self.clone(),
                }) as Arc<dyn Tool>
            })
            .collect()
    }

    /// Live invocations recorded for `signature` in this scope.
    pub fn calls_for(&self, signature: &ToolSignature) -> u32 {
        self.state
            .lock()
            .calls_by_signature
            .get(&signature.key)
            .copied()
            .unwrap_or(0)
    }

    /// Checks the caps and reserves a call slot under one lock, so concurrent
    /// calls cannot all slip under a cap.
    fn admit(&self, tool: &str, signature: &ToolSignature) -> Admission {
        let mut state = self.state.lock();
        let cell = state
            .results
            .entry(signature.key.clone())
            .or_default()
            .clone();

        if self.policy.dedupe || self.policy.force_cache {
            if let Some(result) = cell.get() {
                return Admission::Cached(result.clone());
            }
        }

        let signature_calls = state
            .calls_by_signature
            .get(&signature.key)
            .copied()
            .unwrap_or(0);
        let file_calls = signature
            .file
            .as_ref()
            .and_then(|f| state.calls_by_file.get(f))
            .copied()
            .unwrap_or(0);

        let locked_by_signature = self
            .policy
            .max_calls_per_signature
            .is_some_and(|cap| signature_calls >= cap);
        let locked_by_file = signature.file.is_some()
            && self
                .policy
                .max_calls_per_file
                .is_some_and(|cap| file_calls >= cap);

        if locked_by_signature {
            return Admission::Locked(format!(
                "{READ_LOCKED}: {tool} already called {signature_calls} time(s) with these arguments"
            ));
        }
        if locked_by_file {
            return Admission::Locked(format!(
                "{READ_LOCKED}: {tool} already called {file_calls} time(s) for {}",
                signature.file.as_deref().unwrap_or_default()
            ));
        }

        *state
            .calls_by_signature
            .entry(signature.key.clone())
            .or_insert(0) += 1;
        if let Some(file) = &signature.file {
            *state.calls_by_file.entry(file.clone()).or_insert(0) += 1;
        }
        Admission::Run(cell)
    }

    /// Returns a reserved slot that did not turn into a successful live call.
    fn release(&self, signature: &ToolSignature) {
        let mut state = self.state.lock();
        if let Some(count) = state.calls_by_signature.get_mut(&signature.key) {
            *count = count.saturating_sub(1);
        }
        if let Some(file) = &signature.file {
            if let Some(count) = state.calls_by_file.get_mut(file) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// A tool whose calls are filtered through a [`PolicyScope`].
pub struct PolicyTool {
    inner: Arc<dyn Tool>,
    scope: PolicyScope,
}

#[async_trait]
impl Tool for PolicyTool {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters(&self) -> serde_json::Value {
        self.inner.parameters()
    }

    fn validate(&self, args: &serde_json::Value) -> Result<(), ToolError> {
        self.inner.validate(args)
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let signature = ToolSignature::for_call(self.inner.id(), &args);

        let cell = match self.scope.admit(self.inner.id(), &signature) {
            Admission::Cached(result) => {
                tracing::debug!(
                    tool = self.inner.id(),
                    signature = %signature.key,
                    "serving cached tool result"
                );
                return Ok(result);
            }
            Admission::Locked(message) => {
                tracing::debug!(
                    tool = self.inner.id(),
                    signature = %signature.key,
                    "tool call locked"
                );
                return Err(ToolError::ReadLocked(message));
            }
            Admission::Run(cell) => cell,
        };

        if !self.scope.policy.dedupe {
            return match self.inner.execute(args, ctx).await {
                Ok(result) => {
                    let _ = cell.set(result.clone());
                    Ok(result)
                }
                Err(err) => {
                    self.scope.release(&signature);
                    Err(err)
                }
            };
        }

        // Identical calls already in flight share the first call's result.
        let ran = AtomicBool::new(false);
        let flag = &ran;
        let inner = &self.inner;
        let outcome = cell
            .get_or_try_init(move || async move {
                flag.store(true, Ordering::SeqCst);
                inner.execute(args, ctx).await
            })
            .await
            .cloned();
        if outcome.is_err() || !ran.load(Ordering::SeqCst) {
            self.scope.release(&signature);
        }
        outcome
    }
}
