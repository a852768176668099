use crate::provider::ProviderError;
use crate::usage::UsageRecord;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Text fragment. Depending on the vendor this is either a clean delta
    /// or may repeat text that was already sent.
    TextDelta(String),
    /// Incremental reasoning text.
    ReasoningDelta(String),
    /// The adapter is about to invoke a tool.
    ToolStart {
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    /// A tool invocation finished.
    ToolEnd {
        call_id: String,
        name: String,
        result: String,
    },
    /// A tool invocation failed.
    ToolError {
        call_id: String,
        name: String,
        error: String,
    },
    /// Provider-reported usage for a step.
    Usage(UsageRecord),
    Done,
    Error(String),
}

pub type StreamResult = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

type Canceller = Box<dyn FnOnce() + Send>;

/// An open vendor stream together with its cancel operation.
pub struct StreamHandle {
    events: StreamResult,
    canceller: Option<Canceller>,
}

impl StreamHandle {
    pub fn new(events: StreamResult) -> Self {
        Self {
            events,
            canceller: None,
        }
    }

    pub fn from_stream<S>(events: S) -> Self
    where
        S: Stream<Item = Result<StreamEvent, ProviderError>> + Send + 'static,
    {
        Self::new(Box::pin(events))
    }

    pub fn with_cancel<F>(mut self, cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.canceller = Some(Box::new(cancel));
        self
    }

    pub async fn next(&mut self) -> Option<Result<StreamEvent, ProviderError>> {
        self.events.next().await
    }

    /// Runs the cancel operation. Returns `false` if it already ran.
    pub fn cancel(&mut self) -> bool {
        match self.canceller.take() {
            Some(cancel) => {
                cancel();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("cancellable", &self.canceller.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_handle_yields_events_in_order() {
        let events: Vec<Result<StreamEvent, ProviderError>> =
            vec![Ok(StreamEvent::TextDelta("a".into())), Ok(StreamEvent::Done)];
        let mut handle = StreamHandle::from_stream(futures::stream::iter(events));

        assert_eq!(
            handle.next().await,
            Some(Ok(StreamEvent::TextDelta("a".into())))
        );
        assert_eq!(handle.next().await, Some(Ok(StreamEvent::Done)));
        assert_eq!(handle.next().await, None);
    }

    #[test]
    fn test_cancel_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let empty = futures::stream::empty::<Result<StreamEvent, ProviderError>>();
        let mut handle = StreamHandle::from_stream(empty).with_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
