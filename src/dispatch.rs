//! Daily-update dispatch.
//!
//! The envelope hands its [`DailyUpdatePayload`] to every handler in a
//! [`HandlerRegistry`]. The registry is assembled once at startup and shared
//! read-only; there is no way to add or remove handlers afterwards.
//!
//! Three handlers ship with the crate:
//! - [`InlineAggregator`] applies the payload on the envelope's own
//!   transaction before COMMIT (authoritative, no extra moving parts)
//! - [`QueuedDispatcher`] writes an outbox task in the same transaction; the
//!   dispatch worker delivers it later with retries
//! - [`LocalDispatcher`] POSTs the payload to an aggregator endpoint after
//!   COMMIT, synchronously

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::aggregator::{apply_daily_update, DailyUpdatePayload};
use crate::context::Context;
use crate::db::dispatch_tasks::NewDispatchTask;
use crate::db::LedgerDb;
use crate::error::{DispatchError, LedgerError};

/// When a handler runs relative to COMMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// Inside the transaction; failure rolls the posting back.
    BeforeCommit,
    /// After COMMIT; failure is reported but the posting stays.
    AfterCommit,
}

/// W3C trace context for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    pub fn new() -> Self {
        let trace_id = Uuid::new_v4().simple().to_string();
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        Self { trace_id, span_id }
    }

    /// Value for the `traceparent` header.
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// What a handler gets besides the payload.
pub struct DispatchContext<'a> {
    pub ctx: &'a Context,
    /// Envelope connection; inside the open transaction for before-commit handlers.
    pub db: &'a LedgerDb,
    pub trace: &'a TraceContext,
}

pub trait DailyUpdateHandler: Send + Sync {
    fn name(&self) -> &str;

    fn phase(&self) -> HandlerPhase;

    fn dispatch(
        &self,
        cx: &DispatchContext<'_>,
        payload: &DailyUpdatePayload,
    ) -> Result<(), DispatchError>;
}

/// Immutable set of dispatch handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn DailyUpdateHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// A registry with no handlers: postings are never aggregated.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn before_commit(&self) -> impl Iterator<Item = &Arc<dyn DailyUpdateHandler>> {
        self.in_phase(HandlerPhase::BeforeCommit)
    }

    pub fn after_commit(&self) -> impl Iterator<Item = &Arc<dyn DailyUpdateHandler>> {
        self.in_phase(HandlerPhase::AfterCommit)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn in_phase(&self, phase: HandlerPhase) -> impl Iterator<Item = &Arc<dyn DailyUpdateHandler>> {
        self.handlers.iter().filter(move |h| h.phase() == phase)
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: Vec<Arc<dyn DailyUpdateHandler>>,
}

impl HandlerRegistryBuilder {
    /// Add a handler. A handler with the same name replaces the earlier one.
    pub fn register(mut self, handler: Arc<dyn DailyUpdateHandler>) -> Self {
        if let Some(pos) = self.handlers.iter().position(|h| h.name() == handler.name()) {
            log::warn!("HandlerRegistry: replacing handler '{}'", handler.name());
            self.handlers[pos] = handler;
        } else {
            self.handlers.push(handler);
        }
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        log::info!(
            "HandlerRegistry: {} handler(s) registered: {:?}",
            self.handlers.len(),
            self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>()
        );
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}

// =============================================================================
// Inline aggregation
// =============================================================================

/// Applies the payload on the envelope's transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineAggregator;

impl DailyUpdateHandler for InlineAggregator {
    fn name(&self) -> &str {
        "inline"
    }

    fn phase(&self) -> HandlerPhase {
        HandlerPhase::BeforeCommit
    }

    fn dispatch(
        &self,
        cx: &DispatchContext<'_>,
        payload: &DailyUpdatePayload,
    ) -> Result<(), DispatchError> {
        apply_daily_update(cx.db, payload).map_err(|e| match e {
            LedgerError::Database(e) => DispatchError::Sqlite(e),
            other => DispatchError::Aggregate(other.to_string()),
        })?;
        Ok(())
    }
}

// =============================================================================
// Queued dispatch
// =============================================================================

/// A task ready to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub handler: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub payload_json: String,
}

/// Destination for queued tasks.
pub trait TaskQueue: Send + Sync {
    /// Queue a task; `db` is the envelope connection, still inside its transaction.
    fn enqueue(&self, db: &LedgerDb, task: &QueuedTask) -> Result<u64, DispatchError>;
}

/// Outbox in the ledger database itself, delivered by the dispatch worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteTaskQueue;

impl TaskQueue for SqliteTaskQueue {
    fn enqueue(&self, db: &LedgerDb, task: &QueuedTask) -> Result<u64, DispatchError> {
        let id = db.enqueue_dispatch_task(&NewDispatchTask {
            handler: &task.handler,
            url: &task.url,
            method: &task.method,
            headers: &task.headers,
            payload_json: &task.payload_json,
        })?;
        Ok(id)
    }
}

/// In-process queue that only records tasks. For embedding hosts that drain
/// tasks themselves, and for tests.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<QueuedTask>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut *self.tasks.lock())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl TaskQueue for MemoryTaskQueue {
    fn enqueue(&self, _db: &LedgerDb, task: &QueuedTask) -> Result<u64, DispatchError> {
        let mut tasks = self.tasks.lock();
        tasks.push(task.clone());
        Ok(tasks.len() as u64)
    }
}

/// Queues the payload for out-of-band delivery to the aggregator endpoint.
pub struct QueuedDispatcher {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    queue: Arc<dyn TaskQueue>,
}

impl QueuedDispatcher {
    pub fn new(url: impl Into<String>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            queue,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

impl DailyUpdateHandler for QueuedDispatcher {
    fn name(&self) -> &str {
        "queued"
    }

    fn phase(&self) -> HandlerPhase {
        HandlerPhase::BeforeCommit
    }

    fn dispatch(
        &self,
        cx: &DispatchContext<'_>,
        payload: &DailyUpdatePayload,
    ) -> Result<(), DispatchError> {
        let mut headers = self.headers.clone();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("traceparent".to_string(), cx.trace.traceparent());

        let task = QueuedTask {
            handler: self.name().to_string(),
            url: self.url.clone(),
            method: self.method.clone(),
            headers,
            payload_json: serde_json::to_string(payload)?,
        };
        let id = self.queue.enqueue(cx.db, &task)?;
        log::debug!(
            "QueuedDispatcher: queued task {} with {} entries",
            id,
            payload.entries.len()
        );
        Ok(())
    }
}

// =============================================================================
// Local HTTP dispatch
// =============================================================================

/// Synchronous POST to an aggregator endpoint.
///
/// Uses `reqwest::blocking`, so it must not be called from inside an async
/// runtime thread.
pub struct LocalDispatcher {
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::blocking::Client,
}

impl LocalDispatcher {
    pub fn new(url: impl Into<String>) -> Result<Self, DispatchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.into(),
            headers: BTreeMap::new(),
            client,
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

impl DailyUpdateHandler for LocalDispatcher {
    fn name(&self) -> &str {
        "local"
    }

    fn phase(&self) -> HandlerPhase {
        HandlerPhase::AfterCommit
    }

    fn dispatch(
        &self,
        cx: &DispatchContext<'_>,
        payload: &DailyUpdatePayload,
    ) -> Result<(), DispatchError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("traceparent", cx.trace.traceparent())
            .json(payload);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                message,
            });
        }
        log::debug!(
            "LocalDispatcher: delivered {} entries to {}",
            payload.entries.len(),
            self.url
        );
        Ok(())
    }
}
