//! Background delivery of queued daily-update tasks.
//!
//! The worker owns its own connection to the ledger file. Each poll it claims
//! the due tasks, POSTs each one once, and records the outcome:
//! - 2xx: delivered
//! - retryable failure (connect/timeout, 408, 429, 5xx): rescheduled with
//!   exponential backoff plus jitter, honouring `Retry-After`
//! - anything else, or the final attempt: dead
//!
//! Delivered tasks are pruned after an hour. Dead tasks stay for inspection.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};

use crate::config::QueueConfig;
use crate::context::Context;
use crate::db::dispatch_tasks::DispatchTask;
use crate::db::LedgerDb;
use crate::error::DispatchError;

/// How long delivered tasks are kept.
const DELIVERED_RETENTION_SECS: i64 = 3600;

/// Prune delivered tasks roughly once a minute.
const PRUNE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
        }
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

/// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
fn retry_delay(attempt: u32, policy: &RetryPolicy, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.trim().parse::<u64>() {
            return Duration::from_secs(secs).min(Duration::from_millis(policy.max_backoff_ms));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 250;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Result of one delivery attempt.
#[derive(Debug)]
enum Attempt {
    Delivered,
    Retry {
        error: String,
        retry_after: Option<HeaderValue>,
    },
    Fatal(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead: usize,
}

fn request_headers(task: &DispatchTask) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &task.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => log::warn!("DispatchWorker: task {} has invalid header '{}'", task.id, name),
        }
    }
    headers
}

async fn attempt(client: &reqwest::Client, task: &DispatchTask) -> Attempt {
    let method = match reqwest::Method::from_bytes(task.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return Attempt::Fatal(format!("invalid method {}", task.method)),
    };
    let request = client
        .request(method, &task.url)
        .headers(request_headers(task))
        .body(task.payload_json.clone());

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                return Attempt::Delivered;
            }
            let retry_after = response.headers().get(RETRY_AFTER).cloned();
            let message = response.text().await.unwrap_or_default();
            let error = DispatchError::Status {
                status: status.as_u16(),
                message,
            }
            .to_string();
            match retry_decision_for_status(status) {
                RetryDecision::Retryable => Attempt::Retry { error, retry_after },
                RetryDecision::NonRetryable => Attempt::Fatal(error),
            }
        }
        Err(err) => {
            let error = DispatchError::Http(err);
            let retryable = matches!(&error, DispatchError::Http(e) if e.is_timeout() || e.is_connect());
            if retryable {
                Attempt::Retry {
                    error: error.to_string(),
                    retry_after: None,
                }
            } else {
                Attempt::Fatal(error.to_string())
            }
        }
    }
}

/// Deliver every task due now, once each.
pub async fn deliver_due_tasks(
    db: &LedgerDb,
    client: &reqwest::Client,
    policy: &RetryPolicy,
    batch_size: usize,
) -> Result<DeliveryStats, DispatchError> {
    let tasks = db.get_due_dispatch_tasks(Utc::now(), batch_size)?;
    let mut stats = DeliveryStats::default();

    for task in tasks {
        let outcome = attempt(client, &task).await;
        let attempt_no = task.attempts + 1;
        match outcome {
            Attempt::Delivered => {
                db.mark_dispatch_delivered(task.id)?;
                stats.delivered += 1;
                log::debug!("DispatchWorker: delivered task {} (attempt {})", task.id, attempt_no);
            }
            Attempt::Retry { error, retry_after } if attempt_no < policy.max_attempts.max(1) => {
                let delay = retry_delay(attempt_no, policy, retry_after.as_ref());
                log::warn!(
                    "DispatchWorker: task {} attempt {}/{} failed: {} (retry in {:?})",
                    task.id,
                    attempt_no,
                    policy.max_attempts,
                    error,
                    delay
                );
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::milliseconds(policy.max_backoff_ms as i64));
                db.reschedule_dispatch_task(task.id, &error, delay)?;
                stats.rescheduled += 1;
            }
            Attempt::Retry { error, .. } | Attempt::Fatal(error) => {
                log::warn!(
                    "DispatchWorker: task {} dead after attempt {}: {}",
                    task.id,
                    attempt_no,
                    error
                );
                db.mark_dispatch_dead(task.id, &error)?;
                stats.dead += 1;
            }
        }
    }
    Ok(stats)
}

/// Poll the outbox until `shutdown` is cancelled.
pub async fn run_dispatch_worker(
    db: LedgerDb,
    config: QueueConfig,
    shutdown: Context,
) -> Result<(), DispatchError> {
    log::info!("DispatchWorker: started");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let policy = RetryPolicy::from(&config);
    let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
    let prune_every = (PRUNE_INTERVAL_SECS / config.poll_interval_secs.max(1)).max(1);
    let mut polls_since_prune: u64 = 0;

    loop {
        if shutdown.is_cancelled() {
            log::info!("DispatchWorker: stopping");
            return Ok(());
        }

        polls_since_prune += 1;
        if polls_since_prune >= prune_every {
            let cutoff = Utc::now() - chrono::Duration::seconds(DELIVERED_RETENTION_SECS);
            match db.prune_delivered_tasks(cutoff) {
                Ok(0) => {}
                Ok(pruned) => log::debug!("DispatchWorker: pruned {} delivered tasks", pruned),
                Err(e) => log::warn!("DispatchWorker: prune failed: {}", e),
            }
            polls_since_prune = 0;
        }

        match deliver_due_tasks(&db, &client, &policy, config.batch_size).await {
            Ok(stats) if stats == DeliveryStats::default() => {}
            Ok(stats) => log::info!(
                "DispatchWorker: {} delivered, {} rescheduled, {} dead",
                stats.delivered,
                stats.rescheduled,
                stats.dead
            ),
            Err(e) => log::warn!("DispatchWorker: poll failed: {}", e),
        }

        tokio::time::sleep(poll_interval).await;
    }
}
