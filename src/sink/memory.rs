//! In-process sink with scriptable failures
//!
//! Used by the test suite and by hosts that want to run the engine without
//! a network (everything "uploaded" stays in memory).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Credentials, InsertOutcome, SinkError, TelemetrySink};
use crate::types::{SinkResource, TelemetryEntry};

/// How inserts should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    None,
    Unreachable,
    PermissionDenied,
    /// Every insert is rejected as too large
    PayloadTooLarge,
    /// Inserts with more than this many entries are rejected as too large
    PayloadTooLargeAbove(usize),
    /// Only the first N entries of each batch are accepted
    PartialAccept(usize),
    /// Every entry is stored but each id is listed twice in the reply
    DuplicateIds,
}

#[derive(Default)]
struct Script {
    failure: FailureMode,
    probe_delay: Duration,
    insert_delay: Duration,
}

/// In-memory sink
pub struct MemorySink {
    available: AtomicBool,
    script: Mutex<Script>,
    read_token: Option<String>,
    insert_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    stored: Mutex<HashMap<SinkResource, Vec<TelemetryEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            script: Mutex::new(Script::default()),
            read_token: None,
            insert_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Require `token` for reads
    #[must_use]
    pub fn with_read_token(mut self, token: impl Into<String>) -> Self {
        self.read_token = Some(token.into());
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stored_map(&self) -> MutexGuard<'_, HashMap<SinkResource, Vec<TelemetryEntry>>> {
        self.stored.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_failure(&self, failure: FailureMode) {
        self.script().failure = failure;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.script().probe_delay = delay;
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        self.script().insert_delay = delay;
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Everything accepted into `resource`, in arrival order
    pub fn stored(&self, resource: SinkResource) -> Vec<TelemetryEntry> {
        self.stored_map().get(&resource).cloned().unwrap_or_default()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn insert(
        &self,
        resource: SinkResource,
        entries: &[TelemetryEntry],
    ) -> Result<InsertOutcome, SinkError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, failure) = {
            let script = self.script();
            (script.insert_delay, script.failure)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("memory sink offline".to_string()));
        }

        let accepted: &[TelemetryEntry] = match failure {
            FailureMode::None => entries,
            FailureMode::Unreachable => {
                return Err(SinkError::Unreachable("connection refused".to_string()))
            }
            FailureMode::PermissionDenied => {
                return Err(SinkError::PermissionDenied("insert policy".to_string()))
            }
            FailureMode::PayloadTooLarge => {
                return Err(SinkError::PayloadTooLarge(format!("{} rows", entries.len())))
            }
            FailureMode::PayloadTooLargeAbove(max) if entries.len() > max => {
                return Err(SinkError::PayloadTooLarge(format!(
                    "{} rows exceeds {max}",
                    entries.len()
                )))
            }
            FailureMode::PayloadTooLargeAbove(_) => entries,
            FailureMode::PartialAccept(n) => &entries[..n.min(entries.len())],
            FailureMode::DuplicateIds => entries,
        };

        self.stored_map()
            .entry(resource)
            .or_default()
            .extend(accepted.iter().cloned());
        let mut outcome = InsertOutcome::all(accepted);
        if failure == FailureMode::DuplicateIds {
            outcome.accepted.extend(accepted.iter().map(|e| e.id.clone()));
        }
        Ok(outcome)
    }

    async fn probe(&self, _resource: SinkResource) -> Result<(), SinkError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, failure) = {
            let script = self.script();
            (script.probe_delay, script.failure)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("memory sink offline".to_string()));
        }
        if failure == FailureMode::PermissionDenied {
            return Err(SinkError::PermissionDenied("insert policy".to_string()));
        }
        Ok(())
    }

    async fn read_recent(
        &self,
        resource: SinkResource,
        limit: usize,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<TelemetryEntry>, SinkError> {
        let authorized = match (&self.read_token, credentials) {
            (Some(expected), Some(c)) => *expected == c.bearer_token,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if !authorized {
            return Err(SinkError::PermissionDenied(
                "reads require a signed-in user".to_string(),
            ));
        }
        let stored = self.stored(resource);
        let skip = stored.len().saturating_sub(limit);
        Ok(stored.into_iter().skip(skip).collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
