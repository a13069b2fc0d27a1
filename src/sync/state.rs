//! Per-stream lifecycle state
//!
//! ```text
//! Uninitialized → Initializing → Ready{available} ⇄ Flushing
//! ```
//!
//! `Ready` carries the last known sink availability for the stream's group.
//! Illegal transitions are refused and logged, never applied.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::types::StreamType;

/// Lifecycle state of one telemetry stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamState {
    /// `initialize()` has not been called; records are dropped
    Uninitialized,
    /// Background probe running; records are buffered
    Initializing,
    /// Probe resolved at least once
    Ready { available: bool },
    /// A flush is in flight
    Flushing,
}

impl StreamState {
    /// Whether `from → to` is a legal transition
    pub const fn can_transition_to(self, to: StreamState) -> bool {
        matches!(
            (self, to),
            (StreamState::Uninitialized, StreamState::Initializing)
                | (StreamState::Initializing, StreamState::Ready { .. })
                | (StreamState::Ready { .. }, StreamState::Ready { .. })
                | (StreamState::Ready { .. }, StreamState::Flushing)
                | (StreamState::Flushing, StreamState::Ready { .. })
        )
    }

    pub const fn is_initialized(self) -> bool {
        !matches!(self, StreamState::Uninitialized)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Uninitialized => write!(f, "Uninitialized"),
            StreamState::Initializing => write!(f, "Initializing"),
            StreamState::Ready { available: true } => write!(f, "Ready (online)"),
            StreamState::Ready { available: false } => write!(f, "Ready (offline)"),
            StreamState::Flushing => write!(f, "Flushing"),
        }
    }
}

/// Refused transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: StreamState,
    pub to: StreamState,
}

/// Transition-checked state holder for one stream
#[derive(Debug)]
pub struct StreamStateMachine {
    stream: StreamType,
    state: Mutex<StreamState>,
}

impl StreamStateMachine {
    pub fn new(stream: StreamType) -> Self {
        Self {
            stream,
            state: Mutex::new(StreamState::Uninitialized),
        }
    }

    pub fn current(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `to` if legal from the current state
    pub fn transition(&self, to: StreamState) -> Result<StreamState, IllegalTransition> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *guard;
        if !from.can_transition_to(to) {
            warn!(stream = %self.stream, %from, %to, "Refused illegal stream state transition");
            return Err(IllegalTransition { from, to });
        }
        if from != to {
            debug!(stream = %self.stream, %from, %to, "Stream state changed");
        }
        *guard = to;
        Ok(from)
    }

    /// `Uninitialized → Initializing`. Returns false if already initialized.
    pub fn begin_initialize(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard != StreamState::Uninitialized {
            return false;
        }
        *guard = StreamState::Initializing;
        true
    }

    /// Record the latest availability. While a flush is in flight the
    /// flush's own outcome wins, so the update is deferred to `end_flush`.
    pub fn set_available(&self, available: bool) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            StreamState::Initializing | StreamState::Ready { .. } => {
                *guard = StreamState::Ready { available };
            }
            StreamState::Flushing => {}
            StreamState::Uninitialized => {
                warn!(stream = %self.stream, "Availability reported before initialize(), ignored");
            }
        }
    }

    /// `Ready → Flushing`. Returns false when the stream cannot flush now.
    pub fn try_begin_flush(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*guard, StreamState::Ready { .. }) {
            *guard = StreamState::Flushing;
            true
        } else {
            false
        }
    }

    /// `Flushing → Ready{available}`
    pub fn end_flush(&self, available: bool) {
        // Failure is already logged by transition()
        let _ = self.transition(StreamState::Ready { available });
    }

    pub fn is_available(&self) -> bool {
        matches!(self.current(), StreamState::Ready { available: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = StreamStateMachine::new(StreamType::Metric);
        assert_eq!(sm.current(), StreamState::Uninitialized);
        assert!(sm.begin_initialize());
        assert!(!sm.begin_initialize());
        sm.set_available(true);
        assert!(sm.is_available());
        assert!(sm.try_begin_flush());
        assert!(!sm.try_begin_flush());
        sm.end_flush(false);
        assert_eq!(sm.current(), StreamState::Ready { available: false });
    }

    #[test]
    fn test_illegal_transitions_refused() {
        let sm = StreamStateMachine::new(StreamType::Report);
        let err = sm.transition(StreamState::Flushing).unwrap_err();
        assert_eq!(err.from, StreamState::Uninitialized);
        assert_eq!(sm.current(), StreamState::Uninitialized);

        assert!(sm
            .transition(StreamState::Ready { available: true })
            .is_err());
        sm.transition(StreamState::Initializing).unwrap();
        assert!(sm.transition(StreamState::Uninitialized).is_err());
        assert!(sm.transition(StreamState::Flushing).is_err());
    }

    #[test]
    fn test_flush_refused_before_ready() {
        let sm = StreamStateMachine::new(StreamType::Alert);
        assert!(!sm.try_begin_flush());
        sm.begin_initialize();
        assert!(!sm.try_begin_flush());
    }

    #[test]
    fn test_availability_deferred_while_flushing() {
        let sm = StreamStateMachine::new(StreamType::Metric);
        sm.begin_initialize();
        sm.set_available(true);
        sm.try_begin_flush();
        sm.set_available(false);
        assert_eq!(sm.current(), StreamState::Flushing);
        sm.end_flush(true);
        assert!(sm.is_available());
    }

    #[test]
    fn test_set_available_before_initialize_ignored() {
        let sm = StreamStateMachine::new(StreamType::Metric);
        sm.set_available(true);
        assert_eq!(sm.current(), StreamState::Uninitialized);
    }
}
