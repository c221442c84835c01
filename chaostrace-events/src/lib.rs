//! ChaosTrace Events - the per-run Event Bus
//!
//! An append-only, totally ordered log of typed run events. The bus is
//! the single source of truth for the eventual report: sequence numbers
//! are strictly increasing and gap-free per run, and append order is the
//! authoritative timeline used for scoring.
//!
//! Reactive consumers (the chaos engine) register as subscribers and are
//! invoked synchronously in append order by the appending thread, after
//! the event is committed to the log. Subscribers may re-enter the bus
//! to append follow-up events; those receive later sequence numbers.

use chaostrace_core::{
    BusError, ChaosAction, ConnectionId, ParsedStatement, PolicyDecision, RiskLevel, RunId,
    StatementId, Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

// ============================================================================
// EVENT KINDS AND PAYLOADS
// ============================================================================

/// Discriminator for run event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    ConnectionOpened,
    ConnectionClosed,
    SqlReceived,
    PolicyDecision,
    ChaosTriggered,
    SqlForwarded,
    SqlResult,
    RunTerminated,
}

impl fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunEventKind::RunStarted => "run_started",
            RunEventKind::ConnectionOpened => "connection_opened",
            RunEventKind::ConnectionClosed => "connection_closed",
            RunEventKind::SqlReceived => "sql_received",
            RunEventKind::PolicyDecision => "policy_decision",
            RunEventKind::ChaosTriggered => "chaos_triggered",
            RunEventKind::SqlForwarded => "sql_forwarded",
            RunEventKind::SqlResult => "sql_result",
            RunEventKind::RunTerminated => "run_terminated",
        };
        write!(f, "{}", s)
    }
}

/// Typed payload per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventPayload {
    RunStarted {
        scenario: String,
        policy: String,
        chaos_script: String,
    },
    ConnectionOpened {
        connection_id: ConnectionId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
        error: Option<String>,
    },
    SqlReceived {
        statement_id: StatementId,
        connection_id: ConnectionId,
        statement: ParsedStatement,
        risk: RiskLevel,
    },
    PolicyDecision {
        decision: PolicyDecision,
    },
    ChaosTriggered {
        trigger: String,
        times_fired: u32,
        action: ChaosAction,
    },
    SqlForwarded {
        statement_id: StatementId,
        /// Set when an active schema mutation rewrote the text.
        rewritten: bool,
        delayed_ms: u64,
    },
    SqlResult {
        statement_id: StatementId,
        ok: bool,
        error: Option<String>,
    },
    RunTerminated {
        reason: String,
    },
}

impl RunEventPayload {
    pub fn kind(&self) -> RunEventKind {
        match self {
            RunEventPayload::RunStarted { .. } => RunEventKind::RunStarted,
            RunEventPayload::ConnectionOpened { .. } => RunEventKind::ConnectionOpened,
            RunEventPayload::ConnectionClosed { .. } => RunEventKind::ConnectionClosed,
            RunEventPayload::SqlReceived { .. } => RunEventKind::SqlReceived,
            RunEventPayload::PolicyDecision { .. } => RunEventKind::PolicyDecision,
            RunEventPayload::ChaosTriggered { .. } => RunEventKind::ChaosTriggered,
            RunEventPayload::SqlForwarded { .. } => RunEventKind::SqlForwarded,
            RunEventPayload::SqlResult { .. } => RunEventKind::SqlResult,
            RunEventPayload::RunTerminated { .. } => RunEventKind::RunTerminated,
        }
    }
}

/// One committed event. Owned by the bus; everything else holds clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Strictly increasing, gap-free per run. The authoritative timeline.
    pub seq: u64,
    pub run_id: RunId,
    pub timestamp: Timestamp,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn kind(&self) -> RunEventKind {
        self.payload.kind()
    }
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

/// Synchronous bus subscriber, invoked in append order.
///
/// Callbacks run on the appending thread after the event is committed,
/// outside the log lock, so a subscriber may append follow-up events.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &RunEvent, bus: &EventBus);
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// The per-run event bus.
pub struct EventBus {
    run_id: RunId,
    log: Mutex<BusLog>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

struct BusLog {
    next_seq: u64,
    events: Vec<RunEvent>,
    closed: bool,
}

impl EventBus {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            log: Mutex::new(BusLog {
                next_seq: 0,
                events: Vec::new(),
                closed: false,
            }),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Register a subscriber. Registration happens at run start, before
    /// any statement traffic.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
    }

    /// Append a payload, assigning the next sequence number and a UTC
    /// timestamp, then notify subscribers in registration order.
    ///
    /// Returns a clone of the committed event.
    pub fn append(&self, payload: RunEventPayload) -> Result<RunEvent, BusError> {
        let event = {
            let mut log = self.log.lock().map_err(|_| BusError::LockPoisoned)?;
            if log.closed {
                return Err(BusError::Closed {
                    run_id: self.run_id,
                });
            }
            let event = RunEvent {
                seq: log.next_seq,
                run_id: self.run_id,
                timestamp: Utc::now(),
                payload,
            };
            log.next_seq += 1;
            log.events.push(event.clone());
            event
        };

        tracing::debug!(
            seq = event.seq,
            kind = %event.kind(),
            run_id = %self.run_id,
            "event appended"
        );

        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for subscriber in subscribers {
            subscriber.on_event(&event, self);
        }

        Ok(event)
    }

    /// Append the terminal event and refuse further appends.
    /// Idempotent: only the first close appends `RunTerminated`.
    pub fn close(&self, reason: impl Into<String>) -> Result<Option<RunEvent>, BusError> {
        let event = {
            let mut log = self.log.lock().map_err(|_| BusError::LockPoisoned)?;
            if log.closed {
                return Ok(None);
            }
            let event = RunEvent {
                seq: log.next_seq,
                run_id: self.run_id,
                timestamp: Utc::now(),
                payload: RunEventPayload::RunTerminated {
                    reason: reason.into(),
                },
            };
            log.next_seq += 1;
            log.events.push(event.clone());
            log.closed = true;
            event
        };
        tracing::info!(run_id = %self.run_id, seq = event.seq, "run terminated");
        Ok(Some(event))
    }

    pub fn is_closed(&self) -> bool {
        self.log
            .lock()
            .map(|log| log.closed)
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered clone of the full log, for scoring and reporting.
    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.log
            .lock()
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    /// Events of one kind, in order.
    pub fn events_of_kind(&self, kind: RunEventKind) -> Vec<RunEvent> {
        self.snapshot()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }
}

/// Check that a snapshot's sequence numbers are strictly increasing
/// with no gaps, starting at zero. Used by tests and the report.
pub fn is_gap_free(events: &[RunEvent]) -> bool {
    events
        .iter()
        .enumerate()
        .all(|(index, event)| event.seq == index as u64)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_core::new_id;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started() -> RunEventPayload {
        RunEventPayload::RunStarted {
            scenario: "s".to_string(),
            policy: "p".to_string(),
            chaos_script: "c".to_string(),
        }
    }

    #[test]
    fn test_sequence_is_gap_free() {
        let bus = EventBus::new(new_id());
        for _ in 0..5 {
            bus.append(started()).unwrap();
        }
        let events = bus.snapshot();
        assert_eq!(events.len(), 5);
        assert!(is_gap_free(&events));
    }

    #[test]
    fn test_close_is_idempotent_and_terminal() {
        let bus = EventBus::new(new_id());
        bus.append(started()).unwrap();

        let first = bus.close("timeout").unwrap();
        assert!(first.is_some());
        let second = bus.close("timeout").unwrap();
        assert!(second.is_none());

        assert!(matches!(
            bus.append(started()),
            Err(BusError::Closed { .. })
        ));

        let terminated = bus.events_of_kind(RunEventKind::RunTerminated);
        assert_eq!(terminated.len(), 1);
        assert!(is_gap_free(&bus.snapshot()));
    }

    #[test]
    fn test_subscriber_invoked_in_append_order() {
        struct Counter(AtomicUsize);
        impl Subscriber for Counter {
            fn on_event(&self, _event: &RunEvent, _bus: &EventBus) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = EventBus::new(new_id());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe(counter.clone());

        bus.append(started()).unwrap();
        bus.append(started()).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscriber_may_reenter_bus() {
        struct Echo;
        impl Subscriber for Echo {
            fn on_event(&self, event: &RunEvent, bus: &EventBus) {
                if matches!(event.payload, RunEventPayload::SqlReceived { .. }) {
                    bus.append(RunEventPayload::ChaosTriggered {
                        trigger: "echo".to_string(),
                        times_fired: 1,
                        action: ChaosAction::SimulateTimeout,
                    })
                    .unwrap();
                }
            }
        }

        let bus = EventBus::new(new_id());
        bus.subscribe(Arc::new(Echo));

        let stmt = ParsedStatement::unparseable("x", "test");
        bus.append(RunEventPayload::SqlReceived {
            statement_id: new_id(),
            connection_id: new_id(),
            risk: stmt.risk_level(),
            statement: stmt,
        })
        .unwrap();

        let events = bus.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), RunEventKind::SqlReceived);
        assert_eq!(events[1].kind(), RunEventKind::ChaosTriggered);
        assert!(is_gap_free(&events));
    }

    #[test]
    fn test_event_json_round_trip() {
        let bus = EventBus::new(new_id());
        let statement = chaostrace_sql::classify("DELETE FROM users WHERE id = 1");
        let event = bus
            .append(RunEventPayload::SqlReceived {
                statement_id: new_id(),
                connection_id: new_id(),
                risk: statement.risk_level(),
                statement,
            })
            .unwrap();

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("sql_received"));
        let back: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_events_of_kind_filters_in_order() {
        let bus = EventBus::new(new_id());
        bus.append(started()).unwrap();
        bus.append(RunEventPayload::ConnectionOpened {
            connection_id: new_id(),
        })
        .unwrap();
        bus.append(started()).unwrap();

        let starts = bus.events_of_kind(RunEventKind::RunStarted);
        assert_eq!(starts.len(), 2);
        assert!(starts[0].seq < starts[1].seq);
    }
}
