//! Run lifecycle: one `RunHandle` per harness run.
//!
//! The handle owns the event bus, both engines, the shared fault state,
//! the per-run statement gate, and the cancellation channel. Exactly one
//! terminal event is appended per run, regardless of how many callers
//! race to terminate.

use chaostrace_chaos::{ActiveChaos, ChaosEngine, ChaosScript};
use chaostrace_core::RunContext;
use chaostrace_events::{EventBus, RunEventPayload};
use chaostrace_policy::PolicyEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};

pub struct RunHandle {
    pub ctx: RunContext,
    pub bus: Arc<EventBus>,
    pub policy: Arc<PolicyEngine>,
    pub active: Arc<ActiveChaos>,
    chaos: Arc<ChaosEngine>,
    /// Serializes classify -> SqlReceived -> PolicyDecision per run, so
    /// a statement's events are contiguous even across connections.
    stmt_gate: Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl RunHandle {
    pub fn new(ctx: RunContext, policy: PolicyEngine, script: ChaosScript) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(ctx.run_id));
        let active = Arc::new(ActiveChaos::new());
        let chaos = Arc::new(ChaosEngine::new(script, ctx.clone(), active.clone()));
        bus.subscribe(chaos.clone());
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            bus,
            policy: Arc::new(policy),
            active,
            chaos,
            stmt_gate: Mutex::new(()),
            cancel,
        })
    }

    /// Record the run start on the bus.
    pub fn record_started(&self, policy_name: &str, script_name: &str) {
        if let Err(err) = self.bus.append(RunEventPayload::RunStarted {
            scenario: self.ctx.scenario.clone(),
            policy: policy_name.to_string(),
            chaos_script: script_name.to_string(),
        }) {
            tracing::warn!(error = %err, "run start event dropped");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub async fn gate(&self) -> MutexGuard<'_, ()> {
        self.stmt_gate.lock().await
    }

    /// Drive schedule/probabilistic triggers and effect expiry until the
    /// run is cancelled.
    pub async fn run_ticker(self: Arc<Self>) {
        let mut cancelled = self.cancelled();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.chaos.tick(&self.bus),
                _ = cancelled.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    /// End the run: cancel workers, force-release all chaos effects,
    /// append the terminal event. Idempotent.
    pub fn terminate(&self, reason: &str) {
        let already = self.cancel.send_replace(true);
        if already {
            return;
        }
        self.active.release_all();
        match self.bus.close(reason) {
            Ok(Some(_)) => {
                tracing::info!(run_id = %self.ctx.run_id, reason, "run terminated");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "terminal event dropped"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_events::RunEventKind;
    use chaostrace_policy::PolicyDocument;
    use chaostrace_test_utils::{OPEN_POLICY, QUIET_CHAOS};

    fn handle() -> Arc<RunHandle> {
        let ctx = RunContext::new("test", Duration::from_secs(300));
        let policy = PolicyDocument::from_yaml(OPEN_POLICY).unwrap();
        let script = ChaosScript::from_yaml(QUIET_CHAOS).unwrap();
        RunHandle::new(ctx, policy, script)
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_appends_single_terminal_event() {
        let handle = handle();
        handle.record_started("open", "quiet");

        handle.terminate("timeout");
        handle.terminate("timeout");

        let events = handle.bus.snapshot();
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| e.kind() == RunEventKind::RunTerminated)
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_on_cancel() {
        let handle = handle();
        let ticker = tokio::spawn(handle.clone().run_ticker());
        tokio::time::advance(Duration::from_secs(3)).await;
        handle.terminate("done");
        ticker.await.unwrap();
    }
}
