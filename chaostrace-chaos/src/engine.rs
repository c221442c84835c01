//! Trigger evaluation and firing.
//!
//! The engine is a synchronous bus subscriber: event-backed and
//! probabilistic triggers are evaluated inline as each event is
//! appended, in script definition order. Schedule triggers are driven by
//! `tick`, which the run loop calls once a second; `tick` also re-rolls
//! probabilistic triggers (so they can fire on an idle run) and expires
//! active effects.

use crate::active::ActiveChaos;
use crate::script::{ChaosScript, EventCondition, Trigger, TriggerKind};
use chaostrace_core::{ChaosAction, ChaosError, ParsedStatement, RunContext};
use chaostrace_events::{EventBus, RunEvent, RunEventKind, RunEventPayload, Subscriber};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

struct TriggerState {
    def: Trigger,
    times_fired: u32,
    /// Matching events seen so far, for `after_count` gating.
    times_matched: u32,
    last_fired: Option<Instant>,
}

/// One engine per run. `Send + Sync`; registered on the run's bus.
pub struct ChaosEngine {
    ctx: RunContext,
    active: Arc<ActiveChaos>,
    start: Instant,
    triggers: Mutex<Vec<TriggerState>>,
}

impl ChaosEngine {
    pub fn new(script: ChaosScript, ctx: RunContext, active: Arc<ActiveChaos>) -> Self {
        Self {
            ctx,
            active,
            start: Instant::now(),
            triggers: Mutex::new(
                script
                    .triggers
                    .into_iter()
                    .map(|def| TriggerState {
                        def,
                        times_fired: 0,
                        times_matched: 0,
                        last_fired: None,
                    })
                    .collect(),
            ),
        }
    }

    pub fn active(&self) -> Arc<ActiveChaos> {
        self.active.clone()
    }

    /// Drive schedule and probabilistic triggers and expire active
    /// effects. Called on the run loop's 1s cadence.
    pub fn tick(&self, bus: &EventBus) {
        let now = Instant::now();
        self.active.purge(now);
        let elapsed = now.duration_since(self.start);

        let fired = {
            let mut rng = rand::rng();
            let mut triggers = self
                .triggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut fired = Vec::new();
            for state in triggers.iter_mut() {
                let due = match &state.def.kind {
                    // A schedule point fires once.
                    TriggerKind::Schedule { fire_at_seconds } => {
                        state.times_fired == 0 && elapsed.as_secs() >= *fire_at_seconds
                    }
                    TriggerKind::Probabilistic { probability } => rng.random_bool(*probability),
                    TriggerKind::Event(_) => false,
                };
                if due {
                    if let Some(record) = self.fire(state, None, now) {
                        fired.push(record);
                    }
                }
            }
            fired
        };
        self.publish(fired, bus);
    }

    /// Check limits, resolve templates, and enact. Counters are updated
    /// here, under the trigger lock; the event is published by the
    /// caller after the lock is dropped so re-entrant appends are safe.
    fn fire(
        &self,
        state: &mut TriggerState,
        statement: Option<&ParsedStatement>,
        now: Instant,
    ) -> Option<(String, u32, ChaosAction)> {
        if state.def.fire_limit > 0 && state.times_fired >= state.def.fire_limit {
            return None;
        }
        if state.def.cooldown_seconds > 0 {
            if let Some(last) = state.last_fired {
                if now.duration_since(last) < Duration::from_secs(state.def.cooldown_seconds) {
                    return None;
                }
            }
        }

        let action = match self.resolve(&state.def.name, &state.def.action, statement) {
            Ok(action) => action,
            Err(err) => {
                // Known-but-unavailable field: skip this firing, keep
                // the trigger armed, never abort the run.
                tracing::warn!(trigger = %state.def.name, error = %err, "firing skipped");
                return None;
            }
        };

        self.active.enact(&action, now);
        state.times_fired += 1;
        state.last_fired = Some(now);
        tracing::info!(
            trigger = %state.def.name,
            action = %action,
            times_fired = state.times_fired,
            "chaos trigger fired"
        );
        Some((state.def.name.clone(), state.times_fired, action))
    }

    fn publish(&self, fired: Vec<(String, u32, ChaosAction)>, bus: &EventBus) {
        for (trigger, times_fired, action) in fired {
            if let Err(err) = bus.append(RunEventPayload::ChaosTriggered {
                trigger,
                times_fired,
                action,
            }) {
                tracing::warn!(error = %err, "chaos event dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Template resolution
    // ------------------------------------------------------------------

    fn resolve(
        &self,
        trigger: &str,
        action: &ChaosAction,
        statement: Option<&ParsedStatement>,
    ) -> Result<ChaosAction, ChaosError> {
        let mut action = action.clone();
        match &mut action {
            ChaosAction::LockTable { table, .. } | ChaosAction::DropIndex { table, .. } => {
                *table = self.resolve_field(trigger, table, statement)?;
            }
            ChaosAction::RenameColumn {
                table,
                column,
                new_name,
            } => {
                *table = self.resolve_field(trigger, table, statement)?;
                *column = self.resolve_field(trigger, column, statement)?;
                *new_name = self.resolve_field(trigger, new_name, statement)?;
            }
            ChaosAction::ChangeColumnType {
                table,
                column,
                new_type,
            } => {
                *table = self.resolve_field(trigger, table, statement)?;
                *column = self.resolve_field(trigger, column, statement)?;
                *new_type = self.resolve_field(trigger, new_type, statement)?;
            }
            _ => {}
        }
        Ok(action)
    }

    fn resolve_field(
        &self,
        trigger: &str,
        text: &str,
        statement: Option<&ParsedStatement>,
    ) -> Result<String, ChaosError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            out.push_str(&rest[..open]);
            let field = &rest[open + 1..open + close];
            out.push_str(&self.resolve_ref(trigger, field, statement)?);
            rest = &rest[open + close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve_ref(
        &self,
        trigger: &str,
        field: &str,
        statement: Option<&ParsedStatement>,
    ) -> Result<String, ChaosError> {
        let unavailable = || ChaosError::TemplateUnavailable {
            trigger: trigger.to_string(),
            field: field.to_string(),
        };
        match field {
            "run.id" => Ok(self.ctx.run_id.to_string()),
            "run.scenario" => Ok(self.ctx.scenario.clone()),
            "event.operation" => statement
                .map(|s| s.operation.as_str().to_string())
                .ok_or_else(unavailable),
            _ => {
                let index = field
                    .strip_prefix("event.tables[")
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(unavailable)?;
                statement
                    .and_then(|s| s.tables.iter().nth(index))
                    .cloned()
                    .ok_or_else(unavailable)
            }
        }
    }
}

fn condition_matches(condition: &EventCondition, event: &RunEvent) -> bool {
    if condition.event != event.kind() {
        return false;
    }
    if condition.operation.is_none() && condition.table_pattern.is_none() {
        return true;
    }
    // Operation and table filters only ever apply to statement events.
    let RunEventPayload::SqlReceived { statement, .. } = &event.payload else {
        return false;
    };
    if let Some(operation) = condition.operation {
        if statement.operation != operation {
            return false;
        }
    }
    if let Some(pattern) = &condition.table_pattern {
        if !statement.tables.iter().any(|table| pattern.is_match(table)) {
            return false;
        }
    }
    true
}

impl Subscriber for ChaosEngine {
    fn on_event(&self, event: &RunEvent, bus: &EventBus) {
        let now = Instant::now();
        let statement = match &event.payload {
            RunEventPayload::SqlReceived { statement, .. } => Some(statement),
            _ => None,
        };

        let fired = {
            let mut rng = rand::rng();
            let mut triggers = self
                .triggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut fired = Vec::new();
            for state in triggers.iter_mut() {
                let gate = match &state.def.kind {
                    TriggerKind::Event(condition) => {
                        if !condition_matches(condition, event) {
                            continue;
                        }
                        Some((condition.after_count, condition.reset_after_fire))
                    }
                    // Independent coin flip per evaluated event. Chaos
                    // events are excluded so a firing cannot roll the
                    // dice on itself.
                    TriggerKind::Probabilistic { probability } => {
                        if event.kind() == RunEventKind::ChaosTriggered
                            || !rng.random_bool(*probability)
                        {
                            continue;
                        }
                        None
                    }
                    TriggerKind::Schedule { .. } => continue,
                };
                let mut reset_after_fire = false;
                if let Some((after_count, reset)) = gate {
                    state.times_matched += 1;
                    if state.times_matched < after_count {
                        continue;
                    }
                    reset_after_fire = reset;
                }
                if let Some(record) = self.fire(state, statement, now) {
                    if reset_after_fire {
                        state.times_matched = 0;
                    }
                    fired.push(record);
                }
            }
            fired
        };
        self.publish(fired, bus);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_core::new_id;
    use chaostrace_events::RunEventKind;
    use chaostrace_sql::classify;

    const SCRIPT: &str = r#"
name: test_script
triggers:
  - name: first_delete_lock
    on: { event: sql_received, operation: delete, table_pattern: "users" }
    action: { lock_table: { table: "{event.tables[0]}", duration_seconds: 30 } }
    fire_limit: 1
  - name: latency_at_90s
    at_seconds: 90
    action: { inject_latency: { min_ms: 100, max_ms: 100, duration_seconds: 60 } }
"#;

    fn setup(script: &str) -> (Arc<ChaosEngine>, Arc<EventBus>) {
        let script = ChaosScript::from_yaml(script).unwrap();
        let ctx = RunContext::new("test", Duration::from_secs(300));
        let bus = Arc::new(EventBus::new(ctx.run_id));
        let engine = Arc::new(ChaosEngine::new(
            script,
            ctx,
            Arc::new(ActiveChaos::new()),
        ));
        bus.subscribe(engine.clone());
        (engine, bus)
    }

    fn receive(bus: &EventBus, sql: &str) {
        let statement = classify(sql);
        bus.append(RunEventPayload::SqlReceived {
            statement_id: new_id(),
            connection_id: new_id(),
            risk: statement.risk_level(),
            statement,
        })
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_trigger_fires_and_locks() {
        let (engine, bus) = setup(SCRIPT);
        receive(&bus, "DELETE FROM users WHERE id = 1");

        let fired = bus.events_of_kind(RunEventKind::ChaosTriggered);
        assert_eq!(fired.len(), 1);
        let RunEventPayload::ChaosTriggered {
            trigger, action, ..
        } = &fired[0].payload
        else {
            panic!("wrong payload");
        };
        assert_eq!(trigger, "first_delete_lock");
        assert_eq!(
            action,
            &ChaosAction::LockTable {
                table: "users".to_string(),
                duration_seconds: 30,
            }
        );

        let stmt = classify("SELECT * FROM users");
        assert!(engine
            .active()
            .blocking_lock(&stmt, Instant::now())
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_limit_is_honored() {
        let (_engine, bus) = setup(SCRIPT);
        receive(&bus, "DELETE FROM users WHERE id = 1");
        receive(&bus, "DELETE FROM users WHERE id = 2");

        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_events_do_not_fire() {
        let (_engine, bus) = setup(SCRIPT);
        receive(&bus, "DELETE FROM orders WHERE id = 1");
        receive(&bus, "SELECT * FROM users");

        assert!(bus.events_of_kind(RunEventKind::ChaosTriggered).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_template_skips_without_consuming() {
        let yaml = r#"
name: x
triggers:
  - name: lock_first_table
    on: { event: sql_received }
    action: { lock_table: { table: "{event.tables[0]}", duration_seconds: 5 } }
    fire_limit: 1
"#;
        let (_engine, bus) = setup(yaml);
        // No tables on this statement: the firing is skipped.
        receive(&bus, "SELECT 1");
        assert!(bus.events_of_kind(RunEventKind::ChaosTriggered).is_empty());

        // Trigger is still armed for the next qualifying statement.
        receive(&bus, "SELECT * FROM users");
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_trigger_fires_once_after_offset() {
        let (engine, bus) = setup(SCRIPT);

        engine.tick(&bus);
        assert!(bus.events_of_kind(RunEventKind::ChaosTriggered).is_empty());

        tokio::time::advance(Duration::from_secs(91)).await;
        engine.tick(&bus);
        engine.tick(&bus);
        let fired = bus.events_of_kind(RunEventKind::ChaosTriggered);
        assert_eq!(fired.len(), 1);
        let RunEventPayload::ChaosTriggered { trigger, .. } = &fired[0].payload else {
            panic!("wrong payload");
        };
        assert_eq!(trigger, "latency_at_90s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_refire() {
        let yaml = r#"
name: x
triggers:
  - name: throttle
    on: { event: sql_received }
    action: simulate_timeout
    cooldown_seconds: 60
"#;
        let (_engine, bus) = setup(yaml);
        receive(&bus, "SELECT 1");
        receive(&bus, "SELECT 2");
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        receive(&bus, "SELECT 3");
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_count_defers_until_nth_match() {
        let yaml = r#"
name: x
triggers:
  - name: third_delete_lock
    on: { event: sql_received, operation: delete, table_pattern: "users", after_count: 3 }
    action: { lock_table: { table: "{event.tables[0]}", duration_seconds: 30 } }
    fire_limit: 1
"#;
        let (_engine, bus) = setup(yaml);
        receive(&bus, "DELETE FROM users WHERE id = 1");
        receive(&bus, "DELETE FROM users WHERE id = 2");
        assert!(bus.events_of_kind(RunEventKind::ChaosTriggered).is_empty());

        // Non-matching traffic does not advance the count.
        receive(&bus, "SELECT * FROM users");

        receive(&bus, "DELETE FROM users WHERE id = 3");
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_fire_requires_full_count_again() {
        let yaml = r#"
name: x
triggers:
  - name: every_second_delete
    on: { event: sql_received, operation: delete, after_count: 2, reset_after_fire: true }
    action: simulate_timeout
"#;
        let (_engine, bus) = setup(yaml);
        for n in 1..=6 {
            receive(&bus, &format!("DELETE FROM users WHERE id = {}", n));
        }
        // Fires on the 2nd, 4th, and 6th match.
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_reset_every_match_past_nth_fires() {
        let yaml = r#"
name: x
triggers:
  - name: from_second_delete
    on: { event: sql_received, operation: delete, after_count: 2 }
    action: simulate_timeout
"#;
        let (_engine, bus) = setup(yaml);
        for n in 1..=4 {
            receive(&bus, &format!("DELETE FROM users WHERE id = {}", n));
        }
        // Skips the 1st, then fires on the 2nd, 3rd, and 4th.
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probabilistic_certainty_fires_per_event() {
        let yaml = r#"
name: x
triggers:
  - name: always
    probability: 1.0
    action: { network_partition: { duration_seconds: 1 } }
"#;
        let (_engine, bus) = setup(yaml);
        receive(&bus, "SELECT 1");
        receive(&bus, "SELECT 2");
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probabilistic_certainty_fires_each_tick() {
        let yaml = r#"
name: x
triggers:
  - name: always
    probability: 1.0
    action: { network_partition: { duration_seconds: 1 } }
"#;
        let (engine, bus) = setup(yaml);
        engine.tick(&bus);
        engine.tick(&bus);
        assert_eq!(bus.events_of_kind(RunEventKind::ChaosTriggered).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scoped_templates_resolve() {
        let yaml = r#"
name: x
triggers:
  - name: scoped
    at_seconds: 0
    action: { lock_table: { table: "shadow_{run.scenario}", duration_seconds: 5 } }
"#;
        let (engine, bus) = setup(yaml);
        engine.tick(&bus);

        let stmt = classify("SELECT * FROM shadow_test");
        assert_eq!(
            engine.active().blocking_lock(&stmt, Instant::now()),
            Some("shadow_test".to_string())
        );
    }
}
