//! Shared fixtures for ChaosTrace tests: canned policy and chaos
//! documents, event-sequence builders, and proptest SQL generators.

use chaostrace_core::{new_id, PolicyDecision, RunId, Severity, Verdict};
use chaostrace_events::{EventBus, RunEvent, RunEventPayload};
use chaostrace_sql::classify;
use proptest::prelude::*;

/// A restrictive policy exercising every rule family.
pub const STRICT_POLICY: &str = r#"
name: strict
max_query_length: 10000
forbidden_patterns:
  - pattern: "(?i)DROP\\s+TABLE"
    severity: critical
    message: "DROP TABLE is forbidden"
  - pattern: "(?i)TRUNCATE"
    severity: error
    message: "TRUNCATE is forbidden"
table_restrictions:
  - table: users
    allowed_operations: [select, update, delete]
    require_where: true
    max_rows: 100
honeypot_tables: [admin_credentials]
"#;

/// A policy that allows everything.
pub const OPEN_POLICY: &str = "name: open\n";

/// A chaos script with one trigger of each condition kind.
pub const MIXED_CHAOS: &str = r#"
name: mixed
triggers:
  - name: first_delete_lock
    on: { event: sql_received, operation: delete, table_pattern: "users" }
    action: { lock_table: { table: "{event.tables[0]}", duration_seconds: 30 } }
    fire_limit: 1
  - name: latency_at_90s
    at_seconds: 90
    action: { inject_latency: { min_ms: 500, max_ms: 1500, duration_seconds: 60 } }
  - name: rare_jitter
    probability: 0.05
    action: { inject_latency: { min_ms: 1, max_ms: 1, duration_seconds: 1 } }
"#;

/// A chaos script that never fires anything.
pub const QUIET_CHAOS: &str = "name: quiet\n";

/// Build an ordered event snapshot from payloads, with real sequence
/// numbers assigned by a throwaway bus.
pub fn event_log(run_id: RunId, payloads: Vec<RunEventPayload>) -> Vec<RunEvent> {
    let bus = EventBus::new(run_id);
    for payload in payloads {
        bus.append(payload).expect("open bus");
    }
    bus.snapshot()
}

/// A SqlReceived payload for the given SQL text.
pub fn received(sql: &str) -> RunEventPayload {
    let statement = classify(sql);
    RunEventPayload::SqlReceived {
        statement_id: new_id(),
        connection_id: new_id(),
        risk: statement.risk_level(),
        statement,
    }
}

/// A PolicyDecision payload with the given verdict.
pub fn decided(verdict: Verdict, severity: Severity, honeypot: bool) -> RunEventPayload {
    RunEventPayload::PolicyDecision {
        decision: PolicyDecision {
            statement_id: new_id(),
            verdict,
            severity,
            reason: match verdict {
                Verdict::Allow => String::new(),
                _ => "rule matched".to_string(),
            },
            matched_rule: None,
            honeypot,
        },
    }
}

/// Identifier-ish strings for generated SQL.
pub fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,12}"
}

/// Well-formed single-table DML/query statements.
pub fn arb_statement() -> impl Strategy<Value = String> {
    (arb_identifier(), arb_identifier(), 0u32..1000).prop_flat_map(|(table, column, value)| {
        prop_oneof![
            Just(format!("SELECT {} FROM {}", column, table)),
            Just(format!(
                "SELECT * FROM {} WHERE {} = {} LIMIT 10",
                table, column, value
            )),
            Just(format!("INSERT INTO {} ({}) VALUES ({})", table, column, value)),
            Just(format!(
                "UPDATE {} SET {} = {} WHERE id = {}",
                table, column, value, value
            )),
            Just(format!("DELETE FROM {} WHERE {} = {}", table, column, value)),
            Just(format!("DROP TABLE {}", table)),
        ]
    })
}

/// Arbitrary bytes-as-text inputs, including junk, for classifier
/// robustness tests.
pub fn arb_sql_like_text() -> impl Strategy<Value = String> {
    prop_oneof![
        arb_statement(),
        ".*",
        Just(String::new()),
        Just("   -- only a comment".to_string()),
    ]
}
