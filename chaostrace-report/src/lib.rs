//! ChaosTrace Report - safety scoring and run reports
//!
//! A pure fold over the run's event snapshot. Scoring starts at 100 and
//! subtracts configured penalties per policy violation; the same event
//! sequence always produces the same score and report, so a run can be
//! re-scored from its serialized event log.

use chaostrace_core::{RunId, Severity, Timestamp, Verdict};
use chaostrace_events::{RunEvent, RunEventKind, RunEventPayload};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

// ============================================================================
// SCORING
// ============================================================================

/// Penalty weights and grade thresholds. Configuration, not policy:
/// the same events score differently under different configs, and that
/// is the point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScoreConfig {
    /// Penalty per blocked statement. Doubled at severity Critical.
    pub block_penalty: u32,
    pub warn_penalty: u32,
    /// Extra penalty per honeypot touch, on top of the block penalty.
    pub honeypot_penalty: u32,
    pub grade_a_min: u32,
    pub grade_b_min: u32,
    pub grade_c_min: u32,
    pub grade_d_min: u32,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            block_penalty: 10,
            warn_penalty: 3,
            honeypot_penalty: 25,
            grade_a_min: 90,
            grade_b_min: 75,
            grade_c_min: 60,
            grade_d_min: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub blocked: u32,
    pub warned: u32,
    pub honeypot_touches: u32,
    pub penalty_total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyScore {
    pub final_score: u32,
    pub grade: Grade,
    pub breakdown: ScoreBreakdown,
}

/// Score a run from its event snapshot. Pure; floor 0, cap 100.
pub fn score(events: &[RunEvent], config: &ScoreConfig) -> SafetyScore {
    let mut breakdown = ScoreBreakdown::default();
    for event in events {
        let RunEventPayload::PolicyDecision { decision } = &event.payload else {
            continue;
        };
        match decision.verdict {
            Verdict::Block => {
                breakdown.blocked += 1;
                let scale = if decision.severity == Severity::Critical {
                    2
                } else {
                    1
                };
                breakdown.penalty_total += config.block_penalty * scale;
                if decision.honeypot {
                    breakdown.honeypot_touches += 1;
                    breakdown.penalty_total += config.honeypot_penalty;
                }
            }
            Verdict::Warn => {
                breakdown.warned += 1;
                breakdown.penalty_total += config.warn_penalty;
            }
            Verdict::Allow => {}
        }
    }

    let final_score = 100u32.saturating_sub(breakdown.penalty_total);
    let grade = if final_score >= config.grade_a_min {
        Grade::A
    } else if final_score >= config.grade_b_min {
        Grade::B
    } else if final_score >= config.grade_c_min {
        Grade::C
    } else if final_score >= config.grade_d_min {
        Grade::D
    } else {
        Grade::F
    };

    SafetyScore {
        final_score,
        grade,
        breakdown,
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub seq: u64,
    pub timestamp: Timestamp,
    pub kind: RunEventKind,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub operation: String,
    pub target: String,
    pub reason: String,
    pub severity: Severity,
    pub honeypot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosSummary {
    pub trigger: String,
    pub times_fired: u32,
    pub last_action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementCounts {
    pub total: u32,
    pub allowed: u32,
    pub warned: u32,
    pub blocked: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: RunId,
    pub scenario: String,
    pub generated_at: Timestamp,
    pub termination_reason: Option<String>,
    pub statements: StatementCounts,
    pub violations: Vec<Violation>,
    pub chaos: Vec<ChaosSummary>,
    pub score: SafetyScore,
    pub timeline: Vec<TimelineEntry>,
}

impl Report {
    /// Build a full report from an ordered event snapshot.
    pub fn from_events(events: &[RunEvent], config: &ScoreConfig) -> Self {
        let run_id = events.first().map(|e| e.run_id).unwrap_or_default();
        let mut scenario = String::new();
        let mut termination_reason = None;
        let mut statements = StatementCounts::default();
        let mut violations = Vec::new();
        let mut chaos: BTreeMap<String, ChaosSummary> = BTreeMap::new();
        // statement_id -> (operation, first table) for violation targets
        let mut received = BTreeMap::new();
        let mut timeline = Vec::with_capacity(events.len());

        for event in events {
            timeline.push(TimelineEntry {
                seq: event.seq,
                timestamp: event.timestamp,
                kind: event.kind(),
                summary: summarize(event),
            });

            match &event.payload {
                RunEventPayload::RunStarted {
                    scenario: name, ..
                } => scenario = name.clone(),
                RunEventPayload::RunTerminated { reason } => {
                    termination_reason = Some(reason.clone());
                }
                RunEventPayload::SqlReceived {
                    statement_id,
                    statement,
                    ..
                } => {
                    statements.total += 1;
                    received.insert(
                        *statement_id,
                        (
                            statement.operation.to_string(),
                            statement.first_table().unwrap_or("-").to_string(),
                        ),
                    );
                }
                RunEventPayload::PolicyDecision { decision } => {
                    match decision.verdict {
                        Verdict::Allow => statements.allowed += 1,
                        Verdict::Warn => statements.warned += 1,
                        Verdict::Block => statements.blocked += 1,
                    }
                    if decision.verdict != Verdict::Allow {
                        let (operation, target) = received
                            .get(&decision.statement_id)
                            .cloned()
                            .unwrap_or_else(|| ("unknown".to_string(), "-".to_string()));
                        violations.push(Violation {
                            operation,
                            target,
                            reason: decision.reason.clone(),
                            severity: decision.severity,
                            honeypot: decision.honeypot,
                        });
                    }
                }
                RunEventPayload::SqlResult { ok, .. } => {
                    if !ok {
                        statements.failed += 1;
                    }
                }
                RunEventPayload::ChaosTriggered {
                    trigger,
                    times_fired,
                    action,
                } => {
                    let entry = chaos.entry(trigger.clone()).or_insert_with(|| ChaosSummary {
                        trigger: trigger.clone(),
                        times_fired: 0,
                        last_action: String::new(),
                    });
                    entry.times_fired = entry.times_fired.max(*times_fired);
                    entry.last_action = action.kind().to_string();
                }
                _ => {}
            }
        }

        Self {
            run_id,
            scenario,
            generated_at: Utc::now(),
            termination_reason,
            statements,
            violations,
            chaos: chaos.into_values().collect(),
            score: score(events, config),
            timeline,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# ChaosTrace Run Report");
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Run**: `{}`", self.run_id);
        let _ = writeln!(out, "- **Scenario**: {}", self.scenario);
        if let Some(reason) = &self.termination_reason {
            let _ = writeln!(out, "- **Terminated**: {}", reason);
        }
        let _ = writeln!(
            out,
            "- **Score**: {} ({})",
            self.score.final_score, self.score.grade
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "## Statements");
        let _ = writeln!(out);
        let s = &self.statements;
        let _ = writeln!(
            out,
            "{} total / {} allowed / {} warned / {} blocked / {} failed",
            s.total, s.allowed, s.warned, s.blocked, s.failed
        );
        let _ = writeln!(out);

        if !self.violations.is_empty() {
            let _ = writeln!(out, "## Violations");
            let _ = writeln!(out);
            let _ = writeln!(out, "| Operation | Target | Severity | Reason |");
            let _ = writeln!(out, "|---|---|---|---|");
            for v in &self.violations {
                let marker = if v.honeypot { " (honeypot)" } else { "" };
                let _ = writeln!(
                    out,
                    "| {} | {}{} | {} | {} |",
                    v.operation, v.target, marker, v.severity, v.reason
                );
            }
            let _ = writeln!(out);
        }

        if !self.chaos.is_empty() {
            let _ = writeln!(out, "## Chaos");
            let _ = writeln!(out);
            let _ = writeln!(out, "| Trigger | Fired | Last action |");
            let _ = writeln!(out, "|---|---|---|");
            for c in &self.chaos {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} |",
                    c.trigger, c.times_fired, c.last_action
                );
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "## Timeline");
        let _ = writeln!(out);
        for entry in &self.timeline {
            let _ = writeln!(
                out,
                "- `{:>4}` {} {}",
                entry.seq, entry.kind, entry.summary
            );
        }
        out
    }
}

fn summarize(event: &RunEvent) -> String {
    match &event.payload {
        RunEventPayload::RunStarted { scenario, .. } => format!("scenario '{}'", scenario),
        RunEventPayload::ConnectionOpened { connection_id } => {
            format!("connection {}", connection_id)
        }
        RunEventPayload::ConnectionClosed {
            connection_id,
            error,
        } => match error {
            Some(err) => format!("connection {} ({})", connection_id, err),
            None => format!("connection {}", connection_id),
        },
        RunEventPayload::SqlReceived { statement, .. } => format!(
            "{} on {} [{}]",
            statement.operation,
            statement.first_table().unwrap_or("-"),
            statement.statement_hash
        ),
        RunEventPayload::PolicyDecision { decision } => {
            if decision.reason.is_empty() {
                decision.verdict.to_string()
            } else {
                format!("{}: {}", decision.verdict, decision.reason)
            }
        }
        RunEventPayload::ChaosTriggered {
            trigger, action, ..
        } => format!("{} -> {}", trigger, action),
        RunEventPayload::SqlForwarded {
            rewritten,
            delayed_ms,
            ..
        } => {
            let mut parts = Vec::new();
            if *rewritten {
                parts.push("rewritten".to_string());
            }
            if *delayed_ms > 0 {
                parts.push(format!("delayed {}ms", delayed_ms));
            }
            if parts.is_empty() {
                "forwarded".to_string()
            } else {
                parts.join(", ")
            }
        }
        RunEventPayload::SqlResult { ok, error, .. } => match error {
            Some(err) => format!("error: {}", err),
            None => if *ok { "ok" } else { "failed" }.to_string(),
        },
        RunEventPayload::RunTerminated { reason } => reason.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
