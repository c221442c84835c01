//! Chaos script schema, loading, and load-time validation.
//!
//! Scripts are YAML. Every structural defect - a trigger with zero or
//! two conditions, a bad regex, an unknown template field - is caught
//! here, so a run that starts can always finish.

use chaostrace_core::{ChaosAction, ChaosError, SqlOperation};
use chaostrace_events::RunEventKind;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// RAW SCHEMA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScript {
    name: String,
    #[serde(default)]
    triggers: Vec<RawTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTrigger {
    name: String,

    /// Event condition. Exactly one of `on`, `at_seconds`, `probability`.
    #[serde(default)]
    on: Option<RawEventCondition>,

    /// Schedule offset from run start.
    #[serde(default)]
    at_seconds: Option<u64>,

    /// Uniform jitter added to `at_seconds`, sampled once at load.
    #[serde(default)]
    jitter_seconds: Option<u64>,

    /// Per-tick firing probability in (0, 1].
    #[serde(default)]
    probability: Option<f64>,

    action: ChaosAction,

    /// Maximum number of firings. 0 means unlimited.
    #[serde(default)]
    fire_limit: u32,

    #[serde(default)]
    cooldown_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEventCondition {
    event: RunEventKind,
    #[serde(default)]
    operation: Option<SqlOperation>,
    #[serde(default)]
    table_pattern: Option<String>,

    /// Fire only from the Nth matching event onward. 1 fires on the
    /// first match.
    #[serde(default = "default_after_count")]
    after_count: u32,

    /// Restart the occurrence count each time the trigger fires, so it
    /// fires on every Nth match instead of every match past the Nth.
    #[serde(default)]
    reset_after_fire: bool,
}

fn default_after_count() -> u32 {
    1
}

// ============================================================================
// COMPILED SCRIPT
// ============================================================================

/// Compiled event-match condition.
#[derive(Debug, Clone)]
pub struct EventCondition {
    pub event: RunEventKind,
    pub operation: Option<SqlOperation>,
    pub table_pattern: Option<Regex>,
    pub after_count: u32,
    pub reset_after_fire: bool,
}

/// When a trigger fires.
#[derive(Debug, Clone)]
pub enum TriggerKind {
    Event(EventCondition),
    /// Offset from run start; jitter is already folded in.
    Schedule { fire_at_seconds: u64 },
    Probabilistic { probability: f64 },
}

/// One validated trigger.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub kind: TriggerKind,
    pub action: ChaosAction,
    pub fire_limit: u32,
    pub cooldown_seconds: u64,
}

/// A validated chaos script.
#[derive(Debug, Clone)]
pub struct ChaosScript {
    pub name: String,
    pub triggers: Vec<Trigger>,
}

impl ChaosScript {
    pub fn from_yaml(source: &str) -> Result<Self, ChaosError> {
        let raw: RawScript =
            serde_yaml::from_str(source).map_err(|err| ChaosError::ParseFailed {
                reason: err.to_string(),
            })?;
        Self::compile(raw)
    }

    fn compile(raw: RawScript) -> Result<Self, ChaosError> {
        if raw.name.trim().is_empty() {
            return Err(ChaosError::MissingName);
        }

        let mut seen = BTreeSet::new();
        let mut triggers = Vec::with_capacity(raw.triggers.len());
        for entry in raw.triggers {
            if entry.name.trim().is_empty() {
                return Err(ChaosError::InvalidTrigger {
                    trigger: entry.name,
                    reason: "empty trigger name".to_string(),
                });
            }
            if !seen.insert(entry.name.clone()) {
                return Err(ChaosError::InvalidTrigger {
                    trigger: entry.name,
                    reason: "duplicate trigger name".to_string(),
                });
            }
            triggers.push(compile_trigger(entry)?);
        }

        Ok(Self {
            name: raw.name,
            triggers,
        })
    }
}

fn compile_trigger(raw: RawTrigger) -> Result<Trigger, ChaosError> {
    let conditions = [
        raw.on.is_some(),
        raw.at_seconds.is_some(),
        raw.probability.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if conditions != 1 {
        return Err(ChaosError::InvalidTrigger {
            trigger: raw.name,
            reason: "exactly one of `on`, `at_seconds`, `probability` is required".to_string(),
        });
    }
    if raw.jitter_seconds.is_some() && raw.at_seconds.is_none() {
        return Err(ChaosError::InvalidTrigger {
            trigger: raw.name,
            reason: "`jitter_seconds` requires `at_seconds`".to_string(),
        });
    }

    let kind = if let Some(on) = raw.on {
        let table_pattern = match on.table_pattern {
            Some(pattern) => Some(Regex::new(&pattern).map_err(|err| {
                ChaosError::InvalidTrigger {
                    trigger: raw.name.clone(),
                    reason: format!("bad table_pattern: {}", err),
                }
            })?),
            None => None,
        };
        if on.after_count == 0 {
            return Err(ChaosError::InvalidTrigger {
                trigger: raw.name,
                reason: "`after_count` must be at least 1".to_string(),
            });
        }
        TriggerKind::Event(EventCondition {
            event: on.event,
            operation: on.operation,
            table_pattern,
            after_count: on.after_count,
            reset_after_fire: on.reset_after_fire,
        })
    } else if let Some(at_seconds) = raw.at_seconds {
        let jitter = match raw.jitter_seconds {
            Some(0) | None => 0,
            Some(window) => rand::rng().random_range(0..=window),
        };
        TriggerKind::Schedule {
            fire_at_seconds: at_seconds + jitter,
        }
    } else {
        let probability = raw.probability.unwrap_or(0.0);
        if !(probability > 0.0 && probability <= 1.0) {
            return Err(ChaosError::InvalidTrigger {
                trigger: raw.name,
                reason: format!("probability {} is outside (0, 1]", probability),
            });
        }
        TriggerKind::Probabilistic { probability }
    };

    validate_action(&raw.name, &kind, &raw.action)?;

    if let ChaosAction::InjectLatency { min_ms, max_ms, .. } = raw.action {
        if min_ms > max_ms {
            return Err(ChaosError::InvalidTrigger {
                trigger: raw.name,
                reason: format!("latency range {}..{} is inverted", min_ms, max_ms),
            });
        }
    }

    Ok(Trigger {
        name: raw.name,
        kind,
        action: raw.action,
        fire_limit: raw.fire_limit,
        cooldown_seconds: raw.cooldown_seconds,
    })
}

// ============================================================================
// TEMPLATES
// ============================================================================

/// Extract `{...}` references from a templated string field.
pub(crate) fn template_refs(text: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        refs.push(&rest[open + 1..open + close]);
        rest = &rest[open + close + 1..];
    }
    refs
}

fn known_template(field: &str) -> bool {
    if field == "event.operation" || field == "run.id" || field == "run.scenario" {
        return true;
    }
    // event.tables[N]
    if let Some(index) = field
        .strip_prefix("event.tables[")
        .and_then(|s| s.strip_suffix(']'))
    {
        return index.parse::<usize>().is_ok();
    }
    false
}

fn templated_fields(action: &ChaosAction) -> Vec<&str> {
    match action {
        ChaosAction::LockTable { table, .. } | ChaosAction::DropIndex { table, .. } => {
            vec![table]
        }
        ChaosAction::RenameColumn {
            table,
            column,
            new_name,
        } => vec![table, column, new_name],
        ChaosAction::ChangeColumnType {
            table,
            column,
            new_type,
        } => vec![table, column, new_type],
        _ => Vec::new(),
    }
}

fn validate_action(
    trigger: &str,
    kind: &TriggerKind,
    action: &ChaosAction,
) -> Result<(), ChaosError> {
    let event_backed = matches!(kind, TriggerKind::Event(_));
    for field in templated_fields(action) {
        for reference in template_refs(field) {
            if !known_template(reference) {
                return Err(ChaosError::UnknownTemplateField {
                    trigger: trigger.to_string(),
                    field: reference.to_string(),
                });
            }
            if reference.starts_with("event.") && !event_backed {
                return Err(ChaosError::InvalidTrigger {
                    trigger: trigger.to_string(),
                    reason: format!(
                        "template {{{}}} needs an event-backed trigger",
                        reference
                    ),
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
