//! ChaosTrace Core - Shared Data Types
//!
//! Pure data structures with no behavior beyond construction and
//! classification helpers. All other crates depend on this.
//! This crate contains ONLY data types - no business logic, no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub mod action;
pub mod error;

pub use action::ChaosAction;
pub use error::{
    BusError, ChaosError, ChaosTraceError, ChaosTraceResult, PolicyError, ProxyError,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Run identifier using UUIDv7 for timestamp-sortable IDs.
pub type RunId = Uuid;

/// Per-statement identifier, assigned when a statement is intercepted.
pub type StatementId = Uuid;

/// Per-connection identifier within a run.
pub type ConnectionId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Compute the statement hash used for dedup and event correlation:
/// first 16 hex chars of SHA-256 over the whitespace-normalized text.
pub fn statement_hash(sql: &str) -> String {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// ============================================================================
// SQL CLASSIFICATION ENUMS
// ============================================================================

/// Coarse operation kind of a SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "select",
            SqlOperation::Insert => "insert",
            SqlOperation::Update => "update",
            SqlOperation::Delete => "delete",
            SqlOperation::Ddl => "ddl",
            SqlOperation::Other => "other",
        }
    }

    /// Whether the operation writes data or schema.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            SqlOperation::Insert | SqlOperation::Update | SqlOperation::Delete | SqlOperation::Ddl
        )
    }
}

impl fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SqlOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "select" => Ok(SqlOperation::Select),
            "insert" => Ok(SqlOperation::Insert),
            "update" => Ok(SqlOperation::Update),
            "delete" => Ok(SqlOperation::Delete),
            "ddl" => Ok(SqlOperation::Ddl),
            "other" => Ok(SqlOperation::Other),
            other => Err(format!("unknown sql operation: {}", other)),
        }
    }
}

/// Fine-grained DDL kind, kept because policy patterns and risk
/// weighting distinguish DROP from CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlKind {
    Create,
    Alter,
    Drop,
    Truncate,
    Grant,
    Revoke,
}

impl DdlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlKind::Create => "create",
            DdlKind::Alter => "alter",
            DdlKind::Drop => "drop",
            DdlKind::Truncate => "truncate",
            DdlKind::Grant => "grant",
            DdlKind::Revoke => "revoke",
        }
    }
}

impl fmt::Display for DdlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Estimated row scope of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowScope {
    /// Affects at most one row (single-key equality)
    Single,
    /// Bounded by an explicit LIMIT
    Bounded,
    /// No bound at all (no WHERE on DML)
    Unbounded,
    /// Cannot be estimated
    Unknown,
}

impl RowScope {
    /// Conservative check used by row-ceiling restrictions:
    /// unknown scope is treated as unbounded.
    pub fn may_exceed(&self, _max_rows: u64) -> bool {
        matches!(self, RowScope::Unbounded | RowScope::Unknown)
    }
}

/// Intrinsic risk of a statement, independent of policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Escalate to the next level, saturating at Critical.
    pub fn escalate(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// PARSED STATEMENT
// ============================================================================

/// Normalized structural representation of a SQL statement.
///
/// Produced once per statement by the classifier, never mutated,
/// owned by the event that carries it. Table and column names are
/// stored lowercased and quote-stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedStatement {
    pub operation: SqlOperation,
    /// Set when `operation == Ddl`.
    pub ddl_kind: Option<DdlKind>,
    pub tables: BTreeSet<String>,
    pub columns: BTreeSet<String>,
    pub has_where: bool,
    pub has_limit: bool,
    pub row_scope: RowScope,
    pub raw_text: String,
    pub statement_hash: String,
    /// Set when classification failed; the statement is still forwarded
    /// downstream as `Other`.
    pub parse_error: Option<String>,
}

impl ParsedStatement {
    /// Fallback representation for text the classifier could not parse.
    /// Parsing failure must never itself block traffic.
    pub fn unparseable(raw_text: impl Into<String>, reason: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        Self {
            operation: SqlOperation::Other,
            ddl_kind: None,
            tables: BTreeSet::new(),
            columns: BTreeSet::new(),
            has_where: false,
            has_limit: false,
            row_scope: RowScope::Unknown,
            statement_hash: statement_hash(&raw_text),
            raw_text,
            parse_error: Some(reason.into()),
        }
    }

    /// First table in deterministic (sorted) order, if any.
    pub fn first_table(&self) -> Option<&str> {
        self.tables.iter().next().map(String::as_str)
    }

    pub fn touches_table(&self, table: &str) -> bool {
        let needle = table.to_ascii_lowercase();
        self.tables.contains(&needle)
    }

    /// Intrinsic risk from operation kind and structure, before any
    /// policy is consulted. Recorded on the SqlReceived event.
    pub fn risk_level(&self) -> RiskLevel {
        let base = match (self.operation, self.ddl_kind) {
            (SqlOperation::Ddl, Some(DdlKind::Drop | DdlKind::Truncate)) => RiskLevel::Critical,
            (SqlOperation::Ddl, Some(DdlKind::Alter | DdlKind::Grant | DdlKind::Revoke)) => {
                RiskLevel::High
            }
            (SqlOperation::Ddl, _) => RiskLevel::Medium,
            (SqlOperation::Delete, _) => RiskLevel::High,
            (SqlOperation::Update, _) => RiskLevel::Medium,
            (SqlOperation::Insert, _) => RiskLevel::Low,
            (SqlOperation::Select, _) => RiskLevel::Low,
            (SqlOperation::Other, _) => RiskLevel::Medium,
        };
        let unbounded_dml = matches!(self.operation, SqlOperation::Delete | SqlOperation::Update)
            && !self.has_where;
        if unbounded_dml {
            base.escalate()
        } else {
            base
        }
    }
}

// ============================================================================
// POLICY DECISION
// ============================================================================

/// Severity attached to a policy rule or decision, totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Per-statement decision: allow, warn, or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Warn,
    Block,
}

impl Verdict {
    pub fn is_block(&self) -> bool {
        matches!(self, Verdict::Block)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Allow => "allow",
            Verdict::Warn => "warn",
            Verdict::Block => "block",
        };
        write!(f, "{}", s)
    }
}

/// The Policy Engine's decision for one statement. One per statement,
/// appended to the event bus, never revised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub statement_id: StatementId,
    pub verdict: Verdict,
    pub severity: Severity,
    pub reason: String,
    pub matched_rule: Option<String>,
    /// Set when the statement touched a honeypot table. Flagged
    /// distinctly in the report: the touch itself is the critical
    /// signal, independent of the statement's intrinsic risk.
    pub honeypot: bool,
}

impl PolicyDecision {
    pub fn allow(statement_id: StatementId) -> Self {
        Self {
            statement_id,
            verdict: Verdict::Allow,
            severity: Severity::Info,
            reason: String::new(),
            matched_rule: None,
            honeypot: false,
        }
    }
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

/// Explicit per-run context passed to every component call.
/// Never ambient state; keeps runs isolated and testable in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub scenario: String,
    pub timeout: Duration,
    pub started_at: Timestamp,
}

impl RunContext {
    pub fn new(scenario: impl Into<String>, timeout: Duration) -> Self {
        Self {
            run_id: new_id(),
            scenario: scenario.into(),
            timeout,
            started_at: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
