//! ChaosTrace Policy - declarative SQL safety policies
//!
//! A policy is a YAML document of forbidden patterns, per-table
//! restrictions (operations, WHERE requirement, row ceiling, column
//! lists), and honeypot tables/columns. Documents are validated and their
//! regexes compiled at load; any defect is a startup failure and the run
//! never begins. Evaluation is pure: one `PolicyDecision` per statement,
//! no I/O, no clock.

use chaostrace_core::{
    ParsedStatement, PolicyDecision, PolicyError, RunContext, Severity, SqlOperation, StatementId,
    Verdict,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// DOCUMENT SCHEMA
// ============================================================================

/// Raw YAML schema. Unknown fields are rejected so a typo in a policy
/// file fails loudly at load instead of silently weakening the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    pub name: String,

    /// Maximum statement length in bytes. 0 means unlimited.
    #[serde(default)]
    pub max_query_length: usize,

    #[serde(default)]
    pub forbidden_patterns: Vec<ForbiddenPattern>,

    #[serde(default)]
    pub table_restrictions: Vec<TableRestriction>,

    /// Tables that must never be touched by any operation, including
    /// SELECT. A match always blocks with severity Critical.
    #[serde(default)]
    pub honeypot_tables: Vec<String>,

    /// Columns that must never be referenced, in any table. Same
    /// semantics as honeypot tables.
    #[serde(default)]
    pub honeypot_columns: Vec<String>,

    /// When set, Warning-severity pattern matches block instead of warn.
    #[serde(default)]
    pub warn_blocks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForbiddenPattern {
    pub pattern: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableRestriction {
    /// Table name, `*` wildcards allowed (e.g. `audit_*`).
    pub table: String,

    #[serde(default)]
    pub allowed_operations: Vec<SqlOperation>,

    #[serde(default)]
    pub require_where: bool,

    /// Upper bound on rows a write may affect. A statement whose row
    /// scope cannot be bounded is treated as exceeding any limit.
    #[serde(default)]
    pub max_rows: Option<u64>,

    /// Columns a write may never reference on this table.
    #[serde(default)]
    pub forbidden_columns: Vec<String>,

    /// When set, a write may only reference these columns.
    #[serde(default)]
    pub allowed_columns: Option<Vec<String>>,
}

impl PolicyDocument {
    /// Parse and validate a YAML policy. Every regex is compiled here so
    /// a bad pattern is a load failure, never a mid-run surprise.
    pub fn from_yaml(source: &str) -> Result<PolicyEngine, PolicyError> {
        let doc: PolicyDocument =
            serde_yaml::from_str(source).map_err(|err| PolicyError::ParseFailed {
                reason: err.to_string(),
            })?;
        PolicyEngine::compile(doc)
    }
}

// ============================================================================
// COMPILED ENGINE
// ============================================================================

#[derive(Debug)]
struct CompiledPattern {
    regex: Regex,
    severity: Severity,
    message: String,
    source: String,
}

#[derive(Debug)]
struct CompiledRestriction {
    matcher: TableMatcher,
    table: String,
    allowed_operations: Vec<SqlOperation>,
    require_where: bool,
    max_rows: Option<u64>,
    forbidden_columns: Vec<String>,
    allowed_columns: Option<Vec<String>>,
}

/// Table name matcher supporting `*` wildcards. Matching is always
/// against the lowercased name the classifier extracted.
#[derive(Debug)]
enum TableMatcher {
    Exact(String),
    Wildcard(Regex),
}

impl TableMatcher {
    fn compile(pattern: &str) -> Result<Self, PolicyError> {
        let lowered = pattern.to_ascii_lowercase();
        if !lowered.contains('*') {
            return Ok(TableMatcher::Exact(lowered));
        }
        let mut regex_src = String::from("^");
        for ch in lowered.chars() {
            if ch == '*' {
                regex_src.push_str(".*");
            } else {
                regex_src.push_str(&regex::escape(&ch.to_string()));
            }
        }
        regex_src.push('$');
        let regex = Regex::new(&regex_src).map_err(|err| PolicyError::InvalidRestriction {
            table: pattern.to_string(),
            reason: err.to_string(),
        })?;
        Ok(TableMatcher::Wildcard(regex))
    }

    fn matches(&self, table: &str) -> bool {
        match self {
            TableMatcher::Exact(name) => name == table,
            TableMatcher::Wildcard(regex) => regex.is_match(table),
        }
    }
}

/// A validated policy, ready to evaluate statements. `Send + Sync`;
/// evaluation takes `&self`, so one engine serves all connections.
#[derive(Debug)]
pub struct PolicyEngine {
    name: String,
    max_query_length: usize,
    patterns: Vec<CompiledPattern>,
    restrictions: Vec<CompiledRestriction>,
    honeypot_tables: Vec<TableMatcher>,
    honeypot_columns: Vec<TableMatcher>,
    warn_blocks: bool,
}

fn lowercase_all(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| name.to_ascii_lowercase())
        .collect()
}

impl PolicyEngine {
    fn compile(doc: PolicyDocument) -> Result<Self, PolicyError> {
        if doc.name.trim().is_empty() {
            return Err(PolicyError::MissingName);
        }

        let mut patterns = Vec::with_capacity(doc.forbidden_patterns.len());
        for entry in doc.forbidden_patterns {
            let regex = Regex::new(&entry.pattern).map_err(|err| PolicyError::InvalidPattern {
                pattern: entry.pattern.clone(),
                reason: err.to_string(),
            })?;
            patterns.push(CompiledPattern {
                regex,
                severity: entry.severity,
                message: entry.message,
                source: entry.pattern,
            });
        }

        let mut restrictions = Vec::with_capacity(doc.table_restrictions.len());
        for entry in doc.table_restrictions {
            if entry.table.trim().is_empty() {
                return Err(PolicyError::InvalidRestriction {
                    table: entry.table,
                    reason: "empty table name".to_string(),
                });
            }
            restrictions.push(CompiledRestriction {
                matcher: TableMatcher::compile(&entry.table)?,
                table: entry.table,
                allowed_operations: entry.allowed_operations,
                require_where: entry.require_where,
                max_rows: entry.max_rows,
                // Column names arrive from the classifier lowercased.
                forbidden_columns: lowercase_all(entry.forbidden_columns),
                allowed_columns: entry.allowed_columns.map(lowercase_all),
            });
        }

        let mut honeypot_tables = Vec::with_capacity(doc.honeypot_tables.len());
        for table in &doc.honeypot_tables {
            honeypot_tables.push(TableMatcher::compile(table)?);
        }
        let mut honeypot_columns = Vec::with_capacity(doc.honeypot_columns.len());
        for column in &doc.honeypot_columns {
            honeypot_columns.push(TableMatcher::compile(column)?);
        }

        Ok(Self {
            name: doc.name,
            max_query_length: doc.max_query_length,
            patterns,
            restrictions,
            honeypot_tables,
            honeypot_columns,
            warn_blocks: doc.warn_blocks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate one classified statement. Check order is fixed:
    /// honeypot tables, honeypot columns, forbidden patterns (document
    /// order, first match wins), table restrictions (operations, WHERE,
    /// row ceiling, column lists), then the length limit. Exactly one
    /// decision comes back, carrying the caller's statement id; the
    /// default is Allow.
    pub fn evaluate(
        &self,
        statement_id: StatementId,
        statement: &ParsedStatement,
        ctx: &RunContext,
    ) -> PolicyDecision {
        // Honeypot touch blocks unconditionally, SELECT included.
        for table in &statement.tables {
            if self.honeypot_tables.iter().any(|m| m.matches(table)) {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    table = %table,
                    "honeypot table touched"
                );
                return PolicyDecision {
                    statement_id,
                    verdict: Verdict::Block,
                    severity: Severity::Critical,
                    reason: format!("statement touches honeypot table '{}'", table),
                    matched_rule: Some(format!("honeypot:{}", table)),
                    honeypot: true,
                };
            }
        }
        for column in &statement.columns {
            if self.honeypot_columns.iter().any(|m| m.matches(column)) {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    column = %column,
                    "honeypot column touched"
                );
                return PolicyDecision {
                    statement_id,
                    verdict: Verdict::Block,
                    severity: Severity::Critical,
                    reason: format!("statement touches honeypot column '{}'", column),
                    matched_rule: Some(format!("honeypot_column:{}", column)),
                    honeypot: true,
                };
            }
        }

        for pattern in &self.patterns {
            if pattern.regex.is_match(&statement.raw_text) {
                let blocks = pattern.severity >= Severity::Error
                    || (self.warn_blocks && pattern.severity == Severity::Warning);
                return PolicyDecision {
                    statement_id,
                    verdict: if blocks { Verdict::Block } else { Verdict::Warn },
                    severity: pattern.severity,
                    reason: pattern.message.clone(),
                    matched_rule: Some(pattern.source.clone()),
                    honeypot: false,
                };
            }
        }

        for restriction in &self.restrictions {
            let touched = statement
                .tables
                .iter()
                .find(|table| restriction.matcher.matches(table));
            let Some(table) = touched else {
                continue;
            };

            if !restriction.allowed_operations.is_empty()
                && !restriction.allowed_operations.contains(&statement.operation)
            {
                return PolicyDecision {
                    statement_id,
                    verdict: Verdict::Block,
                    severity: Severity::Error,
                    reason: format!(
                        "{} is not permitted on table '{}'",
                        statement.operation, table
                    ),
                    matched_rule: Some(format!("table:{}", restriction.table)),
                    honeypot: false,
                };
            }

            if restriction.require_where && statement.operation.is_write() && !statement.has_where {
                return PolicyDecision {
                    statement_id,
                    verdict: Verdict::Block,
                    severity: Severity::Error,
                    reason: format!(
                        "{} on table '{}' requires a WHERE clause",
                        statement.operation, table
                    ),
                    matched_rule: Some(format!("table:{}", restriction.table)),
                    honeypot: false,
                };
            }

            if let Some(max_rows) = restriction.max_rows {
                if statement.operation.is_write() && statement.row_scope.may_exceed(max_rows) {
                    return PolicyDecision {
                        statement_id,
                        verdict: Verdict::Block,
                        severity: Severity::Error,
                        reason: format!(
                            "{} on table '{}' may affect more than {} rows",
                            statement.operation, table, max_rows
                        ),
                        matched_rule: Some(format!("table:{}", restriction.table)),
                        honeypot: false,
                    };
                }
            }

            if statement.operation.is_write() {
                let forbidden = statement
                    .columns
                    .iter()
                    .find(|column| restriction.forbidden_columns.iter().any(|f| f == *column));
                if let Some(column) = forbidden {
                    return PolicyDecision {
                        statement_id,
                        verdict: Verdict::Block,
                        severity: Severity::Error,
                        reason: format!(
                            "column '{}' on table '{}' may not be written",
                            column, table
                        ),
                        matched_rule: Some(format!("forbidden_column:{}", column)),
                        honeypot: false,
                    };
                }

                if let Some(allowed) = &restriction.allowed_columns {
                    let outside = statement
                        .columns
                        .iter()
                        .find(|column| !allowed.iter().any(|a| a == *column));
                    if let Some(column) = outside {
                        return PolicyDecision {
                            statement_id,
                            verdict: Verdict::Block,
                            severity: Severity::Error,
                            reason: format!(
                                "column '{}' is not in the allowed set for table '{}'",
                                column, table
                            ),
                            matched_rule: Some(format!("not_allowed_column:{}", column)),
                            honeypot: false,
                        };
                    }
                }
            }
        }

        if self.max_query_length > 0 && statement.raw_text.len() > self.max_query_length {
            return PolicyDecision {
                statement_id,
                verdict: Verdict::Block,
                severity: Severity::Warning,
                reason: format!(
                    "statement length {} exceeds limit {}",
                    statement.raw_text.len(),
                    self.max_query_length
                ),
                matched_rule: Some("max_query_length".to_string()),
                honeypot: false,
            };
        }

        PolicyDecision::allow(statement_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
