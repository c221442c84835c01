//! Error types for ChaosTrace operations.
//!
//! Only configuration-load failures are run-fatal. Nothing in the policy
//! or chaos engine may abort a running test; mid-run failures degrade to
//! recorded events.

use crate::StatementId;
use thiserror::Error;
use uuid::Uuid;

/// Policy configuration errors. Fatal at run start - the run never begins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Policy document parse failed: {reason}")]
    ParseFailed { reason: String },

    #[error("Invalid forbidden pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid table restriction for {table:?}: {reason}")]
    InvalidRestriction { table: String, reason: String },

    #[error("Policy document has no name")]
    MissingName,
}

/// Chaos configuration errors. Structural errors are fatal at run start;
/// a template-resolution miss at fire time is non-fatal (the single
/// firing is skipped and logged).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChaosError {
    #[error("Chaos script parse failed: {reason}")]
    ParseFailed { reason: String },

    #[error("Trigger {trigger:?}: {reason}")]
    InvalidTrigger { trigger: String, reason: String },

    #[error("Trigger {trigger:?} references unknown template field {field:?}")]
    UnknownTemplateField { trigger: String, field: String },

    #[error("Trigger {trigger:?}: field {field:?} unavailable at fire time")]
    TemplateUnavailable { trigger: String, field: String },

    #[error("Chaos script has no name")]
    MissingName,
}

/// Event bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Event bus for run {run_id} is closed")]
    Closed { run_id: Uuid },

    #[error("Event bus lock poisoned")]
    LockPoisoned,
}

/// Proxy runtime errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("I/O failure on {peer}: {reason}")]
    Io { peer: String, reason: String },

    #[error("Upstream database unavailable: {reason}")]
    DatabaseUnavailable { reason: String },

    #[error("Lock wait timed out for statement {statement_id} on table {table}")]
    LockTimeout {
        statement_id: StatementId,
        table: String,
    },

    #[error("Malformed wire frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Invalid configuration {name}: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("Run cancelled")]
    Cancelled,
}

/// Master error type for all ChaosTrace errors.
#[derive(Debug, Clone, Error)]
pub enum ChaosTraceError {
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Chaos error: {0}")]
    Chaos(#[from] ChaosError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

impl ChaosTraceError {
    /// Whether this error must prevent a run from starting.
    /// Everything else is surfaced as events and the run continues.
    pub fn is_startup_fatal(&self) -> bool {
        match self {
            ChaosTraceError::Policy(_) => true,
            ChaosTraceError::Chaos(err) => !matches!(
                err,
                ChaosError::TemplateUnavailable { .. }
            ),
            _ => false,
        }
    }
}

/// Result type alias for ChaosTrace operations.
pub type ChaosTraceResult<T> = Result<T, ChaosTraceError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_display() {
        let err = PolicyError::InvalidPattern {
            pattern: "[".to_string(),
            reason: "unclosed character class".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid forbidden pattern"));
        assert!(msg.contains("unclosed character class"));
    }

    #[test]
    fn test_chaos_template_miss_is_not_startup_fatal() {
        let err = ChaosTraceError::from(ChaosError::TemplateUnavailable {
            trigger: "first_delete_lock".to_string(),
            field: "event.tables[0]".to_string(),
        });
        assert!(!err.is_startup_fatal());

        let err = ChaosTraceError::from(ChaosError::InvalidTrigger {
            trigger: "t".to_string(),
            reason: "no condition".to_string(),
        });
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn test_policy_errors_are_startup_fatal() {
        let err = ChaosTraceError::from(PolicyError::MissingName);
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn test_proxy_errors_are_not_startup_fatal() {
        let err = ChaosTraceError::from(ProxyError::DatabaseUnavailable {
            reason: "connection refused".to_string(),
        });
        assert!(!err.is_startup_fatal());
    }

    #[test]
    fn test_lock_timeout_display() {
        let err = ProxyError::LockTimeout {
            statement_id: Uuid::nil(),
            table: "users".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Lock wait timed out"));
        assert!(msg.contains("users"));
    }

    #[test]
    fn test_master_error_from_variants() {
        let bus = ChaosTraceError::from(BusError::LockPoisoned);
        assert!(matches!(bus, ChaosTraceError::Bus(_)));

        let proxy = ChaosTraceError::from(ProxyError::Cancelled);
        assert!(matches!(proxy, ChaosTraceError::Proxy(_)));
    }
}
