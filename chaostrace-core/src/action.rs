//! Chaos action variants.
//!
//! A `ChaosAction` describes one fault to inject. Actions are written in
//! chaos scripts with templated string fields (`{event.tables[0]}`) that
//! the chaos engine resolves against the triggering event at fire time,
//! not at load time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One fault injection, fully resolved (no templates remain once the
/// chaos engine hands an action to the proxy for enactment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosAction {
    /// Lock a table; statements touching it wait or fail until release.
    LockTable { table: String, duration_seconds: u64 },
    /// Delay every forward by a uniform sample from [min_ms, max_ms].
    InjectLatency {
        min_ms: u64,
        max_ms: u64,
        duration_seconds: u64,
    },
    /// Return a connection-timeout error for the next forwarded statement.
    SimulateTimeout,
    /// Invalidate the agent's credentials for the rest of the run.
    RevokeCredentials,
    /// Rewrite references to `column` on `table` into `new_name`.
    RenameColumn {
        table: String,
        column: String,
        new_name: String,
    },
    /// Statements writing `column` on `table` fail with a type error.
    ChangeColumnType {
        table: String,
        column: String,
        new_type: String,
    },
    /// Drop an index; modeled as added latency on statements touching
    /// the table for the window.
    DropIndex {
        table: String,
        extra_latency_ms: u64,
        duration_seconds: u64,
    },
    /// Write statements fail with a disk-full error during the window.
    DiskFull { duration_seconds: u64 },
    /// Statements fail with out-of-memory with the given probability
    /// during the window.
    MemoryPressure {
        percentage: u8,
        duration_seconds: u64,
    },
    /// Added latency proportional to the throttle percentage.
    CpuThrottle {
        percentage: u8,
        duration_seconds: u64,
    },
    /// Connections are dropped and new statements refused during the window.
    NetworkPartition { duration_seconds: u64 },
    /// Each response is lost (connection-failure error) with the given
    /// probability during the window.
    PacketLoss {
        percentage: u8,
        duration_seconds: u64,
    },
}

impl ChaosAction {
    /// Stable machine name of the variant, used in events and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ChaosAction::LockTable { .. } => "lock_table",
            ChaosAction::InjectLatency { .. } => "inject_latency",
            ChaosAction::SimulateTimeout => "simulate_timeout",
            ChaosAction::RevokeCredentials => "revoke_credentials",
            ChaosAction::RenameColumn { .. } => "rename_column",
            ChaosAction::ChangeColumnType { .. } => "change_column_type",
            ChaosAction::DropIndex { .. } => "drop_index",
            ChaosAction::DiskFull { .. } => "disk_full",
            ChaosAction::MemoryPressure { .. } => "memory_pressure",
            ChaosAction::CpuThrottle { .. } => "cpu_throttle",
            ChaosAction::NetworkPartition { .. } => "network_partition",
            ChaosAction::PacketLoss { .. } => "packet_loss",
        }
    }

    /// Effect duration in seconds, if the action has one.
    pub fn duration_seconds(&self) -> Option<u64> {
        match self {
            ChaosAction::LockTable {
                duration_seconds, ..
            }
            | ChaosAction::InjectLatency {
                duration_seconds, ..
            }
            | ChaosAction::DropIndex {
                duration_seconds, ..
            }
            | ChaosAction::DiskFull { duration_seconds }
            | ChaosAction::MemoryPressure {
                duration_seconds, ..
            }
            | ChaosAction::CpuThrottle {
                duration_seconds, ..
            }
            | ChaosAction::NetworkPartition { duration_seconds }
            | ChaosAction::PacketLoss {
                duration_seconds, ..
            } => Some(*duration_seconds),
            ChaosAction::SimulateTimeout | ChaosAction::RevokeCredentials => None,
            ChaosAction::RenameColumn { .. } | ChaosAction::ChangeColumnType { .. } => None,
        }
    }
}

impl fmt::Display for ChaosAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_names() {
        let action = ChaosAction::LockTable {
            table: "users".to_string(),
            duration_seconds: 30,
        };
        assert_eq!(action.kind(), "lock_table");
        assert_eq!(action.duration_seconds(), Some(30));

        assert_eq!(ChaosAction::SimulateTimeout.duration_seconds(), None);
    }

    #[test]
    fn test_action_yaml_round_trip() {
        let action = ChaosAction::InjectLatency {
            min_ms: 100,
            max_ms: 500,
            duration_seconds: 60,
        };
        let yaml = serde_json::to_string(&action).unwrap();
        let back: ChaosAction = serde_json::from_str(&yaml).unwrap();
        assert_eq!(action, back);
    }
}
