//! Active fault state consulted by the proxy on every statement.
//!
//! All effects carry a deadline on the tokio clock; expiry is lazy
//! (purged on every query and on each engine tick) so no background
//! task is needed. `release_all` force-releases everything at run end.
//! A table lock is released at most once: expiry and force-release both
//! remove the lock entry, and a removed entry cannot be removed again.

use chaostrace_core::{ChaosAction, ParsedStatement, SqlOperation};
use rand::Rng;
use regex::Regex;
use std::borrow::Cow;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A fault the proxy must surface for the current statement instead of
/// (or after) forwarding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    /// One-shot connection timeout.
    Timeout,
    /// Credentials are revoked for the rest of the run.
    CredentialsRevoked,
    /// Write statements fail while the disk-full window is open.
    DiskFull,
    /// Probabilistic out-of-memory failure.
    MemoryPressure,
    /// Response lost; surfaced as a connection failure.
    PacketLoss,
    /// Statement writes a column whose type was mutated.
    TypeChanged {
        table: String,
        column: String,
        new_type: String,
    },
}

struct TableLock {
    table: String,
    deadline: Instant,
}

struct LatencyWindow {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

struct IndexDrop {
    table: String,
    extra_latency_ms: u64,
    deadline: Instant,
}

struct Throttle {
    percentage: u8,
    deadline: Instant,
}

struct ProbabilisticWindow {
    percentage: u8,
    deadline: Instant,
}

struct ColumnRename {
    table: String,
    pattern: Regex,
    new_name: String,
}

struct ColumnTypeChange {
    table: String,
    column: String,
    new_type: String,
}

#[derive(Default)]
struct ChaosState {
    locks: Vec<TableLock>,
    latency: Vec<LatencyWindow>,
    index_drops: Vec<IndexDrop>,
    throttles: Vec<Throttle>,
    renames: Vec<ColumnRename>,
    type_changes: Vec<ColumnTypeChange>,
    memory: Vec<ProbabilisticWindow>,
    packet_loss: Vec<ProbabilisticWindow>,
    partition_until: Option<Instant>,
    disk_full_until: Option<Instant>,
    credentials_revoked: bool,
    timeout_pending: bool,
}

/// Shared, mutex-protected fault state for one run.
#[derive(Default)]
pub struct ActiveChaos {
    state: Mutex<ChaosState>,
    released: Notify,
}

fn lock_state(state: &Mutex<ChaosState>) -> std::sync::MutexGuard<'_, ChaosState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ActiveChaos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enact a fully resolved action. Untimed effects (credential
    /// revocation, schema mutations) persist until run end.
    pub fn enact(&self, action: &ChaosAction, now: Instant) {
        let mut state = lock_state(&self.state);
        match action {
            ChaosAction::LockTable {
                table,
                duration_seconds,
            } => state.locks.push(TableLock {
                table: table.to_ascii_lowercase(),
                deadline: now + Duration::from_secs(*duration_seconds),
            }),
            ChaosAction::InjectLatency {
                min_ms,
                max_ms,
                duration_seconds,
            } => state.latency.push(LatencyWindow {
                min_ms: *min_ms,
                max_ms: *max_ms,
                deadline: now + Duration::from_secs(*duration_seconds),
            }),
            ChaosAction::SimulateTimeout => state.timeout_pending = true,
            ChaosAction::RevokeCredentials => state.credentials_revoked = true,
            ChaosAction::RenameColumn {
                table,
                column,
                new_name,
            } => {
                // Compiled here, never at statement time. Escaped, so it
                // cannot fail for any identifier the classifier produces.
                if let Ok(pattern) =
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(column)))
                {
                    state.renames.push(ColumnRename {
                        table: table.to_ascii_lowercase(),
                        pattern,
                        new_name: new_name.clone(),
                    });
                }
            }
            ChaosAction::ChangeColumnType {
                table,
                column,
                new_type,
            } => state.type_changes.push(ColumnTypeChange {
                table: table.to_ascii_lowercase(),
                column: column.to_ascii_lowercase(),
                new_type: new_type.clone(),
            }),
            ChaosAction::DropIndex {
                table,
                extra_latency_ms,
                duration_seconds,
            } => state.index_drops.push(IndexDrop {
                table: table.to_ascii_lowercase(),
                extra_latency_ms: *extra_latency_ms,
                deadline: now + Duration::from_secs(*duration_seconds),
            }),
            ChaosAction::DiskFull { duration_seconds } => {
                state.disk_full_until = Some(now + Duration::from_secs(*duration_seconds));
            }
            ChaosAction::MemoryPressure {
                percentage,
                duration_seconds,
            } => state.memory.push(ProbabilisticWindow {
                percentage: *percentage,
                deadline: now + Duration::from_secs(*duration_seconds),
            }),
            ChaosAction::CpuThrottle {
                percentage,
                duration_seconds,
            } => state.throttles.push(Throttle {
                percentage: *percentage,
                deadline: now + Duration::from_secs(*duration_seconds),
            }),
            ChaosAction::NetworkPartition { duration_seconds } => {
                state.partition_until = Some(now + Duration::from_secs(*duration_seconds));
            }
            ChaosAction::PacketLoss {
                percentage,
                duration_seconds,
            } => state.packet_loss.push(ProbabilisticWindow {
                percentage: *percentage,
                deadline: now + Duration::from_secs(*duration_seconds),
            }),
        }
    }

    /// Drop every expired timed effect; wakes lock waiters when a lock
    /// expires.
    pub fn purge(&self, now: Instant) {
        let mut state = lock_state(&self.state);
        let before = state.locks.len();
        state.locks.retain(|lock| lock.deadline > now);
        let released = state.locks.len() < before;
        state.latency.retain(|w| w.deadline > now);
        state.index_drops.retain(|w| w.deadline > now);
        state.throttles.retain(|w| w.deadline > now);
        state.memory.retain(|w| w.deadline > now);
        state.packet_loss.retain(|w| w.deadline > now);
        if state.partition_until.is_some_and(|until| until <= now) {
            state.partition_until = None;
        }
        if state.disk_full_until.is_some_and(|until| until <= now) {
            state.disk_full_until = None;
        }
        drop(state);
        if released {
            self.released.notify_waiters();
        }
    }

    /// Force-release everything. Called exactly once at run end; locks
    /// already expired are simply absent, so nothing is released twice.
    pub fn release_all(&self) {
        let mut state = lock_state(&self.state);
        *state = ChaosState::default();
        drop(state);
        self.released.notify_waiters();
    }

    /// Table currently locking this statement, if any.
    pub fn blocking_lock(&self, statement: &ParsedStatement, now: Instant) -> Option<String> {
        let mut state = lock_state(&self.state);
        state.locks.retain(|lock| lock.deadline > now);
        state
            .locks
            .iter()
            .find(|lock| statement.touches_table(&lock.table))
            .map(|lock| lock.table.clone())
    }

    /// Wait until no lock blocks `statement`, or until `max_wait`
    /// elapses. Returns the blocking table on timeout. Interruptible:
    /// `release_all` and lock expiry both wake waiters.
    pub async fn wait_until_unlocked(
        &self,
        statement: &ParsedStatement,
        max_wait: Duration,
    ) -> Result<(), String> {
        let give_up = Instant::now() + max_wait;
        loop {
            let now = Instant::now();
            let blocking = {
                let state = lock_state(&self.state);
                state
                    .locks
                    .iter()
                    .filter(|lock| lock.deadline > now && statement.touches_table(&lock.table))
                    .map(|lock| (lock.table.clone(), lock.deadline))
                    .next()
            };
            let Some((table, deadline)) = blocking else {
                return Ok(());
            };
            if now >= give_up {
                return Err(table);
            }
            let wake_at = deadline.min(give_up);
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {
                    self.purge(Instant::now());
                }
            }
        }
    }

    /// Total added latency for this statement: one uniform sample per
    /// latency window, plus per-table extra for dropped indexes, plus a
    /// fixed cost per CPU throttle percentage point.
    pub fn current_latency(&self, statement: &ParsedStatement, now: Instant) -> Duration {
        let state = lock_state(&self.state);
        let mut rng = rand::rng();
        let mut total_ms: u64 = 0;
        for window in state.latency.iter().filter(|w| w.deadline > now) {
            total_ms += if window.min_ms == window.max_ms {
                window.min_ms
            } else {
                rng.random_range(window.min_ms..=window.max_ms)
            };
        }
        for drop in state.index_drops.iter().filter(|w| w.deadline > now) {
            if statement.touches_table(&drop.table) {
                total_ms += drop.extra_latency_ms;
            }
        }
        for throttle in state.throttles.iter().filter(|w| w.deadline > now) {
            total_ms += throttle.percentage as u64 * 10;
        }
        Duration::from_millis(total_ms)
    }

    /// Rewrite the statement text through active column renames. Only
    /// renames whose table the statement touches apply.
    pub fn rewrite<'a>(&self, statement: &'a ParsedStatement) -> Cow<'a, str> {
        let state = lock_state(&self.state);
        let mut text = Cow::Borrowed(statement.raw_text.as_str());
        for rename in &state.renames {
            if !statement.touches_table(&rename.table) {
                continue;
            }
            if rename.pattern.is_match(&text) {
                text = Cow::Owned(
                    rename
                        .pattern
                        .replace_all(&text, rename.new_name.as_str())
                        .into_owned(),
                );
            }
        }
        text
    }

    pub fn partitioned(&self, now: Instant) -> bool {
        lock_state(&self.state)
            .partition_until
            .is_some_and(|until| until > now)
    }

    /// First fault that applies to this statement, or None. The one-shot
    /// timeout is consumed here.
    pub fn fault_for(&self, statement: &ParsedStatement, now: Instant) -> Option<InjectedFault> {
        let mut state = lock_state(&self.state);
        if state.timeout_pending {
            state.timeout_pending = false;
            return Some(InjectedFault::Timeout);
        }
        if state.credentials_revoked {
            return Some(InjectedFault::CredentialsRevoked);
        }
        let is_write = statement.operation.is_write() || statement.operation == SqlOperation::Ddl;
        if is_write && state.disk_full_until.is_some_and(|until| until > now) {
            return Some(InjectedFault::DiskFull);
        }
        if is_write {
            for change in &state.type_changes {
                if statement.touches_table(&change.table)
                    && statement.columns.contains(&change.column)
                {
                    return Some(InjectedFault::TypeChanged {
                        table: change.table.clone(),
                        column: change.column.clone(),
                        new_type: change.new_type.clone(),
                    });
                }
            }
        }
        let mut rng = rand::rng();
        for window in state.memory.iter().filter(|w| w.deadline > now) {
            if rng.random_range(0u8..100) < window.percentage {
                return Some(InjectedFault::MemoryPressure);
            }
        }
        for window in state.packet_loss.iter().filter(|w| w.deadline > now) {
            if rng.random_range(0u8..100) < window.percentage {
                return Some(InjectedFault::PacketLoss);
            }
        }
        None
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        lock_state(&self.state).locks.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_sql::classify;

    fn lock(table: &str, secs: u64) -> ChaosAction {
        ChaosAction::LockTable {
            table: table.to_string(),
            duration_seconds: secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_blocks_matching_statement() {
        let active = ActiveChaos::new();
        let now = Instant::now();
        active.enact(&lock("users", 30), now);

        let stmt = classify("DELETE FROM users WHERE id = 1");
        assert_eq!(active.blocking_lock(&stmt, now), Some("users".to_string()));

        let other = classify("SELECT * FROM orders");
        assert_eq!(active.blocking_lock(&other, now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_at_deadline() {
        let active = ActiveChaos::new();
        active.enact(&lock("users", 30), Instant::now());

        tokio::time::advance(Duration::from_secs(31)).await;
        let stmt = classify("UPDATE users SET a = 1 WHERE id = 1");
        assert_eq!(active.blocking_lock(&stmt, Instant::now()), None);
        assert_eq!(active.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_unlocked_returns_on_expiry() {
        let active = ActiveChaos::new();
        active.enact(&lock("users", 5), Instant::now());

        let stmt = classify("DELETE FROM users WHERE id = 1");
        active
            .wait_until_unlocked(&stmt, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_unlocked_times_out() {
        let active = ActiveChaos::new();
        active.enact(&lock("users", 600), Instant::now());

        let stmt = classify("DELETE FROM users WHERE id = 1");
        let err = active
            .wait_until_unlocked(&stmt, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err, "users");
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_wakes_waiters() {
        let active = std::sync::Arc::new(ActiveChaos::new());
        active.enact(&lock("users", 600), Instant::now());

        let waiter = {
            let active = active.clone();
            tokio::spawn(async move {
                let stmt = classify("DELETE FROM users WHERE id = 1");
                active
                    .wait_until_unlocked(&stmt, Duration::from_secs(300))
                    .await
            })
        };
        tokio::task::yield_now().await;
        active.release_all();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let active = ActiveChaos::new();
        active.enact(&ChaosAction::SimulateTimeout, Instant::now());

        let stmt = classify("SELECT 1");
        assert_eq!(
            active.fault_for(&stmt, Instant::now()),
            Some(InjectedFault::Timeout)
        );
        assert_eq!(active.fault_for(&stmt, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disk_full_hits_writes_only() {
        let active = ActiveChaos::new();
        active.enact(&ChaosAction::DiskFull { duration_seconds: 60 }, Instant::now());

        let write = classify("INSERT INTO t (a) VALUES (1)");
        assert_eq!(
            active.fault_for(&write, Instant::now()),
            Some(InjectedFault::DiskFull)
        );
        let read = classify("SELECT * FROM t");
        assert_eq!(active.fault_for(&read, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_rewrites_only_matching_table() {
        let active = ActiveChaos::new();
        active.enact(
            &ChaosAction::RenameColumn {
                table: "users".to_string(),
                column: "email".to_string(),
                new_name: "email_address".to_string(),
            },
            Instant::now(),
        );

        let hit = classify("SELECT email FROM users");
        assert_eq!(active.rewrite(&hit), "SELECT email_address FROM users");

        let miss = classify("SELECT email FROM contacts");
        assert!(matches!(active.rewrite(&miss), Cow::Borrowed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_change_faults_writes_to_column() {
        let active = ActiveChaos::new();
        active.enact(
            &ChaosAction::ChangeColumnType {
                table: "users".to_string(),
                column: "age".to_string(),
                new_type: "text".to_string(),
            },
            Instant::now(),
        );

        let hit = classify("UPDATE users SET age = 5 WHERE id = 1");
        assert!(matches!(
            active.fault_for(&hit, Instant::now()),
            Some(InjectedFault::TypeChanged { .. })
        ));
        let read = classify("SELECT age FROM users");
        assert_eq!(active.fault_for(&read, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_windows_sum() {
        let active = ActiveChaos::new();
        let now = Instant::now();
        active.enact(
            &ChaosAction::InjectLatency {
                min_ms: 100,
                max_ms: 100,
                duration_seconds: 60,
            },
            now,
        );
        active.enact(
            &ChaosAction::DropIndex {
                table: "users".to_string(),
                extra_latency_ms: 50,
                duration_seconds: 60,
            },
            now,
        );

        let stmt = classify("SELECT * FROM users");
        assert_eq!(
            active.current_latency(&stmt, now),
            Duration::from_millis(150)
        );

        let other = classify("SELECT * FROM orders");
        assert_eq!(
            active.current_latency(&other, now),
            Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_window() {
        let active = ActiveChaos::new();
        let now = Instant::now();
        assert!(!active.partitioned(now));
        active.enact(&ChaosAction::NetworkPartition { duration_seconds: 10 }, now);
        assert!(active.partitioned(Instant::now()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!active.partitioned(Instant::now()));
    }
}
