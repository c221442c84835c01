//! Proxy configuration from the environment.
//!
//! Everything has a default except the policy and chaos script paths;
//! a missing or unparseable value fails before the run starts.

use chaostrace_core::ProxyError;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6432";
const DEFAULT_UPSTREAM_ADDR: &str = "127.0.0.1:5432";
const DEFAULT_SCENARIO: &str = "default";
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LOCK_WAIT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub policy_path: PathBuf,
    pub chaos_path: PathBuf,
    pub scenario: String,
    pub run_timeout: Duration,
    /// How long a statement waits on a chaos table lock before `55P03`.
    pub lock_wait: Duration,
    /// Where to write the JSON report; stdout when unset.
    pub report_path: Option<PathBuf>,
}

fn required(name: &str) -> Result<String, ProxyError> {
    std::env::var(name).map_err(|_| ProxyError::InvalidConfig {
        name: name.to_string(),
        reason: "not set".to_string(),
    })
}

fn seconds(name: &str, default: u64) -> Result<Duration, ProxyError> {
    match std::env::var(name) {
        Err(_) => Ok(Duration::from_secs(default)),
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|err| ProxyError::InvalidConfig {
                name: name.to_string(),
                reason: err.to_string(),
            }),
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ProxyError> {
        Ok(Self {
            listen_addr: std::env::var("CHAOSTRACE_LISTEN_ADDR")
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            upstream_addr: std::env::var("CHAOSTRACE_UPSTREAM_ADDR")
                .unwrap_or_else(|_| DEFAULT_UPSTREAM_ADDR.to_string()),
            policy_path: PathBuf::from(required("CHAOSTRACE_POLICY_FILE")?),
            chaos_path: PathBuf::from(required("CHAOSTRACE_CHAOS_FILE")?),
            scenario: std::env::var("CHAOSTRACE_SCENARIO")
                .unwrap_or_else(|_| DEFAULT_SCENARIO.to_string()),
            run_timeout: seconds("CHAOSTRACE_RUN_TIMEOUT_SECS", DEFAULT_RUN_TIMEOUT_SECS)?,
            lock_wait: seconds("CHAOSTRACE_LOCK_WAIT_SECS", DEFAULT_LOCK_WAIT_SECS)?,
            report_path: std::env::var("CHAOSTRACE_REPORT_FILE")
                .ok()
                .map(PathBuf::from),
        })
    }
}
