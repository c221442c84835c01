//! ChaosTrace Proxy - the wire-level harness
//!
//! Sits between an AI agent and its database, speaking the PostgreSQL
//! simple protocol. Every statement is classified, judged against the
//! policy, exposed to active chaos, and recorded on the run's event bus
//! before (or instead of) reaching the real database.

pub mod config;
pub mod run;
pub mod server;
pub mod wire;

pub use config::ProxyConfig;
pub use run::RunHandle;
pub use server::ProxyServer;
