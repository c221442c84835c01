//! ChaosTrace Chaos - scripted fault injection
//!
//! A chaos script declares named triggers; each trigger pairs a firing
//! condition (an event match, a schedule offset, or a per-tick coin
//! flip) with one `ChaosAction`. The engine subscribes to the run's
//! event bus, fires triggers, and maintains the active fault state that
//! the proxy consults on every statement.
//!
//! Structural script defects fail at load, before the run begins. The
//! only mid-run failure mode is a template field that is unavailable on
//! the triggering event; that firing is skipped and logged.

mod active;
mod engine;
mod script;

pub use active::{ActiveChaos, InjectedFault};
pub use engine::ChaosEngine;
pub use script::{ChaosScript, EventCondition, Trigger, TriggerKind};
