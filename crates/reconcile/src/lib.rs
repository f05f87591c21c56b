//! Reconciliation engine: translates subscription lifecycle events into
//! fleet-wide credential pushes and runs the scheduled sweeps (expiry,
//! near-expiry notification, health probe).

pub mod engine;
pub mod notify;
pub mod scheduler;

pub use {
    engine::ReconcileEngine,
    notify::{LogNotifier, Notifier},
    scheduler::{Scheduler, SweepSchedules, build_scheduler},
};
