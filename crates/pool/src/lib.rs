//! Multi-node session pool.
//!
//! Owns the authenticated sessions for the whole fleet: concurrent login
//! with per-node failure isolation, an atomically swapped session
//! snapshot, order-preserving fan-out, and the fresh-node backfill that
//! brings a just-registered node in line with the subscription ledger.

pub mod pool;
pub mod session;

pub use {
    pool::{ClientFactory, ProvisioningDefaults, SessionPool},
    session::{NodeSession, NodeState},
};
