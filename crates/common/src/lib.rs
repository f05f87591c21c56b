//! Shared domain types for the fleet: identities, node descriptors,
//! subscription records, derived credential state, and the error taxonomy.

pub mod error;
pub mod types;

pub use {
    error::FleetError,
    types::{CredentialState, Identity, NodeDescriptor, SubscriptionRecord},
};
