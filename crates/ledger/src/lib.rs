//! Subscription ledger: the source of truth for users, subscriptions, and
//! node operational state.
//!
//! The reconciliation engine and session pool consume the [`Ledger`]
//! trait; [`SqliteLedger`] is the shipped implementation.

pub mod store;

use {
    async_trait::async_trait,
    chrono::{DateTime, NaiveDate, Utc},
};

use fleetpass_common::{FleetError, Identity, NodeDescriptor, SubscriptionRecord};

pub use store::SqliteLedger;

/// Read/write surface the provisioning core needs from the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Every identity currently holding an active subscription, paired
    /// with that subscription. Used for fresh-node backfill.
    async fn active_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Identity, SubscriptionRecord)>, FleetError>;

    /// Write back a node's operational fields (uptime, last-seen, fresh
    /// flag) after a login sweep.
    async fn persist_node(&self, node: &NodeDescriptor) -> Result<(), FleetError>;

    /// Subscriptions whose `ends_at` falls inside the civil day `date`
    /// (UTC, upper bound exclusive). Drives the expiry and near-expiry
    /// sweeps.
    async fn subscriptions_ending_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<SubscriptionRecord>, FleetError>;

    /// The stable identity for a user, or `None` when the ledger has no
    /// such user (an invariant violation the caller logs and skips).
    async fn identity_for_user(&self, user_id: i64) -> Result<Option<Identity>, FleetError>;
}
