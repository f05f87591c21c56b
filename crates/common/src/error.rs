use thiserror::Error;

/// Failure taxonomy for remote panel and ledger interactions.
///
/// Absence of a credential or inbound is *not* an error — those paths
/// return `Option::None`. Everything here is logged at the boundary where
/// it occurs and converted into an absent slot in aggregate results;
/// nothing crosses the session-pool boundary as a hard failure.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The node rejected our panel credentials or never answered the
    /// login call. Recorded as node state, never fatal to the pool.
    #[error("login to node '{node}' failed: {reason}")]
    AuthFailure { node: String, reason: String },

    /// A remote call failed after login (timeout, connection reset, 5xx).
    #[error("remote call on node '{node}' failed: {reason}")]
    Remote { node: String, reason: String },

    /// The node answered with something we could not decode.
    #[error("malformed response from node '{node}': {reason}")]
    Malformed { node: String, reason: String },

    /// The ledger handed back data that violates a domain invariant,
    /// e.g. a subscription with no matching user. The affected operation
    /// is skipped; sibling work continues.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("ledger error: {0}")]
    Ledger(String),
}

impl FleetError {
    pub fn remote(node: &str, err: impl std::fmt::Display) -> Self {
        Self::Remote {
            node: node.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn malformed(node: &str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            node: node.to_string(),
            reason: err.to_string(),
        }
    }
}
