use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    url::Url,
    uuid::Uuid,
};

// ── Identity ─────────────────────────────────────────────────────────────────

/// The credential key for one user across the whole fleet: the numeric
/// user id plus a stable secret token generated once at user creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    /// Secret token used as the client UUID on every node. Never rotated.
    pub key: Uuid,
}

impl Identity {
    pub fn new(user_id: i64, key: Uuid) -> Self {
        Self { user_id, key }
    }

    /// The external key under which nodes index this credential
    /// (the panel's `email` field).
    pub fn external_key(&self) -> String {
        self.user_id.to_string()
    }
}

// ── Node descriptor ──────────────────────────────────────────────────────────

/// One remote access-gateway node as the operator registered it, plus the
/// operational fields mutated by every login attempt. Nodes are never
/// deleted by this core, only deactivated by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub name: String,
    /// Panel base address, e.g. `http://host:2053/secret-path`.
    pub address: Url,
    pub username: String,
    pub password: String,
    /// Just-added flag. A fresh node gets backfilled with every active
    /// credential on its first successful login, then the flag clears.
    #[serde(default)]
    pub fresh: bool,
    /// Monotonic uptime accumulator, reset to 0 on failed login.
    #[serde(default)]
    pub uptime_secs: i64,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl NodeDescriptor {
    /// Hostname component of the panel address, used in rendered links.
    pub fn host(&self) -> Option<&str> {
        self.address.host_str()
    }

    /// Record a successful login: advance uptime by the time elapsed since
    /// the node was last seen, and stamp `last_seen_at`.
    pub fn record_login_ok(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_seen_at {
            let elapsed = (now - last).num_seconds();
            if elapsed > 0 {
                self.uptime_secs += elapsed;
            }
        }
        self.last_seen_at = Some(now);
    }

    /// Record a failed login: the uptime accumulator starts over, and the
    /// baseline is cleared so the outage span is not credited back by the
    /// next success.
    pub fn record_login_failed(&mut self) {
        self.uptime_secs = 0;
        self.last_seen_at = None;
    }
}

// ── Subscription record ──────────────────────────────────────────────────────

/// One subscription in the ledger. Historical records are retained for
/// display; only the record with `ends_at > now` drives provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: i64,
    pub plan: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub cost: f64,
}

impl SubscriptionRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.ends_at > now
    }
}

// ── Credential state ─────────────────────────────────────────────────────────

/// Derived (never stored) target state for one identity's credential,
/// computed from the active subscription at reconciliation time and pushed
/// to every node independently.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialState {
    pub identity: Identity,
    pub enabled: bool,
    /// Epoch milliseconds at which the node should cut the credential off.
    pub expires_at_ms: i64,
    pub ip_limit: u32,
    pub flow: String,
}

impl CredentialState {
    /// State for an identity holding an active subscription ending at
    /// `ends_at`.
    pub fn active(identity: Identity, ends_at: DateTime<Utc>, ip_limit: u32, flow: &str) -> Self {
        Self {
            identity,
            enabled: true,
            expires_at_ms: ends_at.timestamp_millis(),
            ip_limit,
            flow: flow.to_string(),
        }
    }

    /// Disabled state: the remote credential is kept (audit, re-enable)
    /// but stops admitting connections as of `now`.
    pub fn disabled(identity: Identity, now: DateTime<Utc>, ip_limit: u32, flow: &str) -> Self {
        Self {
            identity,
            enabled: false,
            expires_at_ms: now.timestamp_millis(),
            ip_limit,
            flow: flow.to_string(),
        }
    }
}
