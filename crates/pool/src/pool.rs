use std::{future::Future, sync::Arc};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::future::join_all,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, error, info, warn},
};

use {
    fleetpass_common::{CredentialState, FleetError, NodeDescriptor},
    fleetpass_ledger::Ledger,
    fleetpass_panel::{PanelApi, render_link},
};

use crate::session::{NodeSession, NodeState};

/// Builds the remote client for one node. Injected so tests can stand in
/// fake fleets without HTTP.
pub type ClientFactory =
    Arc<dyn Fn(&NodeDescriptor) -> Result<Arc<dyn PanelApi>, FleetError> + Send + Sync>;

/// Fleet-wide credential defaults, taken from config.
#[derive(Debug, Clone)]
pub struct ProvisioningDefaults {
    pub inbound_id: u32,
    pub ip_limit: u32,
    pub flow: String,
}

/// Owns the full set of node sessions and every fan-out primitive.
///
/// The live session list is replaced wholesale by `refresh`; readers take
/// a snapshot reference at call time and never mutate it.
pub struct SessionPool {
    ledger: Arc<dyn Ledger>,
    factory: ClientFactory,
    defaults: ProvisioningDefaults,
    /// Current node descriptors, carrying the operational fields the
    /// refresh sweep mutates (uptime, last-seen, fresh flag).
    nodes: RwLock<Vec<NodeDescriptor>>,
    /// Snapshot of the last refresh, swapped atomically.
    sessions: RwLock<Arc<Vec<NodeSession>>>,
    /// Serializes refreshes: a second refresh while one is in flight is a
    /// no-op, so uptime is never double-counted.
    refresh_gate: Mutex<()>,
}

impl SessionPool {
    pub fn new(
        nodes: Vec<NodeDescriptor>,
        ledger: Arc<dyn Ledger>,
        factory: ClientFactory,
        defaults: ProvisioningDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            factory,
            defaults,
            nodes: RwLock::new(nodes),
            sessions: RwLock::new(Arc::new(Vec::new())),
            refresh_gate: Mutex::new(()),
        })
    }

    /// The current session snapshot.
    pub async fn snapshot(&self) -> Arc<Vec<NodeSession>> {
        Arc::clone(&*self.sessions.read().await)
    }

    pub fn defaults(&self) -> &ProvisioningDefaults {
        &self.defaults
    }

    /// Log into every node concurrently and swap in the new session list.
    ///
    /// Each login is independent: one node failing or timing out never
    /// blocks the others. Updated descriptors are written back through
    /// the ledger. Returns the new snapshot (or the current one when a
    /// refresh is already in flight).
    pub async fn refresh(&self) -> Arc<Vec<NodeSession>> {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            debug!("refresh already in flight, returning current snapshot");
            return self.snapshot().await;
        };

        let now = Utc::now();
        let descriptors = self.nodes.read().await.clone();
        let sessions =
            join_all(descriptors.into_iter().map(|d| self.login_node(d, now))).await;

        for session in &sessions {
            if let Err(e) = self.ledger.persist_node(&session.descriptor).await {
                warn!(node = %session.descriptor.id, error = %e,
                    "failed to persist node descriptor");
            }
        }

        let active = sessions.iter().filter(|s| s.is_active()).count();
        info!(nodes = sessions.len(), active, "fleet refresh complete");

        *self.nodes.write().await = sessions.iter().map(|s| s.descriptor.clone()).collect();
        let snapshot = Arc::new(sessions);
        *self.sessions.write().await = Arc::clone(&snapshot);
        snapshot
    }

    async fn login_node(&self, mut descriptor: NodeDescriptor, now: DateTime<Utc>) -> NodeSession {
        let client = match (self.factory)(&descriptor) {
            Ok(client) => client,
            Err(e) => {
                error!(node = %descriptor.id, error = %e, "failed to build panel client");
                descriptor.record_login_failed();
                let client = Arc::new(DeadPanel {
                    node_id: descriptor.id.clone(),
                });
                return NodeSession {
                    descriptor,
                    client,
                    state: NodeState::Unreachable,
                };
            },
        };

        match client.login().await {
            Ok(()) => {
                descriptor.record_login_ok(now);
                if descriptor.fresh {
                    match self.backfill(&descriptor, client.as_ref(), now).await {
                        Ok(count) => {
                            info!(node = %descriptor.id, credentials = count,
                                "backfilled fresh node");
                            descriptor.fresh = false;
                        },
                        Err(e) => {
                            // Flag stays set so the next refresh retries.
                            warn!(node = %descriptor.id, error = %e, "backfill failed");
                        },
                    }
                }
                NodeSession {
                    descriptor,
                    client,
                    state: NodeState::Active,
                }
            },
            Err(e) => {
                warn!(node = %descriptor.id, error = %e, "login failed");
                descriptor.record_login_failed();
                NodeSession {
                    descriptor,
                    client,
                    state: NodeState::Unreachable,
                }
            },
        }
    }

    /// Push a credential for every active subscription onto one node, so
    /// a freshly registered node starts consistent with the fleet.
    ///
    /// Errors if any single push failed: upserts are idempotent, so the
    /// caller keeps the node flagged fresh and the next refresh retries
    /// the whole set rather than leaving skipped identities behind.
    async fn backfill(
        &self,
        descriptor: &NodeDescriptor,
        client: &dyn PanelApi,
        now: DateTime<Utc>,
    ) -> Result<usize, FleetError> {
        let active = self.ledger.active_subscriptions(now).await?;
        let mut pushed = 0;
        let mut failed = 0;
        for (identity, sub) in active {
            let state = CredentialState::active(
                identity,
                sub.ends_at,
                self.defaults.ip_limit,
                &self.defaults.flow,
            );
            match client.upsert_client(self.defaults.inbound_id, &state).await {
                Ok(()) => pushed += 1,
                Err(e) => {
                    warn!(node = %descriptor.id, user = state.identity.user_id, error = %e,
                        "backfill upsert failed");
                    failed += 1;
                },
            }
        }
        if failed > 0 {
            return Err(FleetError::remote(
                &descriptor.id,
                format!("{failed} of {} credential pushes failed", pushed + failed),
            ));
        }
        Ok(pushed)
    }

    /// Apply `op` to every node in the current snapshot, one concurrent
    /// task per node, preserving node order.
    ///
    /// Down nodes and per-node failures become `None` slots; sibling work
    /// always runs to completion.
    pub async fn for_each_node<T, F, Fut>(&self, op: F) -> Vec<Option<T>>
    where
        F: Fn(NodeSession) -> Fut,
        Fut: Future<Output = Result<T, FleetError>>,
    {
        let snapshot = self.snapshot().await;
        let tasks = snapshot.iter().map(|session| {
            let session = session.clone();
            let node_id = session.descriptor.id.clone();
            let fut = session.is_active().then(|| op(session));
            async move {
                match fut {
                    None => None,
                    Some(fut) => match fut.await {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(node = %node_id, error = %e, "node operation failed");
                            None
                        },
                    },
                }
            }
        });
        join_all(tasks).await
    }

    /// Broadcast a credential state to every logged-in node. Nodes that
    /// are down will be caught up by their next backfill or
    /// reconciliation pass. Returns how many nodes took the update.
    pub async fn upsert_client(&self, state: &CredentialState) -> usize {
        let inbound_id = self.defaults.inbound_id;
        let applied = self
            .for_each_node(|session| {
                let state = state.clone();
                async move { session.client.upsert_client(inbound_id, &state).await }
            })
            .await;
        let count = applied.iter().flatten().count();
        debug!(user = state.identity.user_id, enabled = state.enabled, nodes = count,
            "credential broadcast");
        count
    }

    /// Rendered connection links for `external_key` on every node that
    /// holds a matching credential. Nodes that fail or have no matching
    /// client are skipped.
    pub async fn links_for_identity(
        &self,
        inbound_id: u32,
        external_key: &str,
    ) -> Vec<(NodeDescriptor, String)> {
        self.for_each_node(|session| {
            let key = external_key.to_string();
            async move {
                let inbounds = session.client.list_inbounds().await?;
                Ok(render_link(&session.descriptor, &inbounds, inbound_id, &key)
                    .map(|link| (session.descriptor.clone(), link)))
            }
        })
        .await
        .into_iter()
        .flatten()
        .flatten()
        .collect()
    }

    /// Single-node link lookup for direct "connect to server X" flows.
    pub async fn link_for_node(
        &self,
        inbound_id: u32,
        external_key: &str,
        node_id: &str,
    ) -> Option<String> {
        let snapshot = self.snapshot().await;
        let session = snapshot
            .iter()
            .find(|s| s.descriptor.id == node_id && s.is_active())?;
        match session.client.list_inbounds().await {
            Ok(inbounds) => render_link(&session.descriptor, &inbounds, inbound_id, external_key),
            Err(e) => {
                warn!(node = %node_id, error = %e, "link lookup failed");
                None
            },
        }
    }

    /// Per-node `(upload, download)` counters for one credential, in node
    /// order. `None` marks down nodes, failed calls, and nodes that never
    /// saw the credential.
    pub async fn traffic_for_identity(&self, external_key: &str) -> Vec<Option<(i64, i64)>> {
        self.for_each_node(|session| {
            let key = external_key.to_string();
            async move { session.client.client_traffic(&key).await }
        })
        .await
        .into_iter()
        .map(|slot| slot.flatten())
        .collect()
    }
}

/// Stand-in client for a node whose real client could not be built; every
/// call reports the node unreachable.
struct DeadPanel {
    node_id: String,
}

#[async_trait]
impl PanelApi for DeadPanel {
    async fn login(&self) -> Result<(), FleetError> {
        Err(FleetError::Remote {
            node: self.node_id.clone(),
            reason: "client unavailable".into(),
        })
    }

    async fn list_inbounds(&self) -> Result<Vec<fleetpass_panel::Inbound>, FleetError> {
        self.login().await.map(|_| Vec::new())
    }

    async fn get_client(
        &self,
        _inbound_id: u32,
        _email: &str,
    ) -> Result<Option<fleetpass_panel::ClientConfig>, FleetError> {
        self.login().await.map(|_| None)
    }

    async fn upsert_client(
        &self,
        _inbound_id: u32,
        _state: &CredentialState,
    ) -> Result<(), FleetError> {
        self.login().await
    }

    async fn client_traffic(&self, _email: &str) -> Result<Option<(i64, i64)>, FleetError> {
        self.login().await.map(|_| None)
    }
}
