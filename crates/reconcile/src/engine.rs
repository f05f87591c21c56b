use std::sync::Arc;

use {
    chrono::{DateTime, Duration, Utc},
    tracing::{error, info},
};

use {
    fleetpass_common::{CredentialState, FleetError, Identity, SubscriptionRecord},
    fleetpass_ledger::Ledger,
    fleetpass_pool::SessionPool,
};

use crate::notify::Notifier;

/// Drives the session pool from subscription lifecycle events and runs
/// the scheduled sweeps. Holds no state of its own: the ledger is the
/// source of truth, the pool is the sink.
pub struct ReconcileEngine {
    pool: Arc<SessionPool>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
}

impl ReconcileEngine {
    pub fn new(
        pool: Arc<SessionPool>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            ledger,
            notifier,
        })
    }

    /// A subscription was created or its `ends_at` moved (purchase,
    /// renewal, referral bonus). Pushes the derived credential state to
    /// every reachable node. Returns how many nodes took it.
    pub async fn subscription_upserted(
        &self,
        identity: &Identity,
        sub: &SubscriptionRecord,
        now: DateTime<Utc>,
    ) -> usize {
        let d = self.pool.defaults().clone();
        let state = if sub.is_active(now) {
            CredentialState::active(identity.clone(), sub.ends_at, d.ip_limit, &d.flow)
        } else {
            CredentialState::disabled(identity.clone(), now, d.ip_limit, &d.flow)
        };
        self.pool.upsert_client(&state).await
    }

    /// A subscription ended or was revoked. The remote credential is
    /// disabled, not deleted — nodes keep the record for audit and
    /// painless re-enable.
    pub async fn subscription_removed(&self, identity: &Identity, now: DateTime<Utc>) -> usize {
        let d = self.pool.defaults().clone();
        let state = CredentialState::disabled(identity.clone(), now, d.ip_limit, &d.flow);
        self.pool.upsert_client(&state).await
    }

    /// Daily sweep: disable every subscription whose `ends_at` fell
    /// within the previous civil day (UTC) and notify the user. Returns
    /// the number of subscriptions closed.
    pub async fn expiry_sweep(&self, now: DateTime<Utc>) -> Result<usize, FleetError> {
        let yesterday = (now - Duration::days(1)).date_naive();
        let expired = self.ledger.subscriptions_ending_on(yesterday).await?;

        let mut closed = 0;
        for sub in expired {
            match self.ledger.identity_for_user(sub.user_id).await? {
                Some(identity) => {
                    self.subscription_removed(&identity, now).await;
                    self.notifier.subscription_expired(sub.user_id, &sub.plan).await;
                    info!(user = sub.user_id, plan = %sub.plan, "subscription stopped");
                    closed += 1;
                },
                None => {
                    // Ledger invariant violation: skip this record, keep
                    // sweeping the rest.
                    error!(user = sub.user_id, sub = %sub.id,
                        "expired subscription references unknown user");
                },
            }
        }
        Ok(closed)
    }

    /// Daily sweep: notify users whose subscription ends in exactly 5, 1,
    /// or 0 whole days (civil-date buckets, not a range).
    pub async fn near_expiry_sweep(&self, now: DateTime<Utc>) -> Result<usize, FleetError> {
        let mut notified = 0;
        for days_left in [5i64, 1, 0] {
            let date = (now + Duration::days(days_left)).date_naive();
            for sub in self.ledger.subscriptions_ending_on(date).await? {
                match self.ledger.identity_for_user(sub.user_id).await? {
                    Some(_) => {
                        self.notifier.subscription_expiring(sub.user_id, days_left).await;
                        notified += 1;
                    },
                    None => {
                        error!(user = sub.user_id, sub = %sub.id,
                            "expiring subscription references unknown user");
                    },
                }
            }
        }
        Ok(notified)
    }

    /// Five-minute sweep: refresh every session and alert the operator
    /// once per sweep for each node that failed its login.
    pub async fn health_sweep(&self) -> usize {
        let snapshot = self.pool.refresh().await;
        let mut down = 0;
        for session in snapshot.iter().filter(|s| !s.is_active()) {
            self.notifier
                .node_unreachable(&session.descriptor.id, "login failed")
                .await;
            down += 1;
        }
        down
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    };

    use {
        async_trait::async_trait,
        chrono::{NaiveDate, TimeZone},
        fleetpass_common::NodeDescriptor,
        fleetpass_panel::PanelApi,
        fleetpass_pool::{ClientFactory, ProvisioningDefaults},
        uuid::Uuid,
    };

    use super::*;

    // ── Fakes ────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakePanel {
        fail_login: AtomicBool,
        upserts: StdMutex<Vec<CredentialState>>,
    }

    #[async_trait]
    impl PanelApi for FakePanel {
        async fn login(&self) -> Result<(), FleetError> {
            if self.fail_login.load(Ordering::SeqCst) {
                return Err(FleetError::AuthFailure {
                    node: "fake".into(),
                    reason: "simulated".into(),
                });
            }
            Ok(())
        }

        async fn list_inbounds(&self) -> Result<Vec<fleetpass_panel::Inbound>, FleetError> {
            Ok(Vec::new())
        }

        async fn get_client(
            &self,
            _inbound_id: u32,
            _email: &str,
        ) -> Result<Option<fleetpass_panel::ClientConfig>, FleetError> {
            Ok(None)
        }

        async fn upsert_client(
            &self,
            _inbound_id: u32,
            state: &CredentialState,
        ) -> Result<(), FleetError> {
            self.upserts.lock().unwrap().push(state.clone());
            Ok(())
        }

        async fn client_traffic(&self, _email: &str) -> Result<Option<(i64, i64)>, FleetError> {
            Ok(None)
        }
    }

    /// In-memory ledger indexing subscriptions by their `ends_at` date.
    #[derive(Default)]
    struct FakeLedger {
        users: Vec<Identity>,
        subs: Vec<SubscriptionRecord>,
    }

    #[async_trait]
    impl Ledger for FakeLedger {
        async fn active_subscriptions(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<(Identity, SubscriptionRecord)>, FleetError> {
            Ok(self
                .subs
                .iter()
                .filter(|s| s.is_active(now))
                .filter_map(|s| {
                    self.users
                        .iter()
                        .find(|u| u.user_id == s.user_id)
                        .map(|u| (u.clone(), s.clone()))
                })
                .collect())
        }

        async fn persist_node(&self, _node: &NodeDescriptor) -> Result<(), FleetError> {
            Ok(())
        }

        async fn subscriptions_ending_on(
            &self,
            date: NaiveDate,
        ) -> Result<Vec<SubscriptionRecord>, FleetError> {
            Ok(self
                .subs
                .iter()
                .filter(|s| s.ends_at.date_naive() == date)
                .cloned()
                .collect())
        }

        async fn identity_for_user(&self, user_id: i64) -> Result<Option<Identity>, FleetError> {
            Ok(self.users.iter().find(|u| u.user_id == user_id).cloned())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Expired(i64),
        Expiring(i64, i64),
        NodeDown(String),
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: StdMutex<Vec<Event>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn subscription_expired(&self, user_id: i64, _plan: &str) {
            self.events.lock().unwrap().push(Event::Expired(user_id));
        }

        async fn subscription_expiring(&self, user_id: i64, days_left: i64) {
            self.events.lock().unwrap().push(Event::Expiring(user_id, days_left));
        }

        async fn node_unreachable(&self, node_id: &str, _reason: &str) {
            self.events.lock().unwrap().push(Event::NodeDown(node_id.into()));
        }
    }

    // ── Harness ──────────────────────────────────────────────────────────

    struct Harness {
        engine: Arc<ReconcileEngine>,
        panel: Arc<FakePanel>,
        notifier: Arc<RecordingNotifier>,
    }

    fn identity(user_id: i64) -> Identity {
        Identity::new(user_id, Uuid::new_v4())
    }

    fn sub_ending(user_id: i64, ends_at: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id,
            plan: "1_month".into(),
            starts_at: ends_at - Duration::days(30),
            ends_at,
            cost: 15.0,
        }
    }

    async fn harness(ledger: FakeLedger) -> Harness {
        let panel = Arc::new(FakePanel::default());
        let factory: ClientFactory = {
            let panel = Arc::clone(&panel);
            Arc::new(move |_d: &NodeDescriptor| {
                let client: Arc<dyn PanelApi> = panel.clone();
                Ok(client)
            })
        };
        let descriptor = NodeDescriptor {
            id: "a".into(),
            name: "A".into(),
            address: url::Url::parse("http://example.net:1").unwrap(),
            username: "admin".into(),
            password: "pw".into(),
            fresh: false,
            uptime_secs: 0,
            last_seen_at: None,
        };
        let ledger: Arc<dyn Ledger> = Arc::new(ledger);
        let pool = SessionPool::new(
            vec![descriptor],
            Arc::clone(&ledger),
            factory,
            ProvisioningDefaults {
                inbound_id: 2,
                ip_limit: 5,
                flow: "xtls-rprx-vision".into(),
            },
        );
        pool.refresh().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let sink: Arc<dyn Notifier> = notifier.clone();
        let engine = ReconcileEngine::new(pool, ledger, sink);
        Harness {
            engine,
            panel,
            notifier,
        }
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_upsert_pushes_enabled_state() {
        let now = Utc::now();
        let id = identity(1);
        let sub = sub_ending(1, now + Duration::days(30));
        let h = harness(FakeLedger::default()).await;

        let applied = h.engine.subscription_upserted(&id, &sub, now).await;
        assert_eq!(applied, 1);

        let upserts = h.panel.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].enabled);
        assert_eq!(upserts[0].expires_at_ms, sub.ends_at.timestamp_millis());
        assert_eq!(upserts[0].ip_limit, 5);
    }

    #[tokio::test]
    async fn test_removed_pushes_disabled_not_delete() {
        let now = Utc::now();
        let id = identity(1);
        let h = harness(FakeLedger::default()).await;

        h.engine.subscription_removed(&id, now).await;

        let upserts = h.panel.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert!(!upserts[0].enabled);
        assert_eq!(upserts[0].expires_at_ms, now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_expiry_sweep_day_boundary() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 11, 0, 5, 0)
            .single()
            .unwrap();
        let yesterday_ten = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).single().unwrap();
        let today_midnight = Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).single().unwrap();

        let ledger = FakeLedger {
            users: vec![identity(1), identity(2)],
            subs: vec![sub_ending(1, yesterday_ten), sub_ending(2, today_midnight)],
        };
        let h = harness(ledger).await;

        let closed = h.engine.expiry_sweep(now).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(*h.notifier.events.lock().unwrap(), vec![Event::Expired(1)]);

        // Only user 1's credential was disabled.
        let upserts = h.panel.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].identity.user_id, 1);
        assert!(!upserts[0].enabled);
    }

    #[tokio::test]
    async fn test_expiry_sweep_skips_orphan_and_continues() {
        let now = Utc.with_ymd_and_hms(2026, 3, 11, 0, 5, 0).single().unwrap();
        let yesterday = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().unwrap();

        // User 7 has no ledger identity; user 8 does.
        let ledger = FakeLedger {
            users: vec![identity(8)],
            subs: vec![sub_ending(7, yesterday), sub_ending(8, yesterday)],
        };
        let h = harness(ledger).await;

        let closed = h.engine.expiry_sweep(now).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(*h.notifier.events.lock().unwrap(), vec![Event::Expired(8)]);
    }

    #[tokio::test]
    async fn test_near_expiry_exact_buckets() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).single().unwrap();
        let users: Vec<Identity> = (0..5).map(|i| identity(i)).collect();
        // Subscriptions ending 0, 1, 4, 5, and 6 days out.
        let subs = [0i64, 1, 4, 5, 6]
            .iter()
            .enumerate()
            .map(|(i, days)| sub_ending(i as i64, now + Duration::days(*days)))
            .collect();
        let h = harness(FakeLedger { users, subs }).await;

        let notified = h.engine.near_expiry_sweep(now).await.unwrap();
        assert_eq!(notified, 3);

        let events = h.notifier.events.lock().unwrap();
        assert!(events.contains(&Event::Expiring(3, 5)));
        assert!(events.contains(&Event::Expiring(1, 1)));
        assert!(events.contains(&Event::Expiring(0, 0)));
        // 4- and 6-day subscriptions stay silent.
        assert!(!events.iter().any(|e| matches!(e, Event::Expiring(2, _) | Event::Expiring(4, _))));
    }

    #[tokio::test]
    async fn test_health_sweep_alerts_once_per_sweep() {
        let h = harness(FakeLedger::default()).await;
        h.panel.fail_login.store(true, Ordering::SeqCst);

        assert_eq!(h.engine.health_sweep().await, 1);
        assert_eq!(h.engine.health_sweep().await, 1);

        let events = h.notifier.events.lock().unwrap();
        // One alert per sweep, two sweeps.
        assert_eq!(*events, vec![
            Event::NodeDown("a".into()),
            Event::NodeDown("a".into()),
        ]);
        drop(events);

        // Node recovers: the next sweep is silent.
        h.panel.fail_login.store(false, Ordering::SeqCst);
        assert_eq!(h.engine.health_sweep().await, 0);
    }
}
