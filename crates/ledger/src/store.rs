//! SQLite-backed ledger.

use {
    async_trait::async_trait,
    chrono::{DateTime, NaiveDate, TimeZone, Utc},
    sqlx::SqlitePool,
    uuid::Uuid,
};

use fleetpass_common::{FleetError, Identity, NodeDescriptor, SubscriptionRecord};

use crate::Ledger;

pub struct SqliteLedger {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: i64,
    plan: String,
    starts_at: i64,
    ends_at: i64,
    cost: f64,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    key: String,
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    name: String,
    address: String,
    username: String,
    password: String,
    fresh: i64,
    uptime_secs: i64,
    last_seen_at: Option<i64>,
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn ledger_err(e: impl std::fmt::Display) -> FleetError {
    FleetError::Ledger(e.to_string())
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = FleetError;

    fn try_from(r: SubscriptionRow) -> Result<Self, FleetError> {
        Ok(Self {
            id: Uuid::parse_str(&r.id).map_err(ledger_err)?,
            user_id: r.user_id,
            plan: r.plan,
            starts_at: ms_to_utc(r.starts_at),
            ends_at: ms_to_utc(r.ends_at),
            cost: r.cost,
        })
    }
}

impl TryFrom<UserRow> for Identity {
    type Error = FleetError;

    fn try_from(r: UserRow) -> Result<Self, FleetError> {
        Ok(Self {
            user_id: r.user_id,
            key: Uuid::parse_str(&r.key).map_err(ledger_err)?,
        })
    }
}

impl TryFrom<NodeRow> for NodeDescriptor {
    type Error = FleetError;

    fn try_from(r: NodeRow) -> Result<Self, FleetError> {
        Ok(Self {
            id: r.id,
            name: r.name,
            address: url::Url::parse(&r.address).map_err(ledger_err)?,
            username: r.username,
            password: r.password,
            fresh: r.fresh != 0,
            uptime_secs: r.uptime_secs,
            last_seen_at: r.last_seen_at.map(ms_to_utc),
        })
    }
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the ledger tables if they don't exist.
    pub async fn init(pool: &SqlitePool) -> Result<(), FleetError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                user_id       INTEGER PRIMARY KEY,
                key           TEXT NOT NULL,
                registered_at INTEGER NOT NULL,
                balance       REAL NOT NULL DEFAULT 0
            )"#,
        )
        .execute(pool)
        .await
        .map_err(ledger_err)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS subscriptions (
                id        TEXT PRIMARY KEY,
                user_id   INTEGER NOT NULL,
                plan      TEXT NOT NULL,
                starts_at INTEGER NOT NULL,
                ends_at   INTEGER NOT NULL,
                cost      REAL NOT NULL DEFAULT 0
            )"#,
        )
        .execute(pool)
        .await
        .map_err(ledger_err)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS nodes (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                address      TEXT NOT NULL,
                username     TEXT NOT NULL,
                password     TEXT NOT NULL,
                fresh        INTEGER NOT NULL DEFAULT 1,
                uptime_secs  INTEGER NOT NULL DEFAULT 0,
                last_seen_at INTEGER
            )"#,
        )
        .execute(pool)
        .await
        .map_err(ledger_err)?;

        Ok(())
    }

    /// Register a user if unknown; returns the stable identity either way.
    /// The identity key is generated exactly once and never rotated.
    pub async fn ensure_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<Identity, FleetError> {
        if let Some(identity) = self.identity_for_user(user_id).await? {
            return Ok(identity);
        }
        let identity = Identity::new(user_id, Uuid::new_v4());
        sqlx::query("INSERT INTO users (user_id, key, registered_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(identity.key.to_string())
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(ledger_err)?;
        Ok(identity)
    }

    /// Adjust a user's balance by `amount` (payment webhook glue calls
    /// this on confirmed deposits).
    pub async fn credit_balance(&self, user_id: i64, amount: f64) -> Result<(), FleetError> {
        let res = sqlx::query("UPDATE users SET balance = balance + ? WHERE user_id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(ledger_err)?;
        if res.rows_affected() == 0 {
            return Err(FleetError::Invariant(format!(
                "credit for unknown user {user_id}"
            )));
        }
        Ok(())
    }

    /// Insert or replace a subscription record. Renewals and referral
    /// bonuses mutate `ends_at` through this same path.
    pub async fn upsert_subscription(&self, sub: &SubscriptionRecord) -> Result<(), FleetError> {
        sqlx::query(
            r#"INSERT INTO subscriptions (id, user_id, plan, starts_at, ends_at, cost)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 plan = excluded.plan,
                 ends_at = excluded.ends_at,
                 cost = excluded.cost"#,
        )
        .bind(sub.id.to_string())
        .bind(sub.user_id)
        .bind(&sub.plan)
        .bind(sub.starts_at.timestamp_millis())
        .bind(sub.ends_at.timestamp_millis())
        .bind(sub.cost)
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;
        Ok(())
    }

    /// The active subscription for one user, if any.
    pub async fn active_subscription_for(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionRecord>, FleetError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE user_id = ? AND ends_at > ? ORDER BY ends_at DESC",
        )
        .bind(user_id)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_err)?;
        row.map(TryInto::try_into).transpose()
    }

    /// Reconcile the configured node list with stored operational state:
    /// known nodes keep their uptime/last-seen/fresh fields, unknown ones
    /// are inserted flagged fresh.
    pub async fn merge_nodes(
        &self,
        configured: Vec<NodeDescriptor>,
    ) -> Result<Vec<NodeDescriptor>, FleetError> {
        let mut merged = Vec::with_capacity(configured.len());
        for mut node in configured {
            let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?")
                .bind(&node.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(ledger_err)?;
            if let Some(row) = row {
                let stored = NodeDescriptor::try_from(row)?;
                node.fresh = stored.fresh;
                node.uptime_secs = stored.uptime_secs;
                node.last_seen_at = stored.last_seen_at;
            } else {
                self.persist_node(&node).await?;
            }
            merged.push(node);
        }
        Ok(merged)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn active_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Identity, SubscriptionRecord)>, FleetError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE ends_at > ? ORDER BY user_id ASC",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let sub = SubscriptionRecord::try_from(row)?;
            match self.identity_for_user(sub.user_id).await? {
                Some(identity) => out.push((identity, sub)),
                None => {
                    // Subscription without a user: log and skip, never
                    // abort the whole listing.
                    tracing::error!(user = sub.user_id, sub = %sub.id,
                        "subscription references unknown user");
                },
            }
        }
        Ok(out)
    }

    async fn persist_node(&self, node: &NodeDescriptor) -> Result<(), FleetError> {
        sqlx::query(
            r#"INSERT INTO nodes (id, name, address, username, password, fresh, uptime_secs, last_seen_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 address = excluded.address,
                 username = excluded.username,
                 password = excluded.password,
                 fresh = excluded.fresh,
                 uptime_secs = excluded.uptime_secs,
                 last_seen_at = excluded.last_seen_at"#,
        )
        .bind(&node.id)
        .bind(&node.name)
        .bind(node.address.as_str())
        .bind(&node.username)
        .bind(&node.password)
        .bind(node.fresh as i64)
        .bind(node.uptime_secs)
        .bind(node.last_seen_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(ledger_err)?;
        Ok(())
    }

    async fn subscriptions_ending_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<SubscriptionRecord>, FleetError> {
        let start = date
            .and_hms_opt(0, 0, 0)
            .map(|t| Utc.from_utc_datetime(&t).timestamp_millis())
            .ok_or_else(|| FleetError::Ledger("invalid date".into()))?;
        let end = start + 86_400_000;

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE ends_at >= ? AND ends_at < ? ORDER BY user_id ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn identity_for_user(&self, user_id: i64) -> Result<Option<Identity>, FleetError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT user_id, key FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_err)?;
        row.map(TryInto::try_into).transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn ledger() -> SqliteLedger {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteLedger::init(&pool).await.unwrap();
        SqliteLedger::new(pool)
    }

    fn sub(user_id: i64, ends_at: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id,
            plan: "1_month".into(),
            starts_at: ends_at - Duration::days(30),
            ends_at,
            cost: 15.0,
        }
    }

    #[tokio::test]
    async fn test_ensure_user_is_stable() {
        let ledger = ledger().await;
        let now = Utc::now();
        let a = ledger.ensure_user(42, now).await.unwrap();
        let b = ledger.ensure_user(42, now).await.unwrap();
        assert_eq!(a.key, b.key);
    }

    #[tokio::test]
    async fn test_active_subscriptions_joins_identities() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger.ensure_user(1, now).await.unwrap();
        ledger.upsert_subscription(&sub(1, now + Duration::days(10))).await.unwrap();
        // Expired subscription must not appear.
        ledger.upsert_subscription(&sub(1, now - Duration::days(1))).await.unwrap();
        // Orphan subscription (no user row) is skipped, not fatal.
        ledger.upsert_subscription(&sub(99, now + Duration::days(5))).await.unwrap();

        let active = ledger.active_subscriptions(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0.user_id, 1);
    }

    #[tokio::test]
    async fn test_renewal_mutates_end_date() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger.ensure_user(1, now).await.unwrap();

        let mut record = sub(1, now + Duration::days(10));
        ledger.upsert_subscription(&record).await.unwrap();
        record.ends_at = record.ends_at + Duration::days(30);
        ledger.upsert_subscription(&record).await.unwrap();

        let active = ledger.active_subscription_for(1, now).await.unwrap().unwrap();
        assert_eq!(
            active.ends_at.timestamp_millis(),
            record.ends_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_ending_on_day_bounds() {
        let ledger = ledger().await;
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());

        ledger.ensure_user(1, start).await.unwrap();
        // 10:00 inside the day: included.
        ledger.upsert_subscription(&sub(1, start + Duration::hours(10))).await.unwrap();
        // Exactly midnight of the next day: excluded (upper bound).
        ledger.upsert_subscription(&sub(2, start + Duration::days(1))).await.unwrap();
        // Last millisecond of the day: included.
        ledger
            .upsert_subscription(&sub(3, start + Duration::days(1) - Duration::milliseconds(1)))
            .await
            .unwrap();

        let ending = ledger.subscriptions_ending_on(day).await.unwrap();
        let users: Vec<i64> = ending.iter().map(|s| s.user_id).collect();
        assert_eq!(users, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_credit_unknown_user_is_invariant() {
        let ledger = ledger().await;
        let err = ledger.credit_balance(5, 10.0).await.unwrap_err();
        assert!(matches!(err, FleetError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_merge_nodes_keeps_operational_fields() {
        let ledger = ledger().await;
        let now = Utc::now();
        let mut stored = NodeDescriptor {
            id: "us-dallas".into(),
            name: "Dallas".into(),
            address: url::Url::parse("http://a:1").unwrap(),
            username: "admin".into(),
            password: "pw".into(),
            fresh: false,
            uptime_secs: 1234,
            last_seen_at: Some(now),
        };
        ledger.persist_node(&stored).await.unwrap();

        // Config hands the same node back with fresh defaults.
        stored.fresh = true;
        stored.uptime_secs = 0;
        stored.last_seen_at = None;
        let fresh_entry = NodeDescriptor {
            id: "eu-helsinki".into(),
            ..stored.clone()
        };

        let merged = ledger.merge_nodes(vec![stored, fresh_entry]).await.unwrap();
        assert!(!merged[0].fresh);
        assert_eq!(merged[0].uptime_secs, 1234);
        assert!(merged[1].fresh);
    }
}
