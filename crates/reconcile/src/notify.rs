use {
    async_trait::async_trait,
    tracing::{info, warn},
};

/// User and operator notification sink.
///
/// The bot front-end supplies the real implementation; this crate only
/// decides *when* to notify.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The subscription ended: the user's credentials have been disabled.
    async fn subscription_expired(&self, user_id: i64, plan: &str);

    /// The subscription ends in `days_left` whole days. `0` means the
    /// last day and deserves distinct wording.
    async fn subscription_expiring(&self, user_id: i64, days_left: i64);

    /// A node failed its login probe. Raised once per sweep per node.
    async fn node_unreachable(&self, node_id: &str, reason: &str);
}

/// Log-only notifier, used until a front-end is wired in.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn subscription_expired(&self, user_id: i64, plan: &str) {
        info!(user = user_id, plan, "subscription expired");
    }

    async fn subscription_expiring(&self, user_id: i64, days_left: i64) {
        if days_left == 0 {
            info!(user = user_id, "subscription ends today");
        } else {
            info!(user = user_id, days_left, "subscription expiring");
        }
    }

    async fn node_unreachable(&self, node_id: &str, reason: &str) {
        warn!(node = %node_id, reason, "node unreachable");
    }
}
