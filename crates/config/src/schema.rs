//! Config schema: registered nodes, provisioning defaults, sweep schedules.

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
};

use fleetpass_common::NodeDescriptor;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub database: DatabaseConfig,
    pub provisioning: ProvisioningConfig,
    pub sweeps: SweepConfig,
    /// Operator-registered panel nodes.
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://fleetpass.db?mode=rwc".into(),
        }
    }
}

/// Defaults applied to every credential pushed to the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Inbound entry the fleet provisions clients under.
    pub inbound_id: u32,
    /// Concurrent-IP cap per credential.
    pub ip_limit: u32,
    /// Flow mode written into every credential.
    pub flow: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            inbound_id: 2,
            ip_limit: 5,
            flow: "xtls-rprx-vision".into(),
        }
    }
}

/// Cron expressions (seconds field included) for the scheduled sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub expiry: String,
    pub near_expiry: String,
    pub health: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            expiry: "0 0 0 * * *".into(),
            near_expiry: "0 0 15 * * *".into(),
            health: "0 */5 * * * *".into(),
        }
    }
}

/// One panel node as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub name: String,
    /// Panel base address including any secret path segment.
    pub address: String,
    pub username: String,
    pub password: String,
}

impl NodeEntry {
    /// Parse into a runtime descriptor. A node arriving from config that
    /// the ledger has never seen starts life flagged fresh.
    pub fn to_descriptor(&self) -> anyhow::Result<NodeDescriptor> {
        let address = url::Url::parse(&self.address)
            .with_context(|| format!("node '{}': invalid address '{}'", self.id, self.address))?;
        Ok(NodeDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            address,
            username: self.username.clone(),
            password: self.password.clone(),
            fresh: true,
            uptime_secs: 0,
            last_seen_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.provisioning.inbound_id, 2);
        assert_eq!(cfg.provisioning.ip_limit, 5);
        assert_eq!(cfg.provisioning.flow, "xtls-rprx-vision");
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn test_node_entry_parses_address() {
        let entry = NodeEntry {
            id: "us-dallas".into(),
            name: "Dallas, Texas".into(),
            address: "http://panel.example.net:2053/abc".into(),
            username: "admin".into(),
            password: "pw".into(),
        };
        let d = entry.to_descriptor().unwrap();
        assert_eq!(d.host(), Some("panel.example.net"));
        assert!(d.fresh);
    }

    #[test]
    fn test_node_entry_rejects_bad_address() {
        let entry = NodeEntry {
            id: "bad".into(),
            name: "Bad".into(),
            address: "not a url".into(),
            username: "admin".into(),
            password: "pw".into(),
        };
        assert!(entry.to_descriptor().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let raw = r#"
            [provisioning]
            inbound_id = 7

            [[nodes]]
            id = "eu-helsinki"
            name = "Helsinki"
            address = "https://fi.example.org:8443/panel"
            username = "admin"
            password = "pw"
        "#;
        let cfg: FleetConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.provisioning.inbound_id, 7);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.provisioning.ip_limit, 5);
        assert_eq!(cfg.nodes.len(), 1);
        assert_eq!(cfg.nodes[0].id, "eu-helsinki");
    }
}
