//! Typed shapes for the panel API's nested configuration.

use serde::{Deserialize, Serialize};

/// Standard response wrapper: `{ success, msg, obj }`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Option::default")]
    pub obj: Option<T>,
}

/// One inbound entry as the panel returns it. `settings` and
/// `stream_settings` are JSON-encoded strings; parse them through
/// [`Inbound::parse_settings`] / [`Inbound::parse_stream`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub id: u32,
    pub port: u16,
    #[serde(default)]
    pub settings: String,
    #[serde(default)]
    pub stream_settings: String,
}

impl Inbound {
    pub fn parse_settings(&self) -> serde_json::Result<InboundSettings> {
        serde_json::from_str(&self.settings)
    }

    pub fn parse_stream(&self) -> serde_json::Result<StreamSettings> {
        serde_json::from_str(&self.stream_settings)
    }
}

/// Decoded `settings` blob: the inbound's client list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// One node-local credential record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Client UUID — the identity's secret key.
    pub id: String,
    /// External key — the numeric user id rendered as a string.
    pub email: String,
    pub enable: bool,
    pub flow: String,
    pub limit_ip: u32,
    /// Epoch milliseconds; 0 means no expiry.
    pub expiry_time: i64,
    #[serde(rename = "totalGB")]
    pub total_gb: i64,
    pub tg_id: String,
    pub sub_id: String,
}

/// Decoded `streamSettings` blob: transport and security configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    pub reality_settings: RealitySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealitySettings {
    pub server_names: Vec<String>,
    pub short_ids: Vec<String>,
    /// Nested handshake parameters (the panel nests a second `settings`
    /// object inside `realitySettings`).
    pub settings: RealityHandshake,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealityHandshake {
    pub public_key: String,
    pub fingerprint: String,
}

/// Per-client transfer counters.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientTraffic {
    #[serde(default)]
    pub email: String,
    pub up: i64,
    pub down: i64,
}

/// An inbound shaped like a real panel response, with the doubly encoded
/// settings blobs. Shared by the type and link-builder tests.
#[cfg(test)]
pub(crate) fn sample_inbound() -> Inbound {
    let settings = serde_json::json!({
        "clients": [
            {
                "id": "3c3a5a3e-9f6f-4c7e-a6b6-0f0d6a1f2b9a",
                "email": "42",
                "enable": true,
                "flow": "xtls-rprx-vision",
                "limitIp": 5,
                "expiryTime": 1717200000000i64,
                "totalGB": 0,
                "tgId": "",
                "subId": ""
            },
            {
                "id": "77e2b1de-31f0-4a11-9d2c-6a8e4f0cbb1d",
                "email": "43",
                "enable": false,
                "flow": "",
                "limitIp": 5,
                "expiryTime": 0,
                "totalGB": 0,
                "tgId": "",
                "subId": ""
            }
        ]
    });
    let stream = serde_json::json!({
        "network": "tcp",
        "security": "reality",
        "realitySettings": {
            "serverNames": ["x.com", "y.com"],
            "shortIds": ["abc", "def"],
            "settings": {
                "publicKey": "pbk123",
                "fingerprint": "chrome"
            }
        }
    });
    Inbound {
        id: 2,
        port: 443,
        settings: settings.to_string(),
        stream_settings: stream.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_settings() {
        let inbound = sample_inbound();
        let settings = inbound.parse_settings().unwrap();
        assert_eq!(settings.clients.len(), 2);
        assert_eq!(settings.clients[0].email, "42");
        assert_eq!(settings.clients[0].limit_ip, 5);
        assert!(settings.clients[0].enable);
    }

    #[test]
    fn test_parse_stream_settings() {
        let inbound = sample_inbound();
        let stream = inbound.parse_stream().unwrap();
        assert_eq!(stream.security, "reality");
        assert_eq!(stream.reality_settings.server_names, vec!["x.com", "y.com"]);
        assert_eq!(stream.reality_settings.settings.public_key, "pbk123");
    }

    #[test]
    fn test_empty_blobs_parse_to_defaults() {
        let inbound = Inbound {
            id: 1,
            port: 80,
            settings: "{}".into(),
            stream_settings: "{}".into(),
        };
        assert!(inbound.parse_settings().unwrap().clients.is_empty());
        assert_eq!(inbound.parse_stream().unwrap().network, "");
    }

    #[test]
    fn test_envelope_without_obj() {
        let env: ApiEnvelope<Vec<Inbound>> =
            serde_json::from_str(r#"{"success": false, "msg": "nope"}"#).unwrap();
        assert!(!env.success);
        assert!(env.obj.is_none());
    }
}
