//! Session-based HTTP client for a single panel node.

use std::time::Duration;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::de::DeserializeOwned,
    tracing::{debug, info, warn},
    url::Url,
};

use fleetpass_common::{CredentialState, FleetError, NodeDescriptor};

use crate::types::{ApiEnvelope, ClientConfig, ClientTraffic, Inbound};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote operations one node exposes. The session pool talks to nodes
/// exclusively through this trait so tests can stand in fake fleets.
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Authenticate the session. Failure is an outcome, not a panic: the
    /// caller records it as node state.
    async fn login(&self) -> Result<(), FleetError>;

    /// All inbound entries with their raw nested configuration.
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, FleetError>;

    /// The credential stored under `email`, or `None` when absent.
    async fn get_client(
        &self,
        inbound_id: u32,
        email: &str,
    ) -> Result<Option<ClientConfig>, FleetError>;

    /// Create or update the credential for `state.identity`. Repeated
    /// calls with the same state converge to the same remote record.
    async fn upsert_client(&self, inbound_id: u32, state: &CredentialState)
    -> Result<(), FleetError>;

    /// Upload/download counters for `email`, or `None` when the node has
    /// never seen that credential.
    async fn client_traffic(&self, email: &str) -> Result<Option<(i64, i64)>, FleetError>;
}

/// Live panel client: form login into a cookie session, then JSON calls
/// under `/panel/api/inbounds/`.
pub struct PanelClient {
    node_id: String,
    base: Url,
    username: String,
    password: Secret<String>,
    http: reqwest::Client,
}

impl PanelClient {
    pub fn new(descriptor: &NodeDescriptor) -> Result<Self, FleetError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FleetError::remote(&descriptor.id, e))?;
        Ok(Self {
            node_id: descriptor.id.clone(),
            base: descriptor.address.clone(),
            username: descriptor.username.clone(),
            password: Secret::new(descriptor.password.clone()),
            http,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<ApiEnvelope<T>, FleetError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(FleetError::remote(&self.node_id, format!("HTTP {status}")));
        }
        resp.json::<ApiEnvelope<T>>()
            .await
            .map_err(|e| FleetError::malformed(&self.node_id, e))
    }

    /// Serialize the single-client `settings` payload the mutation
    /// endpoints expect (a JSON string nested inside the JSON body).
    fn client_payload(inbound_id: u32, state: &CredentialState) -> serde_json::Value {
        let client = ClientConfig {
            id: state.identity.key.to_string(),
            email: state.identity.external_key(),
            enable: state.enabled,
            flow: state.flow.clone(),
            limit_ip: state.ip_limit,
            expiry_time: state.expires_at_ms,
            total_gb: 0,
            tg_id: String::new(),
            sub_id: String::new(),
        };
        let settings = serde_json::json!({ "clients": [client] });
        serde_json::json!({
            "id": inbound_id,
            "settings": settings.to_string(),
        })
    }
}

#[async_trait]
impl PanelApi for PanelClient {
    async fn login(&self) -> Result<(), FleetError> {
        let resp = self
            .http
            .post(self.endpoint("login"))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.expose_secret().as_str()),
            ])
            .send()
            .await
            .map_err(|e| FleetError::AuthFailure {
                node: self.node_id.clone(),
                reason: e.to_string(),
            })?;

        let env: ApiEnvelope<serde_json::Value> = self.decode(resp).await?;
        if !env.success {
            return Err(FleetError::AuthFailure {
                node: self.node_id.clone(),
                reason: if env.msg.is_empty() {
                    "credentials rejected".into()
                } else {
                    env.msg
                },
            });
        }
        info!(node = %self.node_id, "logged in");
        Ok(())
    }

    async fn list_inbounds(&self) -> Result<Vec<Inbound>, FleetError> {
        let resp = self
            .http
            .get(self.endpoint("panel/api/inbounds/list"))
            .send()
            .await
            .map_err(|e| FleetError::remote(&self.node_id, e))?;

        let env: ApiEnvelope<Vec<Inbound>> = self.decode(resp).await?;
        if !env.success {
            return Err(FleetError::remote(&self.node_id, env.msg));
        }
        Ok(env.obj.unwrap_or_default())
    }

    async fn get_client(
        &self,
        inbound_id: u32,
        email: &str,
    ) -> Result<Option<ClientConfig>, FleetError> {
        // The panel has no per-client read endpoint; the client list rides
        // inside the inbound's settings blob.
        let inbounds = self.list_inbounds().await?;
        let Some(inbound) = inbounds.iter().find(|i| i.id == inbound_id) else {
            return Ok(None);
        };
        let settings = inbound
            .parse_settings()
            .map_err(|e| FleetError::malformed(&self.node_id, e))?;
        Ok(settings.clients.into_iter().find(|c| c.email == email))
    }

    async fn upsert_client(
        &self,
        inbound_id: u32,
        state: &CredentialState,
    ) -> Result<(), FleetError> {
        let existing = self.get_client(inbound_id, &state.identity.external_key()).await?;

        let path = match existing {
            Some(_) => format!("panel/api/inbounds/updateClient/{}", state.identity.key),
            None => "panel/api/inbounds/addClient".to_string(),
        };
        debug!(
            node = %self.node_id,
            user = state.identity.user_id,
            enabled = state.enabled,
            update = existing.is_some(),
            "upserting credential"
        );

        let resp = self
            .http
            .post(self.endpoint(&path))
            .json(&Self::client_payload(inbound_id, state))
            .send()
            .await
            .map_err(|e| FleetError::remote(&self.node_id, e))?;

        let env: ApiEnvelope<serde_json::Value> = self.decode(resp).await?;
        if !env.success {
            warn!(node = %self.node_id, user = state.identity.user_id, msg = %env.msg,
                "credential upsert rejected");
            return Err(FleetError::remote(&self.node_id, env.msg));
        }
        Ok(())
    }

    async fn client_traffic(&self, email: &str) -> Result<Option<(i64, i64)>, FleetError> {
        let resp = self
            .http
            .get(self.endpoint(&format!("panel/api/inbounds/getClientTraffics/{email}")))
            .send()
            .await
            .map_err(|e| FleetError::remote(&self.node_id, e))?;

        let env: ApiEnvelope<ClientTraffic> = self.decode(resp).await?;
        if !env.success {
            return Err(FleetError::remote(&self.node_id, env.msg));
        }
        Ok(env.obj.map(|t| (t.up, t.down)))
    }
}
