//! Pure connection-descriptor builder.
//!
//! Turns one node's raw inbound configuration plus a target identity into
//! the shareable `vless://` link a client application imports. No I/O.

use fleetpass_common::NodeDescriptor;

use crate::types::Inbound;

/// Render the connection link for `external_key` on `node`.
///
/// Locates the inbound with `inbound_id`, decodes its nested settings and
/// stream blobs, and composes the link from the node address, inbound
/// port, client secret, and the reality handshake parameters. The first
/// configured server name and short id are always used (a fixed
/// tie-break, not a search).
///
/// Returns `None` when the inbound id is unknown, the client is absent,
/// or the stream configuration is incomplete — all expected outcomes, not
/// errors.
pub fn render_link(
    node: &NodeDescriptor,
    inbounds: &[Inbound],
    inbound_id: u32,
    external_key: &str,
) -> Option<String> {
    let inbound = inbounds.iter().find(|i| i.id == inbound_id)?;

    let settings = match inbound.parse_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(node = %node.id, inbound = inbound_id, error = %e,
                "undecodable inbound settings");
            return None;
        },
    };
    let stream = match inbound.parse_stream() {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(node = %node.id, inbound = inbound_id, error = %e,
                "undecodable stream settings");
            return None;
        },
    };

    let client = settings.clients.iter().find(|c| c.email == external_key)?;
    let host = node.host()?;

    let reality = &stream.reality_settings;
    let sni = reality.server_names.first()?;
    let sid = reality.short_ids.first()?;

    let query: Vec<(&str, &str)> = vec![
        ("type", stream.network.as_str()),
        ("security", stream.security.as_str()),
        ("pbk", reality.settings.public_key.as_str()),
        ("fp", reality.settings.fingerprint.as_str()),
        ("sni", sni.as_str()),
        ("sid", sid.as_str()),
        ("spx", "/"),
        ("flow", client.flow.as_str()),
    ];
    let query = query
        .into_iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    Some(format!(
        "vless://{}@{}:{}?{}#{}",
        client.id,
        host,
        inbound.port,
        query,
        urlencoding::encode(&node.id),
    ))
}
