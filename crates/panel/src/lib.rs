//! Client for one remote access-gateway panel node.
//!
//! The panel speaks a session-cookie HTTP API: a form login followed by
//! CRUD over a per-inbound client list. Inbound configuration arrives as
//! doubly-encoded JSON (the `settings` and `streamSettings` fields are
//! JSON strings inside a JSON document); `types` parses it once at the
//! ingestion boundary so nothing downstream touches untyped maps.

pub mod client;
pub mod link;
pub mod types;

pub use {
    client::{PanelApi, PanelClient},
    link::render_link,
    types::{ClientConfig, ClientTraffic, Inbound, InboundSettings, StreamSettings},
};
