use std::sync::Arc;

use {fleetpass_common::NodeDescriptor, fleetpass_panel::PanelApi};

/// Pool-side view of one node's session.
///
/// `Active` means the last login handshake succeeded; `Unreachable` nodes
/// flip back to `Active` only via the next full refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Unreachable,
}

/// Ephemeral pairing of a node descriptor with its authenticated client.
/// Recreated wholesale on every pool refresh; never persisted.
#[derive(Clone)]
pub struct NodeSession {
    pub descriptor: NodeDescriptor,
    pub client: Arc<dyn PanelApi>,
    pub state: NodeState,
}

impl NodeSession {
    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }
}
