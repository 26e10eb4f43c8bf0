//! Who is online, who we are, and who we are calling.

use std::collections::BTreeSet;

use protocol::PeerId;

/// Roster and peer selection state.
///
/// The roster is replaced wholesale on every broadcast. The selected peer
/// only changes on explicit request; nothing here picks one on its own.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    local_id: Option<PeerId>,
    roster: BTreeSet<PeerId>,
    selected: Option<PeerId>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the id the signaling server assigned to this endpoint.
    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// Replaces the roster with `peers`.
    pub fn replace_roster(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        self.roster = peers.into_iter().filter(|p| !p.is_empty()).collect();
    }

    /// Every known peer, this endpoint included.
    pub fn roster(&self) -> &BTreeSet<PeerId> {
        &self.roster
    }

    /// Roster without this endpoint, for display.
    pub fn visible_peers(&self) -> Vec<PeerId> {
        self.roster
            .iter()
            .filter(|p| Some(*p) != self.local_id.as_ref())
            .cloned()
            .collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.roster.contains(peer)
    }

    pub fn select(&mut self, peer: Option<PeerId>) {
        self.selected = peer;
    }

    pub fn selected(&self) -> Option<&PeerId> {
        self.selected.as_ref()
    }
}
