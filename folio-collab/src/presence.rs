//! Who else is in the document, and where their cursor is.
//!
//! ```text
//! Frame::PresenceSync(members) ──▶ PresenceRoom::reconcile()   full rebuild, self excluded
//! Cursor / Selection broadcast ──▶ PresenceRoom::apply_cursor() / apply_selection()
//! unknown user ids             ──▶ ProfileCache (batched lookup) ──▶ apply_profiles()
//! ```

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profiles::UserProfile;
use crate::protocol::PresenceMeta;

/// Participant colors. A user's color is a stable hash of their id into this list.
pub const PALETTE: [&str; 12] = [
    "#e53935", "#d81b60", "#8e24aa", "#5e35b1", "#3949ab", "#1e88e5", "#00897b", "#43a047",
    "#7cb342", "#fdd835", "#fb8c00", "#6d4c41",
];

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Palette color for `user_id`. The same id always yields the same color.
pub fn color_for(user_id: Uuid) -> &'static str {
    PALETTE[(fnv1a(user_id.as_bytes()) % PALETTE.len() as u64) as usize]
}

/// A remote participant as rendered by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub display_name: Option<String>,
    pub color: String,
    pub cursor: Option<usize>,
    pub selection: Option<(usize, usize)>,
    pub joined_at: u64,
}

impl PresenceRecord {
    fn new(user_id: Uuid, display_name: Option<String>, joined_at: u64) -> Self {
        Self {
            user_id,
            display_name,
            color: color_for(user_id).to_string(),
            cursor: None,
            selection: None,
            joined_at,
        }
    }
}

/// Remote participants of one document channel.
#[derive(Debug)]
pub struct PresenceRoom {
    local_user_id: Uuid,
    peers: HashMap<Uuid, PresenceRecord>,
    names: HashMap<Uuid, String>,
}

impl PresenceRoom {
    pub fn new(local_user_id: Uuid) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    /// Rebuilds the participant set from a full presence snapshot.
    ///
    /// Cursor and selection of users still present carry over. Returns ids
    /// that still need a profile lookup.
    pub fn reconcile(&mut self, members: &[PresenceMeta]) -> Vec<Uuid> {
        let mut previous = std::mem::take(&mut self.peers);
        for member in members {
            if member.user_id == self.local_user_id {
                continue;
            }
            if let Some(name) = &member.display_name {
                self.names.insert(member.user_id, name.clone());
            }
            let name = self.names.get(&member.user_id).cloned();
            let record = self
                .peers
                .entry(member.user_id)
                .or_insert_with(|| PresenceRecord::new(member.user_id, name, member.joined_at));
            record.joined_at = record.joined_at.min(member.joined_at);
            if let Some(old) = previous.remove(&member.user_id) {
                record.cursor = old.cursor;
                record.selection = old.selection;
            }
        }
        self.unknown_users()
    }

    /// Returns false if the cursor came from someone not in the room.
    pub fn apply_cursor(&mut self, user_id: Uuid, position: usize) -> bool {
        match self.peer_mut(user_id) {
            Some(peer) => {
                peer.cursor = Some(position);
                true
            }
            None => false,
        }
    }

    pub fn apply_selection(&mut self, user_id: Uuid, from: usize, to: usize) -> bool {
        match self.peer_mut(user_id) {
            Some(peer) => {
                peer.selection = Some((from.min(to), from.max(to)));
                true
            }
            None => false,
        }
    }

    fn peer_mut(&mut self, user_id: Uuid) -> Option<&mut PresenceRecord> {
        if user_id == self.local_user_id {
            return None;
        }
        self.peers.get_mut(&user_id)
    }

    pub fn apply_profiles(&mut self, profiles: &[UserProfile]) {
        for profile in profiles {
            self.names
                .insert(profile.user_id, profile.display_name.clone());
            if let Some(peer) = self.peers.get_mut(&profile.user_id) {
                peer.display_name = Some(profile.display_name.clone());
            }
        }
    }

    /// Present users whose display name is not known yet.
    pub fn unknown_users(&self) -> Vec<Uuid> {
        self.peers
            .values()
            .filter(|p| p.display_name.is_none())
            .map(|p| p.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Participants ordered by join time.
    pub fn peers(&self) -> Vec<&PresenceRecord> {
        let mut peers: Vec<&PresenceRecord> = self.peers.values().collect();
        peers.sort_by_key(|p| (p.joined_at, p.user_id));
        peers
    }

    pub fn peer(&self, user_id: Uuid) -> Option<&PresenceRecord> {
        self.peers.get(&user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
