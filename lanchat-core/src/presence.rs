//! Presence: the table of known peers (including me) and the shared topic.

use std::collections::HashMap;

use crate::identity::{PeerCode, PeerIdentity};

/// Default time without any message after which a peer is considered gone.
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 120_000;

/// Peers by code. At most one entry per code; nick uniqueness is negotiated on the wire, not here.
#[derive(Debug, Clone)]
pub struct PresenceTable {
    me: PeerCode,
    peers: HashMap<PeerCode, PeerIdentity>,
}

impl PresenceTable {
    /// New table holding only the local identity.
    pub fn new(me: PeerIdentity) -> Self {
        let code = me.code;
        let mut peers = HashMap::new();
        peers.insert(code, me);
        Self { me: code, peers }
    }

    pub fn me(&self) -> &PeerIdentity {
        // The local entry is inserted at construction and never removed.
        &self.peers[&self.me]
    }

    pub fn me_mut(&mut self) -> &mut PeerIdentity {
        self.peers
            .get_mut(&self.me)
            .unwrap_or_else(|| unreachable!("local identity is never removed"))
    }

    pub fn my_code(&self) -> PeerCode {
        self.me
    }

    pub fn get(&self, code: PeerCode) -> Option<&PeerIdentity> {
        self.peers.get(&code)
    }

    pub fn get_mut(&mut self, code: PeerCode) -> Option<&mut PeerIdentity> {
        self.peers.get_mut(&code)
    }

    pub fn contains(&self, code: PeerCode) -> bool {
        self.peers.contains_key(&code)
    }

    /// Case-insensitive lookup by nick.
    pub fn find_by_nick(&self, nick: &str) -> Option<&PeerIdentity> {
        let wanted = nick.to_lowercase();
        self.peers.values().find(|p| p.nick.to_lowercase() == wanted)
    }

    /// True if any peer other than me uses this nick.
    pub fn is_nick_in_use(&self, nick: &str) -> bool {
        self.find_by_nick(nick).is_some_and(|p| p.code != self.me)
    }

    /// Insert a remote peer. Returns false (and keeps the existing entry) if the code is known.
    pub fn add(&mut self, peer: PeerIdentity) -> bool {
        if self.peers.contains_key(&peer.code) {
            return false;
        }
        self.peers.insert(peer.code, peer);
        true
    }

    /// Remove a remote peer. Me cannot be removed.
    pub fn remove(&mut self, code: PeerCode) -> Option<PeerIdentity> {
        if code == self.me {
            return None;
        }
        self.peers.remove(&code)
    }

    /// Remove every remote peer silent for at least `timeout_ms`. Returns the removed peers.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<PeerIdentity> {
        let me = self.me;
        let stale: Vec<PeerCode> = self
            .peers
            .values()
            .filter(|p| p.code != me && now_ms.saturating_sub(p.last_activity) >= timeout_ms)
            .map(|p| p.code)
            .collect();
        stale.into_iter().filter_map(|c| self.peers.remove(&c)).collect()
    }

    /// Snapshot sorted by nick, me included.
    pub fn list(&self) -> Vec<PeerIdentity> {
        let mut out: Vec<PeerIdentity> = self.peers.values().cloned().collect();
        out.sort_by_key(|p| p.nick.to_lowercase());
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The single shared topic. Last writer wins, by the time it was set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    /// Milliseconds since the Unix epoch; 0 when never set.
    pub time: u64,
}

impl Topic {
    pub fn new(text: impl Into<String>, set_by: impl Into<String>, time: u64) -> Self {
        Self {
            text: text.into(),
            set_by: set_by.into(),
            time,
        }
    }

    /// Apply a topic seen on the wire. Returns true if it replaced the current one.
    pub fn update(&mut self, incoming: Topic) -> bool {
        if incoming.time <= self.time || incoming == *self {
            return false;
        }
        *self = incoming;
        true
    }

    pub fn is_set(&self) -> bool {
        !self.text.is_empty()
    }
}
