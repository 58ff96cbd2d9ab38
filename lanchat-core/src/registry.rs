//! Transfer registry: owns every live session, keyed by (peer, file name).

use std::collections::HashMap;
use std::path::Path;

use crate::identity::PeerCode;
use crate::transfer::{Direction, SessionId, TransferSession};

#[derive(Debug, Default)]
pub struct TransferRegistry {
    sessions: HashMap<SessionId, TransferSession>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a session. Rejected when a non-terminal session with the same key exists.
    pub fn add(&mut self, session: TransferSession) -> Result<SessionId, RegistryError> {
        if let Some(existing) = self.find(session.peer(), session.file_name()) {
            return Err(RegistryError::Duplicate {
                peer: existing.peer(),
                file_name: existing.file_name().to_string(),
            });
        }
        let id = session.id();
        self.sessions.insert(id, session);
        Ok(id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<TransferSession> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&TransferSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut TransferSession> {
        self.sessions.get_mut(&id)
    }

    /// The live (non-terminal) session for this key, either direction.
    pub fn find(&self, peer: PeerCode, file_name: &str) -> Option<&TransferSession> {
        self.sessions
            .values()
            .find(|s| !s.is_terminal() && s.peer() == peer && s.file_name() == file_name)
    }

    /// Like `find`, restricted to one direction.
    pub fn find_directed(
        &self,
        peer: PeerCode,
        file_name: &str,
        direction: Direction,
    ) -> Option<&TransferSession> {
        self.find(peer, file_name)
            .filter(|s| s.direction() == direction)
    }

    /// True while an accepted receive session still owns `path`. Undecided offers claim nothing.
    pub fn receiving_into(&self, path: &Path) -> bool {
        self.sessions.values().any(|s| {
            s.direction() == Direction::Receive && !s.is_undecided() && s.path() == path
        })
    }

    /// Live sessions with one peer.
    pub fn with_peer(&self, peer: PeerCode) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.peer() == peer && !s.is_terminal())
            .map(|s| s.id())
            .collect()
    }

    /// Snapshot of every session, sending first, then by file name.
    pub fn list(&self) -> Vec<TransferSession> {
        let mut out: Vec<TransferSession> = self.sessions.values().cloned().collect();
        out.sort_by(|a, b| {
            let rank = |s: &TransferSession| (s.direction() == Direction::Receive) as u8;
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.file_name().cmp(b.file_name()))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a transfer of '{file_name}' with {peer} is already active")]
    Duplicate { peer: PeerCode, file_name: String },
}
