//! Session state and membership tracking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use worldsync_types::{ClientId, SessionId, TransportKind, Vector3};

/// How the local synchronizer came to host a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionRole {
    /// The local side created the session.
    Creator,
    /// The local side joined an existing session.
    Joiner,
}

/// A session member as last announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub client_id: ClientId,
    pub tag: String,
}

impl Member {
    pub fn new(client_id: ClientId, tag: impl Into<String>) -> Self {
        Self {
            client_id,
            tag: tag.into(),
        }
    }
}

/// The shared context a synchronizer hosts.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Human-readable, not unique.
    pub tag: String,
    /// Rebasing offset applied to positions exchanged in this session.
    pub world_offset: Vector3,
    pub transport: TransportKind,
    pub tls: bool,
    pub role: SessionRole,
    /// Creator of the session, once known.
    pub creator: Option<ClientId>,
    members: HashMap<ClientId, Member>,
}

impl Session {
    pub fn new(
        id: SessionId,
        tag: impl Into<String>,
        world_offset: Vector3,
        transport: TransportKind,
        tls: bool,
        role: SessionRole,
    ) -> Self {
        Self {
            id,
            tag: tag.into(),
            world_offset,
            transport,
            tls,
            role,
            creator: None,
            members: HashMap::new(),
        }
    }

    /// Records or refreshes a member. Returns `true` if the member is new.
    pub fn upsert_member(&mut self, member: Member) -> bool {
        self.members
            .insert(member.client_id.clone(), member)
            .is_none()
    }

    /// Removes a member, returning its last-known record.
    pub fn remove_member(&mut self, client_id: &ClientId) -> Option<Member> {
        self.members.remove(client_id)
    }

    pub fn member(&self, client_id: &ClientId) -> Option<&Member> {
        self.members.get(client_id)
    }

    pub fn is_member(&self, client_id: &ClientId) -> bool {
        self.members.contains_key(client_id)
    }

    /// Members sorted by client ID.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_creator(&self) -> bool {
        self.role == SessionRole::Creator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId::new(),
            "lobby",
            Vector3::ZERO,
            TransportKind::Tcp,
            false,
            SessionRole::Joiner,
        )
    }

    #[test]
    fn membership_roundtrip() {
        let mut s = session();
        let alice = ClientId::new("alice").unwrap();
        assert!(s.upsert_member(Member::new(alice.clone(), "Alice")));
        assert!(!s.upsert_member(Member::new(alice.clone(), "Alice B.")));
        assert_eq!(s.member(&alice).unwrap().tag, "Alice B.");
        assert_eq!(s.member_count(), 1);

        let removed = s.remove_member(&alice).unwrap();
        assert_eq!(removed.tag, "Alice B.");
        assert!(!s.is_member(&alice));
        assert!(s.remove_member(&alice).is_none());
    }

    #[test]
    fn members_are_sorted() {
        let mut s = session();
        for name in ["carol", "alice", "bob"] {
            s.upsert_member(Member::new(ClientId::new(name).unwrap(), name));
        }
        let names: Vec<String> = s.members().into_iter().map(|m| m.tag).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }
}
