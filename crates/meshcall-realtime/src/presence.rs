//! Presence members and the roster of a presence channel.

use meshcall_common::PeerId;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

/// A member of a presence channel: its id plus whatever identity the server
/// published for it (`user_info`).
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: PeerId,
    pub info: Value,
}

impl Member {
    pub fn new(id: impl Into<PeerId>, info: Value) -> Self {
        Self {
            id: id.into(),
            info,
        }
    }

    /// Display name from `user_info.name`, if published.
    pub fn name(&self) -> Option<&str> {
        self.info.get("name").and_then(Value::as_str)
    }

    /// Parse a `{user_id, user_info}` object, as carried by `member_added`
    /// frames and by the authorizer's `channel_data`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = PeerId::from_json(payload.get("user_id")?)?;
        let info = payload.get("user_info").cloned().unwrap_or(Value::Null);
        Some(Self { id, info })
    }

    /// Parse the JSON string the authorizer returns as `channel_data`.
    pub fn from_channel_data(channel_data: &str) -> Option<Self> {
        serde_json::from_str::<Value>(channel_data)
            .ok()
            .and_then(|value| Self::from_payload(&value))
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Members of one presence subscription, unique by id, iterated in join order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    members: Vec<Member>,
}

impl Roster {
    /// Build the initial roster from a `subscription_succeeded` payload:
    /// `{"presence": {"ids": [...], "hash": {id: info}, "count": n}}`.
    ///
    /// `ids` gives the order; ids only present in `hash` are appended.
    pub fn from_subscription(payload: &Value) -> Self {
        let mut roster = Self::default();
        let Some(presence) = payload.get("presence") else {
            return roster;
        };
        let hash = presence.get("hash").and_then(Value::as_object);
        let info_for = |id: &PeerId| {
            hash.and_then(|h| h.get(id.as_str()))
                .cloned()
                .unwrap_or(Value::Null)
        };

        if let Some(ids) = presence.get("ids").and_then(Value::as_array) {
            for id in ids.iter().filter_map(PeerId::from_json) {
                let info = info_for(&id);
                roster.upsert(Member { id, info });
            }
        }
        if let Some(hash) = hash {
            for (id, info) in hash {
                let id = PeerId::new(id.as_str());
                if !roster.contains(&id) {
                    roster.upsert(Member {
                        id,
                        info: info.clone(),
                    });
                }
            }
        }
        roster
    }

    /// Insert a member, or replace the info of an existing one in place.
    /// Returns `true` if the id was new.
    pub fn upsert(&mut self, member: Member) -> bool {
        match self.members.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => {
                existing.info = member.info;
                false
            }
            None => {
                self.members.push(member);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Member> {
        let index = self.members.iter().position(|m| &m.id == id)?;
        Some(self.members.remove(index))
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
