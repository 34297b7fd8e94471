//! Strict boundary types for automation-client payloads.
//!
//! The sidecar reports chats and participants as loosely shaped JSON; the
//! `Raw*` structs absorb that looseness and everything past this module only
//! ever sees the coerced [`Chat`] and [`Member`] types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat as seen by the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub is_group: bool,
}

/// One group member, normalized at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub phone_number: String,
    pub display_name: String,
    pub join_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_date: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Wire shape of a chat from the sidecar. Fields are optional because the
/// underlying web client omits them for some chat kinds.
#[derive(Debug, Deserialize)]
pub struct RawChat {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "title", alias = "subject")]
    pub name: Option<String>,
    #[serde(default, alias = "isGroup")]
    pub is_group: bool,
}

impl RawChat {
    /// Coerce into a strict [`Chat`], or `None` when the payload is missing
    /// the fields nothing downstream can work without.
    pub fn into_chat(self) -> Option<Chat> {
        let id = self.id.filter(|s| !s.trim().is_empty())?;
        let name = self.name.unwrap_or_default();
        if name.trim().is_empty() {
            tracing::debug!(chat = %id, "dropping chat without a usable name");
            return None;
        }
        Some(Chat {
            id,
            name: name.trim().to_string(),
            is_group: self.is_group,
        })
    }
}

/// Wire shape of a group participant from the sidecar.
#[derive(Debug, Deserialize)]
pub struct RawParticipant {
    #[serde(default, alias = "phoneNumber", alias = "number")]
    pub phone: Option<String>,
    #[serde(default, alias = "displayName", alias = "pushname")]
    pub name: Option<String>,
}

impl RawParticipant {
    /// Normalize into a [`Member`] with a fresh join timestamp. Participants
    /// without any phone identifier are unusable and dropped.
    pub fn into_member(self, joined: DateTime<Utc>) -> Option<Member> {
        let phone = self.phone.filter(|s| !s.trim().is_empty())?;
        let phone = phone.trim().to_string();
        let display_name = self
            .name
            .filter(|s| !s.trim().is_empty())
            .map_or_else(|| phone.clone(), |n| n.trim().to_string());
        Some(Member {
            phone_number: phone,
            display_name,
            join_date: joined,
            left_date: None,
            is_active: true,
        })
    }
}
