use serde::{Deserialize, Serialize};

pub mod call;
pub mod callrecord;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod media;
pub mod signaling;

pub type CallId = String;
pub type ProfileId = String;

/// Role of a family-member profile. Call flows are identical across roles;
/// the role only drives incoming-record matching and notification copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    Parent,
    Child,
    FamilyMember,
}

impl std::fmt::Display for CallerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallerRole::Parent => write!(f, "parent"),
            CallerRole::Child => write!(f, "child"),
            CallerRole::FamilyMember => write!(f, "family_member"),
        }
    }
}

/// Stable `(profile id, role)` pair for one device session. Supplied by the
/// host's identity layer; no authentication happens here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub profile_id: ProfileId,
    pub role: CallerRole,
}

impl Identity {
    pub fn new(profile_id: impl Into<ProfileId>, role: CallerRole) -> Self {
        Self {
            profile_id: profile_id.into(),
            role,
        }
    }
}

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
