//! Presence status types for participant online/away/offline tracking.

use serde::{Deserialize, Serialize};

use crate::message::{PrincipalId, Timestamp};

/// Presence status of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    /// Principal is actively using a client.
    Online,
    /// Principal is idle.
    Away,
    /// Principal has no connected client.
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A presence change published by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// The principal whose presence changed.
    pub principal: PrincipalId,
    /// The new presence status.
    pub status: PresenceStatus,
    /// When the status changed.
    pub at: Timestamp,
}
