//! Basic type definitions for the relay server
//!
//! Provides the `ClientId` newtype: a server-assigned, strictly monotonic
//! numeric identifier. IDs start at 1 and are never reused within a server
//! lifetime; 0 means "not yet joined to a channel".

use serde::Serialize;

/// Unique client identifier (newtype pattern)
///
/// Wraps the monotonic counter value minted by the channel registry.
/// Serializes as a bare number so it can appear in `user_ids` lists and
/// `origin` fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    /// The sentinel value carried by clients that have not joined a channel.
    pub const UNASSIGNED: ClientId = ClientId(0);

    /// Whether this ID has been minted by the registry.
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
