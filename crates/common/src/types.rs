//! Common data types for SFU components.
//!
//! Every entity the signaling layer tracks is addressed by a random UUID.
//! Ids are never reused, so a late completion for a destroyed entity can
//! never be mistaken for a live one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a signaling connection (and the peer bound to it)
    ConnectionId
);

entity_id!(
    /// Unique identifier for a media engine worker
    WorkerId
);

entity_id!(
    /// Unique identifier for a router (routing domain)
    RouterId
);

entity_id!(
    /// Unique identifier for a WebRTC transport
    TransportId
);

entity_id!(
    /// Unique identifier for a producer
    ProducerId
);

entity_id!(
    /// Unique identifier for a consumer
    ConsumerId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ProducerId::new(), ProducerId::new());
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = TransportId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let parsed: TransportId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_from_str() {
        let id = ConsumerId::new();
        let parsed: ConsumerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("not-a-uuid".parse::<ConsumerId>().is_err());
    }
}
