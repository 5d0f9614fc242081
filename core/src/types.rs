//! Identifier newtypes for the drop domain.
//!
//! Products, sellers, drops, users, sessions and orders are owned by
//! collaborator systems, so their identifiers are opaque strings. Reservations
//! are owned here and use UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a `", stringify!($name), "` from any string-like value")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume into the raw identifier
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Catalog identifier of a product on sale in a drop
    ProductId
);

string_id!(
    /// Identifier of the seller who owns a product
    SellerId
);

string_id!(
    /// Identifier of a scheduled flash-sale event
    DropId
);

string_id!(
    /// Identifier of a shopper
    UserId
);

string_id!(
    /// Identifier of a shopper's cart/shopping session
    SessionId
);

string_id!(
    /// Identifier of an order in the order service
    OrderId
);

/// Unique identifier for a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ReservationId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_serialize_as_plain_strings() {
        let id = ProductId::new("sku-1");
        assert_eq!(serde_json::to_string(&id).ok().as_deref(), Some("\"sku-1\""));
        assert_eq!(id.to_string(), "sku-1");
    }

    #[test]
    fn reservation_ids_are_unique() {
        assert_ne!(ReservationId::new(), ReservationId::new());
    }
}
