//! Identity and ordering types for socialsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a string newtype with the conversions every id needs.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from anything string-like.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the underlying string is empty.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a signed-in remote account (e.g. the provider's user id).
    AccountId
);

string_id!(
    /// Stable identifier of an entity within one remote account.
    ///
    /// Not globally unique: two accounts may reuse the same value, so anything
    /// keyed across accounts must go through [`NamespacedKey`]. An empty value
    /// marks a locally created entity the remote has not acknowledged yet.
    ExternalId
);

string_id!(
    /// Opaque handle assigned by the local store on first save.
    LocalId
);

string_id!(
    /// Opaque remote version (etag or a `sha256:` payload digest).
    VersionTag
);

string_id!(
    /// Name of one payload field.
    FieldTag
);

impl ExternalId {
    /// External id of an entity that has not been uploaded yet.
    pub fn unassigned() -> Self {
        Self(String::new())
    }

    /// True for locally created entities without a remote identity.
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }
}

/// Continuation token returned by a paginated fetch.
///
/// An empty token is treated exactly like an absent one: the collection is
/// exhausted.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Wrap a provider token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty-but-present tokens signal exhaustion.
    pub fn is_exhausted(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncCursor({:?})", self.0)
    }
}

/// Kind of remote collection being synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    /// Address-book contacts.
    Contacts,
    /// Feed posts.
    Posts,
    /// Photos and albums.
    Images,
    /// Notifications.
    Notifications,
    /// Calendar events.
    CalendarEvents,
}

impl CollectionType {
    /// All collection types, in declaration order.
    pub const ALL: [CollectionType; 5] = [
        CollectionType::Contacts,
        CollectionType::Posts,
        CollectionType::Images,
        CollectionType::Notifications,
        CollectionType::CalendarEvents,
    ];

    /// Stable lowercase name used in storage keys and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Contacts => "contacts",
            CollectionType::Posts => "posts",
            CollectionType::Images => "images",
            CollectionType::Notifications => "notifications",
            CollectionType::CalendarEvents => "calendar_events",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognized collection name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown collection type: {0}")]
pub struct UnknownCollection(pub String);

impl FromStr for CollectionType {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionType::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCollection(s.to_string()))
    }
}

/// One (account, collection) pair: the unit of orchestration and checkpointing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncScope {
    /// Remote account.
    pub account: AccountId,
    /// Collection within the account.
    pub collection: CollectionType,
}

impl SyncScope {
    /// Scope for `collection` of `account`.
    pub fn new(account: impl Into<AccountId>, collection: CollectionType) -> Self {
        Self {
            account: account.into(),
            collection,
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.collection)
    }
}

/// Account-scoped entity key: `accountId + ":" + externalId`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedKey(String);

impl NamespacedKey {
    /// Build the key for an entity of the given account.
    pub fn new(account: &AccountId, external_id: &ExternalId) -> Self {
        Self(format!("{}:{}", account, external_id))
    }

    /// Borrow the joined key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespacedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NamespacedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespacedKey({})", self.0)
    }
}
