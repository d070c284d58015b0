//! Typed identifiers.
//!
//! Collection ids are 12-byte opaque values rendered as 24-character lower
//! hex, matching the document-store convention the aggregates use on the
//! wire. Everything else is a UUID newtype.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid collection id `{0}`: expected 24 hex characters")]
    CollectionId(String),
    #[error("invalid uuid `{0}`")]
    Uuid(String),
}

/// 12-byte opaque collection identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId([u8; 12]);

impl CollectionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&Uuid::new_v4().into_bytes()[..12]);
        Self(bytes)
    }

    /// Short hex prefix used to shard derivative files on disk.
    pub fn prefix(&self) -> String {
        format!("{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionId({self})")
    }
}

impl FromStr for CollectionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdParseError::CollectionId(s.to_string()));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| IdParseError::CollectionId(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for CollectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CollectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| IdParseError::Uuid(s.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Identifier of an owning library.
    LibraryId
);
uuid_id!(
    /// Identifier of an embedded image within a collection.
    ImageId
);
uuid_id!(
    /// Identifier of a background pipeline job.
    JobId
);
uuid_id!(
    /// Identifier of a configured cache folder.
    CacheFolderId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_id_round_trips_through_hex() {
        let id = CollectionId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 24);
        let parsed: CollectionId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn collection_id_rejects_malformed_input() {
        assert!("not-hex".parse::<CollectionId>().is_err());
        assert!("abcd".parse::<CollectionId>().is_err());
        assert!(
            "zzzzzzzzzzzzzzzzzzzzzzzz".parse::<CollectionId>().is_err(),
            "non-hex characters must be rejected"
        );
    }

    #[test]
    fn prefix_is_first_two_bytes() {
        let id: CollectionId = "abcd00000000000000000000".parse().unwrap();
        assert_eq!(id.prefix(), "abcd");
    }
}
