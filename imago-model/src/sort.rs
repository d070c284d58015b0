//! Sort fields, directions, and score arithmetic for the cross-collection
//! index.
//!
//! Scores are stored pre-inverted: `+v` for ascending, `-v` for
//! descending, so every read is a single ascending rank-based range. Name
//! ordering uses FNV-1a over lowercased UTF-8 bytes; a process-dependent
//! hash would reshuffle ranks across restarts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::summary::CollectionSummary;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    UpdatedAt,
    CreatedAt,
    Name,
    ImageCount,
    TotalSize,
}

impl SortField {
    pub const ALL: [SortField; 5] = [
        SortField::UpdatedAt,
        SortField::CreatedAt,
        SortField::Name,
        SortField::ImageCount,
        SortField::TotalSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::UpdatedAt => "updatedAt",
            SortField::CreatedAt => "createdAt",
            SortField::Name => "name",
            SortField::ImageCount => "imageCount",
            SortField::TotalSize => "totalSize",
        }
    }

    /// Intrinsic ordering value of a summary under this field.
    pub fn value_of(&self, summary: &CollectionSummary) -> f64 {
        match self {
            SortField::UpdatedAt => summary.updated_at.timestamp_millis() as f64,
            SortField::CreatedAt => summary.created_at.timestamp_millis() as f64,
            SortField::Name => fnv1a64(summary.name.to_lowercase().as_bytes()) as f64,
            SortField::ImageCount => summary.image_count as f64,
            SortField::TotalSize => summary.total_size as f64,
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updatedAt" => Ok(SortField::UpdatedAt),
            "createdAt" => Ok(SortField::CreatedAt),
            "name" => Ok(SortField::Name),
            "imageCount" => Ok(SortField::ImageCount),
            "totalSize" => Ok(SortField::TotalSize),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub const ALL: [SortDirection; 2] = [SortDirection::Asc, SortDirection::Desc];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    /// Applies the storage-side inversion so reads are always ascending.
    pub fn score(&self, value: f64) -> f64 {
        match self {
            SortDirection::Asc => value,
            SortDirection::Desc => -value,
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(()),
        }
    }
}

/// FNV-1a over raw bytes. Stable across platforms and process restarts.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Published FNV-1a 64-bit test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn name_hash_is_case_insensitive_via_lowercasing() {
        assert_eq!(
            fnv1a64("Alpha".to_lowercase().as_bytes()),
            fnv1a64("ALPHA".to_lowercase().as_bytes()),
        );
    }

    #[test]
    fn descending_scores_invert_order() {
        let asc = [
            SortDirection::Asc.score(1.0),
            SortDirection::Asc.score(2.0),
        ];
        let desc = [
            SortDirection::Desc.score(1.0),
            SortDirection::Desc.score(2.0),
        ];
        assert!(asc[0] < asc[1]);
        assert!(desc[0] > desc[1]);
    }
}
