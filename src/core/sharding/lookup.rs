// src/core/sharding/lookup.rs

//! Shard key values, key ranges, and the routing algorithms for the three
//! sharding strategies. RANGE and RANGE_STRING binary-search a sorted bound
//! array; HASH maps the key onto a 128-bit ring of hex-encoded digests.

use crate::core::errors::FabricError;
use crate::core::store::entities::ShardingType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;

/// A shard key value as supplied by a routing query or a data row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ShardingKey {
    Int(i64),
    Str(String),
}

impl ShardingKey {
    /// The canonical text form, also used as hash input so that `Int(7)` and
    /// `Str("7")` route identically under HASH.
    pub fn text(&self) -> String {
        match self {
            ShardingKey::Int(v) => v.to_string(),
            ShardingKey::Str(s) => s.clone(),
        }
    }

    /// The 128-bit digest of this key, hex-encoded. Fixed-width hex compares
    /// lexicographically in digest order, so ring bounds are plain strings.
    pub fn digest(&self) -> String {
        let text = self.text();
        let digest = murmur3::murmur3_x64_128(&mut Cursor::new(text.as_bytes()), 0)
            .unwrap_or_default();
        hex::encode(digest.to_be_bytes())
    }
}

impl PartialOrd for ShardingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ShardingKey::Int(a), ShardingKey::Int(b)) => a.cmp(b),
            (ShardingKey::Str(a), ShardingKey::Str(b)) => a.cmp(b),
            // Mixed comparisons fall back to text form; a well-formed mapping
            // never mixes key kinds.
            (a, b) => a.text().cmp(&b.text()),
        }
    }
}

impl fmt::Display for ShardingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// A half-open key interval `[lower, upper)`. `None` means unbounded on that
/// side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Option<ShardingKey>,
    pub upper: Option<ShardingKey>,
}

impl KeyRange {
    pub fn new(lower: Option<ShardingKey>, upper: Option<ShardingKey>) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, key: &ShardingKey) -> bool {
        if let Some(lower) = &self.lower
            && key < lower
        {
            return false;
        }
        if let Some(upper) = &self.upper
            && key >= upper
        {
            return false;
        }
        true
    }
}

/// A row filter evaluated against the shard key column. The `Hash*` variants
/// compare the key's 128-bit digest instead of the raw key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum KeyPredicate {
    All,
    InRange(KeyRange),
    NotInRange(KeyRange),
    HashInRange(KeyRange),
    HashNotInRange(KeyRange),
}

impl KeyPredicate {
    pub fn matches(&self, key: &ShardingKey) -> bool {
        match self {
            KeyPredicate::All => true,
            KeyPredicate::InRange(range) => range.contains(key),
            KeyPredicate::NotInRange(range) => !range.contains(key),
            KeyPredicate::HashInRange(range) => range.contains(&ShardingKey::Str(key.digest())),
            KeyPredicate::HashNotInRange(range) => !range.contains(&ShardingKey::Str(key.digest())),
        }
    }
}

/// One routable shard as seen by the router: its id and typed lower bound.
/// The vector handed to the routing functions must be sorted by bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub shard_id: u64,
    pub bound: ShardingKey,
}

/// Parses a persisted bound string according to the mapping's sharding type.
pub fn parse_bound(sharding_type: ShardingType, raw: &str) -> Result<ShardingKey, FabricError> {
    match sharding_type {
        ShardingType::Range => raw
            .trim()
            .parse::<i64>()
            .map(ShardingKey::Int)
            .map_err(|_| FabricError::Sharding(format!("'{raw}' is not a valid RANGE bound"))),
        ShardingType::RangeString => Ok(ShardingKey::Str(raw.to_string())),
        ShardingType::Hash => {
            let normalized = raw.trim().to_ascii_lowercase();
            if normalized.len() != 32 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(FabricError::Sharding(format!(
                    "'{raw}' is not a valid HASH bound (expected 32 hex digits)"
                )));
            }
            Ok(ShardingKey::Str(normalized))
        }
    }
}

/// Checks that bounds are strictly increasing, which makes the ranges
/// disjoint and covering from the smallest bound upward.
pub fn validate_bounds(entries: &[RouteEntry]) -> Result<(), FabricError> {
    for pair in entries.windows(2) {
        if pair[0].bound >= pair[1].bound {
            return Err(FabricError::Sharding(format!(
                "shard bounds out of order: '{}' is not below '{}'",
                pair[0].bound, pair[1].bound
            )));
        }
    }
    Ok(())
}

/// RANGE / RANGE_STRING routing: the shard with the greatest bound `<= key`.
pub fn route_range(entries: &[RouteEntry], key: &ShardingKey) -> Result<u64, FabricError> {
    let idx = entries.partition_point(|e| e.bound <= *key);
    if idx == 0 {
        return Err(FabricError::NoSuchShard);
    }
    Ok(entries[idx - 1].shard_id)
}

/// HASH routing: the shard owning the digest's position on the ring. A digest
/// below every bound wraps around to the highest-bound shard; ties on equal
/// bounds are broken by the lower shard id at insert time.
pub fn route_hash(entries: &[RouteEntry], key: &ShardingKey) -> Result<u64, FabricError> {
    if entries.is_empty() {
        return Err(FabricError::NoSuchShard);
    }
    let digest = ShardingKey::Str(key.digest());
    let idx = entries.partition_point(|e| e.bound <= digest);
    if idx == 0 {
        // Ring wrap: owned by the shard with the greatest bound.
        return Ok(entries[entries.len() - 1].shard_id);
    }
    Ok(entries[idx - 1].shard_id)
}

/// The half-open range `[bound_i, bound_{i+1})` owned by the shard at `idx`.
/// The highest-bound shard owns `[bound_n, +inf)`.
pub fn owned_range(entries: &[RouteEntry], idx: usize) -> KeyRange {
    KeyRange::new(
        Some(entries[idx].bound.clone()),
        entries.get(idx + 1).map(|e| e.bound.clone()),
    )
}
