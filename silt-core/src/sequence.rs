//! Ordering over heterogeneous sequence-number domains. Integer-offset
//! streams hand out `i64` offsets; opaque-sequence streams hand out decimal
//! big-integer strings. Both share two reserved sentinels: [`SequenceNumber::EndOfShard`]
//! (the shard is closed, nothing further will arrive) and [`SequenceNumber::NoEnd`]
//! (an open-ended upper bound). `EndOfShard` sorts below every real sequence
//! number and `NoEnd` above, so range checks against bounds need no special
//! casing.

use std::cmp::Ordering;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved encoding of [`SequenceNumber::EndOfShard`].
pub const END_OF_SHARD: &str = "END_OF_SHARD";

/// Reserved encoding of [`SequenceNumber::NoEnd`].
pub const NO_END: &str = "NO_END";

/// A position within one partition of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SequenceNumber {
    /// Shard closed; no record sits at this position.
    EndOfShard,
    /// Integer-offset flavor.
    Int(i64),
    /// Opaque decimal big-integer flavor.
    Str(String),
    /// Open-ended upper bound.
    NoEnd,
}

impl SequenceNumber {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, SequenceNumber::EndOfShard | SequenceNumber::NoEnd)
    }

    /// The position immediately after this one. Never called on sentinels by
    /// the reading loop; a sentinel is returned unchanged.
    pub fn next(&self) -> SequenceNumber {
        match self {
            SequenceNumber::Int(v) => SequenceNumber::Int(v + 1),
            SequenceNumber::Str(v) => SequenceNumber::Str(increment_decimal(v)),
            sentinel => sentinel.clone(),
        }
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        use SequenceNumber::*;
        match (self, other) {
            (EndOfShard, EndOfShard) | (NoEnd, NoEnd) => Ordering::Equal,
            (EndOfShard, _) => Ordering::Less,
            (_, EndOfShard) => Ordering::Greater,
            (NoEnd, _) => Ordering::Greater,
            (_, NoEnd) => Ordering::Less,
            (Int(a), Int(b)) => a.cmp(b),
            (Str(a), Str(b)) => compare_decimal(a, b),
            // Mixed domains never meet within one stream; fall back to the
            // numeric value so the order stays total anyway.
            (Int(a), Str(b)) => compare_decimal(&a.to_string(), b),
            (Str(a), Int(b)) => compare_decimal(a, &b.to_string()),
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceNumber::Int(v) => write!(f, "{v}"),
            SequenceNumber::Str(v) => write!(f, "{v}"),
            SequenceNumber::EndOfShard => write!(f, "{END_OF_SHARD}"),
            SequenceNumber::NoEnd => write!(f, "{NO_END}"),
        }
    }
}

impl Serialize for SequenceNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SequenceNumber::Int(v) => serializer.serialize_i64(*v),
            SequenceNumber::Str(v) => serializer.serialize_str(v),
            SequenceNumber::EndOfShard => serializer.serialize_str(END_OF_SHARD),
            SequenceNumber::NoEnd => serializer.serialize_str(NO_END),
        }
    }
}

impl<'de> Deserialize<'de> for SequenceNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SequenceNumberVisitor;

        impl Visitor<'_> for SequenceNumberVisitor {
            type Value = SequenceNumber;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer offset or a decimal sequence-number string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(SequenceNumber::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v)
                    .map(SequenceNumber::Int)
                    .map_err(|_| E::custom(format!("offset {v} out of range")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(match v {
                    END_OF_SHARD => SequenceNumber::EndOfShard,
                    NO_END => SequenceNumber::NoEnd,
                    other => SequenceNumber::Str(other.to_string()),
                })
            }
        }

        deserializer.deserialize_any(SequenceNumberVisitor)
    }
}

/// Numeric comparison of non-negative decimal strings: magnitude first, then
/// digits. Leading zeros do not affect the result.
fn compare_decimal(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn increment_decimal(v: &str) -> String {
    let mut digits: Vec<u8> = v.bytes().collect();
    for d in digits.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return String::from_utf8(digits).expect("decimal digits");
        }
    }
    digits.insert(0, b'1');
    String::from_utf8(digits).expect("decimal digits")
}

/// Identity of one partition within a stream. Integer-offset streams number
/// partitions; opaque-sequence streams name shards. Encoded as a string in
/// every map key position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionId {
    Int(i32),
    Str(String),
}

impl PartitionId {
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionId::Int(v) => write!(f, "{v}"),
            PartitionId::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for PartitionId {
    fn from(value: i32) -> Self {
        PartitionId::Int(value)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        match value.parse::<i32>() {
            Ok(v) => PartitionId::Int(v),
            Err(_) => PartitionId::Str(value.to_string()),
        }
    }
}

impl Serialize for PartitionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PartitionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PartitionId::from(raw.as_str()))
    }
}
