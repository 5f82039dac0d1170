//! Identity generation for agents, work items and workflow runs.
//!
//! Every identifier is 128 bits wide: the high half is a nanosecond
//! wall-clock timestamp and the low half is random. Uniqueness comes from
//! the composition itself, never from a lookup. For `n` entities alive at
//! once the chance of a collision is roughly `n² / 2^(bits + 1)` over the
//! random bits, which is negligible for swarms of a few hundred agents.
//!
//! The clock is not trusted to advance: when two calls observe the same (or
//! an earlier) timestamp, the generator falls back to a logical counter and
//! issues `last + 1`, so identifiers from one generator are strictly ordered.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A 128-bit identifier composed of a timestamp and a random component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(Uuid);

impl UniqueId {
    /// Compose an identifier from its timestamp and random halves.
    pub fn from_parts(timestamp: u64, random: u64) -> Self {
        Self(Uuid::from_u64_pair(timestamp, random))
    }

    /// The timestamp (or logical counter) half.
    pub fn timestamp(&self) -> u64 {
        self.0.as_u64_pair().0
    }

    /// The random half.
    pub fn random(&self) -> u64 {
        self.0.as_u64_pair().1
    }

    /// Return first 8 characters of the identifier for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UniqueId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Produces timestamp-plus-random identifiers.
///
/// Safe to share between threads; `next_id` never blocks and never fails.
///
/// # Example
///
/// ```
/// use hive::id::IdGenerator;
///
/// let ids = IdGenerator::new();
/// let a = ids.next_id();
/// let b = ids.next_id();
/// assert!(b.timestamp() > a.timestamp());
/// ```
#[derive(Debug, Default)]
pub struct IdGenerator {
    last_timestamp: AtomicU64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// Generate the next identifier.
    pub fn next_id(&self) -> UniqueId {
        let now = clock_nanos();
        let mut last = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            // Logical counter when the clock stalls or steps backwards.
            let candidate = if now > last { now } else { last + 1 };
            match self.last_timestamp.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return UniqueId::from_parts(candidate, rand::random()),
                Err(observed) => last = observed,
            }
        }
    }
}

static GLOBAL: IdGenerator = IdGenerator::new();

/// Generate an identifier from the process-wide generator.
pub fn next_id() -> UniqueId {
    GLOBAL.next_id()
}

/// Birthday-bound collision probability for `n` live entities over `bits`
/// random bits.
pub fn collision_probability(n: u64, bits: u32) -> f64 {
    let n = n as f64;
    (n * n) / 2f64.powi(bits as i32 + 1)
}

fn clock_nanos() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map(|nanos| nanos.max(0) as u64)
        .unwrap_or(0)
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub UniqueId);

        impl $name {
            /// Create a new identifier from the process-wide generator.
            pub fn new() -> Self {
                Self(next_id())
            }

            /// Return first 8 characters of the identifier for display.
            pub fn short(&self) -> String {
                self.0.short()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<UniqueId> for $name {
            fn from(id: UniqueId) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

entity_id!(
    /// Identifier of a registered agent.
    AgentId
);
entity_id!(
    /// Identifier of a work item.
    WorkId
);
entity_id!(
    /// Identifier of a workflow run.
    RunId
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_strictly_increasing() {
        let ids = IdGenerator::new();
        let mut previous = ids.next_id();
        for _ in 0..1_000 {
            let next = ids.next_id();
            assert!(next.timestamp() > previous.timestamp());
            previous = next;
        }
    }

    #[test]
    fn test_logical_counter_when_clock_is_ahead() {
        // Given a generator whose last timestamp is far in the future
        let ids = IdGenerator::new();
        let future = clock_nanos() + 60_000_000_000;
        ids.last_timestamp.store(future, Ordering::SeqCst);

        // When ids are generated
        let a = ids.next_id();
        let b = ids.next_id();

        // Then the counter keeps counting instead of going backwards
        assert_eq!(a.timestamp(), future + 1);
        assert_eq!(b.timestamp(), future + 2);
    }

    #[test]
    fn test_concurrent_generation_has_no_duplicates() {
        let ids = IdGenerator::new();
        let all: Vec<UniqueId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| (0..500).map(|_| ids.next_id()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn test_from_parts_roundtrip() {
        let id = UniqueId::from_parts(42, 7);
        assert_eq!(id.timestamp(), 42);
        assert_eq!(id.random(), 7);
    }

    #[test]
    fn test_display_and_parse() {
        let id = WorkId::new();
        let parsed: WorkId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_parse_invalid() {
        let result: std::result::Result<AgentId, _> = "not-an-id".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_is_transparent() {
        let id = AgentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_collision_probability_is_negligible() {
        assert!(collision_probability(200, 64) < 1e-12);
        assert!(collision_probability(1 << 20, 32) > 1.0);
    }
}
