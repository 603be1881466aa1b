//! Port pair allocation from a bounded range.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vassago_core::{Error, PortPair, Result};

/// Inclusive port range split into a REST half and a gRPC half.
///
/// REST ports come from `[low, mid)` and gRPC ports from `[mid, high]`, where
/// `mid = (low + high) / 2`, so the two halves can never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    /// Creates a range, rejecting ranges that cannot hold a single pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `low > high` or the range has no room
    /// for a pair.
    pub fn new(low: u16, high: u16) -> Result<Self> {
        if low > high {
            return Err(Error::invalid_config(format!(
                "port range {low}-{high} is inverted"
            )));
        }
        let range = Self { low, high };
        if range.capacity() == 0 {
            return Err(Error::invalid_config(format!(
                "port range {low}-{high} is too small to hold a port pair"
            )));
        }
        Ok(range)
    }

    /// Lower bound (inclusive).
    #[must_use]
    pub fn low(&self) -> u16 {
        self.low
    }

    /// Upper bound (inclusive).
    #[must_use]
    pub fn high(&self) -> u16 {
        self.high
    }

    /// First gRPC port.
    #[must_use]
    pub fn mid(&self) -> u16 {
        // u32 arithmetic; both bounds fit in u16 so the result does too.
        ((u32::from(self.low) + u32::from(self.high)) / 2) as u16
    }

    /// Number of pairs the range can hold at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let rest = usize::from(self.mid() - self.low);
        let grpc = usize::from(self.high - self.mid()) + 1;
        rest.min(grpc)
    }

    /// Returns `true` if `port` lies within the range.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    fn pair_at(&self, index: usize) -> PortPair {
        // index < capacity, which keeps both ports inside their halves.
        let offset = index as u16;
        PortPair::new(self.low + offset, self.mid() + offset)
    }

    fn index_of(&self, pair: PortPair) -> Option<usize> {
        if pair.rest < self.low || pair.rest >= self.mid() {
            return None;
        }
        let index = usize::from(pair.rest - self.low);
        (index < self.capacity() && self.pair_at(index) == pair).then_some(index)
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (low, high) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| Error::invalid_config(format!("port range {s:?} is not LOW-HIGH")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|e| Error::invalid_config(format!("port range {s:?}: {e}")))
        };
        Self::new(parse(low)?, parse(high)?)
    }
}

impl TryFrom<String> for PortRange {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    /// Next never-used pair index.
    cursor: usize,
    /// Released indices, reused lowest-first.
    free: BTreeSet<usize>,
    /// Indices currently attached to a live owner.
    held: HashSet<usize>,
}

/// Hands out disjoint (REST, gRPC) port pairs.
///
/// Reservation and release are short critical sections on an internal mutex;
/// no I/O happens while it is held.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Creates an allocator over `range`.
    #[must_use]
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// The configured range.
    #[must_use]
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserves a pair that is not held by anyone else.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExhausted`] when every pair is held.
    pub fn reserve(&self) -> Result<PortPair> {
        let mut state = self.state.lock();
        let index = if let Some(index) = state.free.pop_first() {
            index
        } else if state.cursor < self.range.capacity() {
            state.cursor += 1;
            state.cursor - 1
        } else {
            return Err(Error::CapacityExhausted {
                low: self.range.low,
                high: self.range.high,
            });
        };
        state.held.insert(index);
        let pair = self.range.pair_at(index);
        tracing::debug!(rest_port = pair.rest, grpc_port = pair.grpc, "Reserved port pair");
        Ok(pair)
    }

    /// Returns a pair to the pool. Releasing a pair that is not held is a no-op.
    pub fn release(&self, pair: PortPair) {
        let Some(index) = self.range.index_of(pair) else {
            tracing::warn!(%pair, "Ignoring release of a pair outside the range");
            return;
        };
        let mut state = self.state.lock();
        if state.held.remove(&index) {
            state.free.insert(index);
            tracing::debug!(rest_port = pair.rest, grpc_port = pair.grpc, "Released port pair");
        }
    }

    /// Returns `true` if `pair` is currently reserved.
    #[must_use]
    pub fn is_held(&self, pair: PortPair) -> bool {
        self.range
            .index_of(pair)
            .is_some_and(|index| self.state.lock().held.contains(&index))
    }

    /// Number of pairs currently reserved.
    #[must_use]
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Number of pairs that can still be reserved.
    #[must_use]
    pub fn available(&self) -> usize {
        self.range.capacity() - self.held()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_parse_range() {
        let range: PortRange = "9000-9999".parse().unwrap();
        assert_eq!(range.low(), 9000);
        assert_eq!(range.high(), 9999);
        assert_eq!(range.mid(), 9499);
        assert_eq!(range.capacity(), 499);

        assert!("9000".parse::<PortRange>().is_err());
        assert!("9999-9000".parse::<PortRange>().is_err());
        assert!("9000-9001".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_halves_never_overlap() {
        let range = PortRange::new(10000, 10009).unwrap();
        let allocator = PortAllocator::new(range);
        let mut seen = HashSet::new();
        while let Ok(pair) = allocator.reserve() {
            assert!(pair.rest < range.mid());
            assert!(pair.grpc >= range.mid() && pair.grpc <= range.high());
            assert!(seen.insert(pair.rest));
            assert!(seen.insert(pair.grpc));
        }
        assert_eq!(allocator.held(), range.capacity());
    }

    #[test]
    fn test_exhaustion_is_distinct_error() {
        let allocator = PortAllocator::new(PortRange::new(9000, 9003).unwrap());
        assert_eq!(allocator.range().capacity(), 1);
        allocator.reserve().unwrap();
        let err = allocator.reserve().unwrap_err();
        assert_eq!(err.kind(), vassago_core::ErrorKind::CapacityExhausted);
    }

    #[test]
    fn test_release_reuses_lowest_first() {
        let allocator = PortAllocator::new(PortRange::new(9000, 9010).unwrap());
        let a = allocator.reserve().unwrap();
        let b = allocator.reserve().unwrap();
        let c = allocator.reserve().unwrap();

        allocator.release(c);
        allocator.release(a);
        assert_eq!(allocator.reserve().unwrap(), a);
        assert_eq!(allocator.reserve().unwrap(), c);
        assert!(allocator.is_held(b));
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(PortRange::new(9000, 9010).unwrap());
        let pair = allocator.reserve().unwrap();
        allocator.release(pair);
        allocator.release(pair);
        allocator.release(PortPair::new(1, 2));
        assert_eq!(allocator.held(), 0);

        // A double release must not make the same pair available twice.
        let first = allocator.reserve().unwrap();
        let second = allocator.reserve().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        let allocator = Arc::new(PortAllocator::new(PortRange::new(20000, 20199).unwrap()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| allocator.reserve().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for handle in handles {
            for pair in handle.join().unwrap() {
                assert!(ports.insert(pair.rest));
                assert!(ports.insert(pair.grpc));
            }
        }
        assert_eq!(ports.len(), 160);
    }
}
