use std::collections::{HashMap, VecDeque};

use trellis_core::packet::PacketHash;

/// Bounded replay filter over packet hashes: least-recently-inserted
/// eviction plus a time-to-live cull driven by the maintenance tick.
pub struct PacketFilter {
    capacity: usize,
    ttl_secs: f64,
    seen: HashMap<PacketHash, f64>,
    order: VecDeque<PacketHash>,
}

impl PacketFilter {
    pub fn new(capacity: usize, ttl_secs: f64) -> Self {
        Self { capacity, ttl_secs, seen: HashMap::new(), order: VecDeque::new() }
    }

    /// Returns true when the hash was not present, i.e. the packet is new.
    pub fn insert(&mut self, hash: PacketHash, now: f64) -> bool {
        if let Some(seen_at) = self.seen.get(&hash) {
            if now - seen_at <= self.ttl_secs {
                return false;
            }
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        if self.seen.insert(hash, now).is_none() {
            self.order.push_back(hash);
        }

        true
    }

    pub fn contains(&self, hash: &PacketHash, now: f64) -> bool {
        self.seen.get(hash).map(|seen_at| now - seen_at <= self.ttl_secs).unwrap_or(false)
    }

    pub fn release(&mut self, now: f64) {
        let ttl = self.ttl_secs;
        self.seen.retain(|_, seen_at| now - *seen_at <= ttl);
        let seen = &self.seen;
        self.order.retain(|hash| seen.contains_key(hash));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use trellis_core::hash::AddressHash;

    use super::PacketFilter;

    #[test]
    fn replays_are_rejected_and_distinct_pass() {
        let mut filter = PacketFilter::new(16, 100.0);
        let first = AddressHash::random(OsRng);
        let second = AddressHash::random(OsRng);

        assert!(filter.insert(first, 0.0));
        assert!(!filter.insert(first, 1.0));
        assert!(filter.insert(second, 1.0));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut filter = PacketFilter::new(2, 1000.0);
        let hashes: Vec<_> = (0..3).map(|_| AddressHash::random(OsRng)).collect();

        assert!(filter.insert(hashes[0], 0.0));
        assert!(filter.insert(hashes[1], 1.0));
        assert!(filter.insert(hashes[2], 2.0));

        assert_eq!(filter.len(), 2);
        assert!(!filter.contains(&hashes[0], 3.0));
        assert!(filter.contains(&hashes[2], 3.0));
    }

    #[test]
    fn ttl_expires_entries() {
        let mut filter = PacketFilter::new(16, 10.0);
        let hash = AddressHash::random(OsRng);

        assert!(filter.insert(hash, 0.0));
        assert!(!filter.contains(&hash, 20.0));

        filter.release(20.0);
        assert!(filter.is_empty());
        assert!(filter.insert(hash, 21.0));
    }
}
