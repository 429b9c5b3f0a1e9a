use crate::iface::InterfaceDesc;
use crate::transport::rate::TokenBucket;

/// Fraction of an interface's nominal bandwidth available to announce
/// re-flooding.
pub const ANNOUNCE_BUDGET_RATIO: f64 = 0.02;
/// Queued announces older than this are dropped unsent.
pub const ANNOUNCE_MAX_AGE_SECS: f64 = 24.0 * 3600.0;

const QUEUE_MAX_LEN: usize = 1024;
const BURST_WINDOW_SECS: f64 = 4.0;

struct QueuedAnnounce {
    bytes: Vec<u8>,
    hops: u8,
    queued_at: f64,
}

/// Per-interface announce emission under the bandwidth budget. Announces
/// that fit the current budget leave immediately; the rest wait in a queue
/// ordered by (hops ascending, arrival ascending) and drain on tick.
pub struct AnnounceQueue {
    bucket: TokenBucket,
    queue: Vec<QueuedAnnounce>,
    dropped_aged: u64,
}

impl AnnounceQueue {
    pub fn new(desc: &InterfaceDesc, now: f64) -> Self {
        let budget_bps = (desc.nominal_bps as f64 * ANNOUNCE_BUDGET_RATIO).max(8.0) as u64;
        // The burst floor lets one full frame through even on links where
        // 2% of the bandwidth is below a single MTU per window.
        let bucket = TokenBucket::new(budget_bps, BURST_WINDOW_SECS, now)
            .with_min_burst(trellis_core::packet::PACKET_MTU as f64);
        Self { bucket, queue: Vec::new(), dropped_aged: 0 }
    }

    /// Emits the frame now when budget allows, otherwise queues it.
    pub fn submit(&mut self, bytes: Vec<u8>, hops: u8, now: f64) -> Option<Vec<u8>> {
        if self.queue.is_empty() && self.bucket.try_consume(bytes.len(), now) {
            return Some(bytes);
        }

        if self.queue.len() >= QUEUE_MAX_LEN {
            // Full queue: the worst-ranked entry makes room or the new one
            // is discarded.
            match self.queue.last() {
                Some(last) if (last.hops, last.queued_at) > (hops, now) => {
                    self.queue.pop();
                }
                _ => return None,
            }
        }

        let entry = QueuedAnnounce { bytes, hops, queued_at: now };
        let position = self
            .queue
            .partition_point(|queued| (queued.hops, queued.queued_at) <= (hops, now));
        self.queue.insert(position, entry);

        None
    }

    /// Ages out stale entries and releases queued announces up to budget.
    pub fn drain(&mut self, now: f64) -> Vec<Vec<u8>> {
        let before = self.queue.len();
        self.queue.retain(|entry| now - entry.queued_at <= ANNOUNCE_MAX_AGE_SECS);
        self.dropped_aged += (before - self.queue.len()) as u64;

        let mut released = Vec::new();
        while let Some(front) = self.queue.first() {
            if !self.bucket.try_consume(front.bytes.len(), now) {
                break;
            }
            released.push(self.queue.remove(0).bytes);
        }

        released
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped_aged(&self) -> u64 {
        self.dropped_aged
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use trellis_core::hash::AddressHash;

    use super::{AnnounceQueue, ANNOUNCE_MAX_AGE_SECS};
    use crate::iface::{InterfaceDesc, InterfaceMode};

    fn narrow_iface() -> InterfaceDesc {
        // 8 kbps: a 20-byte announce budget per second at the 2% cap.
        InterfaceDesc::new(AddressHash::random(OsRng), 8_000, 500, InterfaceMode::Full)
    }

    #[test]
    fn overflow_queues_and_drains_in_hop_order() {
        let mut queue = AnnounceQueue::new(&narrow_iface(), 0.0);

        // Exhaust the 500-byte burst floor; 20 bytes of budget remain.
        for _ in 0..12 {
            assert!(queue.submit(vec![0u8; 40], 0, 0.0).is_some());
        }

        assert!(queue.submit(vec![3u8; 40], 3, 0.0).is_none());
        assert!(queue.submit(vec![1u8; 40], 1, 0.0).is_none());
        assert!(queue.submit(vec![2u8; 40], 2, 0.0).is_none());

        // Enough refill for all three queued announces.
        let released = queue.drain(30.0);
        assert_eq!(released.len(), 3);
        assert_eq!(released[0][0], 1, "lowest hop count drains first");
        assert_eq!(released[1][0], 2);
        assert_eq!(released[2][0], 3);
    }

    #[test]
    fn stale_entries_age_out() {
        let mut queue = AnnounceQueue::new(&narrow_iface(), 0.0);

        for _ in 0..12 {
            assert!(queue.submit(vec![0u8; 40], 0, 0.0).is_some());
        }
        assert!(queue.submit(vec![9u8; 40], 1, 0.0).is_none());
        assert_eq!(queue.queued(), 1);

        let released = queue.drain(ANNOUNCE_MAX_AGE_SECS + 1.0);
        assert!(released.is_empty());
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.dropped_aged(), 1);
    }

    #[test]
    fn sustained_overload_emits_at_cap() {
        // 1 Mbps: the 2% cap is 2500 bytes per second.
        let desc = InterfaceDesc::new(
            AddressHash::random(OsRng),
            1_000_000,
            500,
            InterfaceMode::Full,
        );
        let mut queue = AnnounceQueue::new(&desc, 0.0);

        let frame_len = 250usize;
        let mut emitted_bytes = 0usize;
        let mut now = 0.0;

        // Offer ten times the cap; count emission only after a warmup that
        // drains the initial burst allowance.
        while now < 70.0 {
            let counting = now >= 10.0;
            for _ in 0..10 {
                if let Some(bytes) = queue.submit(vec![0u8; frame_len], 1, now) {
                    if counting {
                        emitted_bytes += bytes.len();
                    }
                }
            }
            for bytes in queue.drain(now) {
                if counting {
                    emitted_bytes += bytes.len();
                }
            }
            now += 0.1;
        }

        let cap = desc.nominal_bps as f64 * 0.02 / 8.0 * 60.0;
        let ratio = emitted_bytes as f64 / cap;
        assert!(
            (0.95..=1.05).contains(&ratio),
            "emitted {} bytes against cap {}",
            emitted_bytes,
            cap
        );
    }
}
