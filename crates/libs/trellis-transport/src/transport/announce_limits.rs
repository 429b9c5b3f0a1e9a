use std::collections::BTreeMap;

use trellis_core::hash::AddressHash;

pub struct AnnounceRateLimit {
    pub target_secs: f64,
    pub grace: u32,
    pub penalty_secs: f64,
}

impl Default for AnnounceRateLimit {
    fn default() -> Self {
        Self { target_secs: 3600.0, grace: 10, penalty_secs: 7200.0 }
    }
}

struct AnnounceLimitEntry {
    violations: u32,
    last_announce: f64,
    blocked_until: f64,
}

/// Per-destination announce admission. A destination announcing faster than
/// the target interval burns through its grace budget and is then blocked
/// for the target interval plus a penalty.
pub struct AnnounceLimits {
    limit: AnnounceRateLimit,
    entries: BTreeMap<AddressHash, AnnounceLimitEntry>,
}

impl AnnounceLimits {
    pub fn new(limit: AnnounceRateLimit) -> Self {
        Self { limit, entries: BTreeMap::new() }
    }

    /// Returns the remaining block time when the announce must be dropped.
    pub fn check(&mut self, destination: &AddressHash, now: f64) -> Option<f64> {
        let entry = match self.entries.get_mut(destination) {
            Some(entry) => entry,
            None => {
                self.entries.insert(
                    *destination,
                    AnnounceLimitEntry { violations: 0, last_announce: now, blocked_until: now },
                );
                return None;
            }
        };

        let mut is_blocked = false;

        if now < entry.blocked_until {
            entry.blocked_until = now + self.limit.target_secs + self.limit.penalty_secs;
            is_blocked = true;
        } else if now < entry.last_announce + self.limit.target_secs {
            entry.violations += 1;
            if entry.violations >= self.limit.grace {
                entry.violations = 0;
                entry.blocked_until = now + self.limit.target_secs;
                is_blocked = true;
            }
        }

        entry.last_announce = now;

        if is_blocked {
            Some(entry.blocked_until - now)
        } else {
            None
        }
    }
}

impl Default for AnnounceLimits {
    fn default() -> Self {
        Self::new(AnnounceRateLimit::default())
    }
}
