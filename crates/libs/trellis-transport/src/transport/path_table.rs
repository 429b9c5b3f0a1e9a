use std::collections::HashMap;

use trellis_core::hash::AddressHash;
use trellis_core::packet::{
    DestinationType, Header, HeaderType, Packet, PacketHash, PacketType, PropagationType,
};

use crate::iface::InterfaceId;

pub struct PathEntry {
    pub received_from: AddressHash,
    pub hops: u8,
    pub iface: InterfaceId,
    pub expires_at: f64,
    pub announce_hash: PacketHash,
    pub announce_timestamp: u64,
}

/// Destination routes learned from announces. Replacement prefers fewer
/// hops, then strictly newer announces; an equal-hop tie from a different
/// interface never displaces a live route.
pub struct PathTable {
    map: HashMap<AddressHash, PathEntry>,
}

impl PathTable {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.map.get(destination)
    }

    pub fn has_path(&self, destination: &AddressHash) -> bool {
        self.map.contains_key(destination)
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.map.get(destination).map(|entry| entry.hops)
    }

    pub fn next_hop(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.map.get(destination).map(|entry| entry.received_from)
    }

    pub fn next_hop_iface(&self, destination: &AddressHash) -> Option<InterfaceId> {
        self.map.get(destination).map(|entry| entry.iface)
    }

    /// Applies the path replacement policy for a validated announce.
    /// Returns the adopted hop count when the route was taken.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_announce<F>(
        &mut self,
        announce: &Packet,
        announce_timestamp: u64,
        transport_id: Option<AddressHash>,
        iface: InterfaceId,
        expires_at: f64,
        iface_is_up: F,
    ) -> Option<u8>
    where
        F: Fn(&InterfaceId) -> bool,
    {
        let hops = announce.header.hops.saturating_add(1);

        if let Some(existing) = self.map.get(&announce.destination) {
            let adopt = hops < existing.hops
                || (hops == existing.hops && announce_timestamp > existing.announce_timestamp)
                || !iface_is_up(&existing.iface);

            if !adopt {
                return None;
            }
        }

        let received_from = transport_id.unwrap_or(announce.destination);
        self.map.insert(
            announce.destination,
            PathEntry {
                received_from,
                hops,
                iface,
                expires_at,
                announce_hash: announce.hash(),
                announce_timestamp,
            },
        );

        log::info!(
            "{} is now reachable over {} hops through {} on iface {}",
            announce.destination,
            hops,
            received_from,
            iface,
        );

        Some(hops)
    }

    /// Routes an outbound or forwarded packet. Direct neighbors keep the
    /// original header; multi-hop paths are promoted to a transported
    /// header addressed at the next hop.
    pub fn route_packet(&self, original: &Packet) -> (Packet, Option<InterfaceId>) {
        if original.header.header_type == HeaderType::Transported
            || original.header.packet_type == PacketType::Announce
            || original.header.destination_type == DestinationType::Plain
            || original.header.destination_type == DestinationType::Group
        {
            return (*original, None);
        }

        let entry = match self.map.get(&original.destination) {
            Some(entry) => entry,
            None => return (*original, None),
        };

        if entry.hops <= 1 {
            return (*original, Some(entry.iface));
        }

        (
            Packet {
                header: Header {
                    header_type: HeaderType::Transported,
                    propagation_type: PropagationType::Transport,
                    ..original.header
                },
                ifac: original.ifac,
                destination: original.destination,
                transport: Some(entry.received_from),
                context: original.context,
                data: original.data,
            },
            Some(entry.iface),
        )
    }

    /// Drops entries past their expiry or referencing a gone interface.
    pub fn expire<F>(&mut self, now: f64, iface_exists: F) -> Vec<AddressHash>
    where
        F: Fn(&InterfaceId) -> bool,
    {
        let mut removed = Vec::new();
        self.map.retain(|destination, entry| {
            let keep = entry.expires_at > now && iface_exists(&entry.iface);
            if !keep {
                removed.push(*destination);
            }
            keep
        });

        for destination in &removed {
            log::debug!("path to {} expired", destination);
        }

        removed
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use trellis_core::hash::AddressHash;
    use trellis_core::packet::{Header, HeaderType, Packet, PacketType, PropagationType};

    use super::PathTable;

    fn announce_with_hops(destination: AddressHash, hops: u8) -> Packet {
        Packet {
            header: Header {
                packet_type: PacketType::Announce,
                hops,
                ..Default::default()
            },
            destination,
            ..Default::default()
        }
    }

    #[test]
    fn fewer_hops_replace_longer_paths() {
        let mut table = PathTable::new();
        let destination = AddressHash::random(OsRng);
        let iface_a = AddressHash::random(OsRng);
        let iface_b = AddressHash::random(OsRng);

        let far = announce_with_hops(destination, 4);
        assert_eq!(
            table.handle_announce(&far, 100, None, iface_a, 1000.0, |_| true),
            Some(5)
        );

        let near = announce_with_hops(destination, 1);
        assert_eq!(
            table.handle_announce(&near, 90, None, iface_b, 1000.0, |_| true),
            Some(2)
        );
        assert_eq!(table.hops_to(&destination), Some(2));
        assert_eq!(table.next_hop_iface(&destination), Some(iface_b));
    }

    #[test]
    fn equal_hops_keep_older_unless_newer_timestamp() {
        let mut table = PathTable::new();
        let destination = AddressHash::random(OsRng);
        let iface_a = AddressHash::random(OsRng);
        let iface_b = AddressHash::random(OsRng);

        let first = announce_with_hops(destination, 2);
        table.handle_announce(&first, 100, None, iface_a, 1000.0, |_| true);

        // Same hop count, same age, different interface: keep the old path.
        let tie = announce_with_hops(destination, 2);
        assert!(table.handle_announce(&tie, 100, None, iface_b, 1000.0, |_| true).is_none());
        assert_eq!(table.next_hop_iface(&destination), Some(iface_a));

        // A strictly newer announce at equal hops replaces.
        let newer = announce_with_hops(destination, 2);
        assert!(table.handle_announce(&newer, 101, None, iface_b, 1000.0, |_| true).is_some());
        assert_eq!(table.next_hop_iface(&destination), Some(iface_b));
    }

    #[test]
    fn down_interface_always_replaced() {
        let mut table = PathTable::new();
        let destination = AddressHash::random(OsRng);
        let iface_a = AddressHash::random(OsRng);
        let iface_b = AddressHash::random(OsRng);

        let first = announce_with_hops(destination, 1);
        table.handle_announce(&first, 100, None, iface_a, 1000.0, |_| true);

        let worse = announce_with_hops(destination, 5);
        assert!(table
            .handle_announce(&worse, 50, None, iface_b, 1000.0, |iface| *iface != iface_a)
            .is_some());
        assert_eq!(table.hops_to(&destination), Some(6));
    }

    #[test]
    fn multihop_routes_promote_to_transported() {
        let mut table = PathTable::new();
        let destination = AddressHash::random(OsRng);
        let next_hop = AddressHash::random(OsRng);
        let iface = AddressHash::random(OsRng);

        let mut announce = announce_with_hops(destination, 1);
        announce.transport = Some(next_hop);
        table.handle_announce(&announce, 100, Some(next_hop), iface, 1000.0, |_| true);

        let outbound = Packet { destination, ..Default::default() };
        let (routed, routed_iface) = table.route_packet(&outbound);

        assert_eq!(routed_iface, Some(iface));
        assert_eq!(routed.header.header_type, HeaderType::Transported);
        assert_eq!(routed.header.propagation_type, PropagationType::Transport);
        assert_eq!(routed.transport, Some(next_hop));
    }

    #[test]
    fn expiry_removes_entries() {
        let mut table = PathTable::new();
        let destination = AddressHash::random(OsRng);
        let iface = AddressHash::random(OsRng);

        let announce = announce_with_hops(destination, 0);
        table.handle_announce(&announce, 100, None, iface, 500.0, |_| true);

        assert!(table.expire(100.0, |_| true).is_empty());
        assert_eq!(table.expire(501.0, |_| true), vec![destination]);
        assert!(!table.has_path(&destination));
    }
}
