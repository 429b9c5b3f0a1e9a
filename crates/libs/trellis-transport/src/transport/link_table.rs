use std::collections::HashMap;

use trellis_core::hash::AddressHash;
use trellis_core::packet::{Header, HeaderType, Packet, PropagationType};

use crate::iface::InterfaceId;
use crate::link::LinkId;

pub struct LinkEntry {
    pub proof_deadline: f64,
    pub last_activity: f64,
    pub next_hop: AddressHash,
    pub next_hop_iface: InterfaceId,
    pub received_from_iface: InterfaceId,
    pub original_destination: AddressHash,
    pub validated: bool,
}

/// Rewrites an in-link packet for its next switching step and pairs it
/// with the interface it leaves on; only the interface choice depends on
/// the travel direction.
fn switch_packet(packet: &Packet, entry: &LinkEntry, out_iface: InterfaceId) -> (Packet, InterfaceId) {
    let propagated = Packet {
        header: Header {
            header_type: HeaderType::Transported,
            propagation_type: PropagationType::Transport,
            hops: packet.header.hops.saturating_add(1),
            ..packet.header
        },
        ifac: None,
        destination: packet.destination,
        transport: Some(entry.next_hop),
        context: packet.context,
        data: packet.data,
    };

    (propagated, out_iface)
}

/// Switching state for links this node forwards but does not terminate.
/// A slot is created from the link request, validated by the responder's
/// proof travelling backwards, and then switches in-link traffic both ways.
pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    proof_timeout_secs: f64,
    idle_timeout_secs: f64,
}

impl LinkTable {
    pub fn new(proof_timeout_secs: f64, idle_timeout_secs: f64) -> Self {
        Self { entries: HashMap::new(), proof_timeout_secs, idle_timeout_secs }
    }

    pub fn add(
        &mut self,
        link_request: &Packet,
        received_from_iface: InterfaceId,
        next_hop: AddressHash,
        next_hop_iface: InterfaceId,
        now: f64,
    ) {
        let link_id: LinkId = link_request.hash();

        if self.entries.contains_key(&link_id) {
            return;
        }

        self.entries.insert(
            link_id,
            LinkEntry {
                proof_deadline: now + self.proof_timeout_secs,
                last_activity: now,
                next_hop,
                next_hop_iface,
                received_from_iface,
                original_destination: link_request.destination,
                validated: false,
            },
        );
    }

    pub fn contains(&self, link_id: &LinkId) -> bool {
        self.entries.contains_key(link_id)
    }

    /// Switches the responder's proof back toward the initiator and marks
    /// the slot validated.
    pub fn handle_proof(&mut self, proof: &Packet, now: f64) -> Option<(Packet, InterfaceId)> {
        let entry = self.entries.get_mut(&proof.destination)?;
        entry.validated = true;
        entry.last_activity = now;
        Some(switch_packet(proof, entry, entry.received_from_iface))
    }

    /// Switches in-link traffic through a validated slot. Packets arriving
    /// on the initiator side travel forward, anything else backward.
    pub fn handle_traffic(
        &mut self,
        packet: &Packet,
        arrival_iface: InterfaceId,
        now: f64,
    ) -> Option<(Packet, InterfaceId)> {
        let entry = self.entries.get_mut(&packet.destination)?;
        if !entry.validated {
            return None;
        }

        entry.last_activity = now;

        let out_iface = if arrival_iface == entry.received_from_iface {
            entry.next_hop_iface
        } else {
            entry.received_from_iface
        };

        Some(switch_packet(packet, entry, out_iface))
    }

    pub fn remove(&mut self, link_id: &LinkId) {
        self.entries.remove(link_id);
    }

    /// Drops every slot switched over a deregistered interface.
    pub fn remove_for_iface(&mut self, iface: &InterfaceId) {
        self.entries.retain(|_, entry| {
            entry.received_from_iface != *iface && entry.next_hop_iface != *iface
        });
    }

    /// Retires unproven slots past the handshake deadline and validated
    /// slots idle past the idle timeout.
    pub fn remove_stale(&mut self, now: f64) {
        let idle_timeout = self.idle_timeout_secs;
        self.entries.retain(|_, entry| {
            if entry.validated {
                now - entry.last_activity < idle_timeout
            } else {
                now < entry.proof_deadline
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use trellis_core::hash::AddressHash;
    use trellis_core::packet::{
        DestinationType, Header, HeaderType, Packet, PacketContext, PacketType,
    };

    use super::LinkTable;

    fn link_request() -> Packet {
        Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            destination: AddressHash::random(OsRng),
            ..Default::default()
        }
    }

    #[test]
    fn proof_validates_and_switches_backwards() {
        let mut table = LinkTable::new(15.0, 900.0);
        let request = link_request();
        let from_iface = AddressHash::random(OsRng);
        let to_iface = AddressHash::random(OsRng);
        let next_hop = AddressHash::random(OsRng);

        table.add(&request, from_iface, next_hop, to_iface, 0.0);

        let proof = Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: request.hash(),
            context: PacketContext::LinkRequestProof,
            ..Default::default()
        };

        let (switched, iface) = table.handle_proof(&proof, 1.0).expect("known slot");
        assert_eq!(iface, from_iface);
        assert_eq!(switched.header.header_type, HeaderType::Transported);
        assert_eq!(switched.transport, Some(next_hop));
    }

    #[test]
    fn unproven_slots_expire() {
        let mut table = LinkTable::new(15.0, 900.0);
        let request = link_request();
        let iface = AddressHash::random(OsRng);

        table.add(&request, iface, AddressHash::random(OsRng), iface, 0.0);
        assert_eq!(table.len(), 1);

        table.remove_stale(14.0);
        assert_eq!(table.len(), 1);

        table.remove_stale(16.0);
        assert!(table.is_empty());
    }

    #[test]
    fn traffic_requires_validation() {
        let mut table = LinkTable::new(15.0, 900.0);
        let request = link_request();
        let iface = AddressHash::random(OsRng);

        table.add(&request, iface, AddressHash::random(OsRng), iface, 0.0);

        let data = Packet {
            header: Header {
                packet_type: PacketType::Data,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: request.hash(),
            ..Default::default()
        };

        assert!(table.handle_traffic(&data, iface, 1.0).is_none());
    }
}
