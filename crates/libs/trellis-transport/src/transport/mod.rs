pub mod announce_limits;
pub mod announce_queue;
pub mod dedup;
pub mod link_table;
pub mod path_table;
pub mod rate;

use std::collections::{HashMap, HashSet};

use rand_core::OsRng;

use trellis_core::destination::{
    DestinationAnnounce, DestinationName, GroupDestination, PlainInputDestination,
    SingleInputDestination, SingleOutputDestination,
};
use trellis_core::error::TrellisError;
use trellis_core::hash::{AddressHash, ADDRESS_LENGTH};
use trellis_core::identity::{encrypt_for_public_key, PrivateIdentity};
use trellis_core::packet::{
    DestinationType, Header, HeaderType, Packet, PacketContext, PacketDataBuffer, PacketHash,
    PacketType, PropagationType, MAX_HOPS,
};
use trellis_core::ratchet::RatchetStore;
use x25519_dalek::PublicKey;

use crate::iface::{InterfaceDesc, InterfaceId, InterfaceMode};
use crate::link::{Link, LinkId, LinkInbound, LinkStatus, LinkUpkeep};
use crate::resource::{ResourceEvent, ResourceManager};

use announce_limits::AnnounceLimits;
use announce_queue::AnnounceQueue;
use dedup::PacketFilter;
use link_table::LinkTable;
use path_table::PathTable;
use rate::TokenBucket;

const DEDUP_CAPACITY: usize = 65_536;
const DEDUP_TTL_SECS: f64 = 24.0 * 3600.0;
const ANNOUNCE_HISTORY_CAP: usize = 4096;
const DATA_BURST_WINDOW_SECS: f64 = 2.0;
const PATH_REQUEST_TAG_LEN: usize = ADDRESS_LENGTH;

/// One unit of work the host must apply, in batch order.
#[derive(Debug, Clone)]
pub enum TransportAction {
    SendFrame { iface: InterfaceId, bytes: Vec<u8> },
    DeliverLocal { destination: AddressHash, data: Vec<u8>, packet_hash: PacketHash },
    PathUpdated { destination: AddressHash, hops: u8 },
    AnnounceReceived {
        destination: AddressHash,
        hops: u8,
        app_data: Vec<u8>,
        iface: InterfaceId,
    },
    LinkActivated { link_id: LinkId },
    LinkClosed { link_id: LinkId, reason: TrellisError },
    LinkData { link_id: LinkId, data: Vec<u8> },
    LinkIdentified { link_id: LinkId, identity_hash: AddressHash },
    Resource(ResourceEvent),
    Drop { reason: TrellisError },
}

/// Protocol-level failure counters. These never surface past the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub malformed: u64,
    pub signature_failures: u64,
    pub replays: u64,
    pub rate_limited: u64,
    pub no_path: u64,
    pub forwarded: u64,
    pub delivered: u64,
}

pub struct TransportConfig {
    pub name: String,
    pub identity: PrivateIdentity,
    /// Whether this node forwards traffic and re-floods announces.
    pub retransmit: bool,
}

impl TransportConfig {
    pub fn new<T: Into<String>>(name: T, identity: &PrivateIdentity) -> Self {
        Self { name: name.into(), identity: identity.clone(), retransmit: false }
    }

    pub fn set_retransmit(&mut self, retransmit: bool) {
        self.retransmit = retransmit;
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new("tp", &PrivateIdentity::new_from_rand(OsRng))
    }
}

/// The routing and session engine. A pure state machine: no I/O, no
/// timers, no wall clock. Inputs carry a monotonic `now` in seconds and
/// every call returns an ordered batch of actions for the host to apply.
pub struct TransportEngine {
    config: TransportConfig,
    ifaces: HashMap<InterfaceId, InterfaceDesc>,
    announce_queues: HashMap<InterfaceId, AnnounceQueue>,
    data_buckets: HashMap<InterfaceId, TokenBucket>,
    in_destinations: HashMap<AddressHash, SingleInputDestination>,
    group_destinations: HashMap<AddressHash, GroupDestination>,
    plain_destinations: HashSet<AddressHash>,
    known_destinations: HashMap<AddressHash, SingleOutputDestination>,
    announce_history: HashMap<AddressHash, Packet>,
    path_table: PathTable,
    dedup: PacketFilter,
    announce_dedup: PacketFilter,
    announce_limits: AnnounceLimits,
    link_table: LinkTable,
    links: HashMap<LinkId, Link>,
    link_routes: HashMap<LinkId, InterfaceId>,
    resources: ResourceManager,
    ratchet_store: RatchetStore,
    path_request_dest: AddressHash,
    path_request_filter: PacketFilter,
    stats: EngineStats,
}

impl TransportEngine {
    pub fn new(config: TransportConfig) -> Self {
        let path_request_dest =
            PlainInputDestination::new(DestinationName::new("trellis", "path.request"))
                .desc
                .address_hash;

        Self {
            config,
            ifaces: HashMap::new(),
            announce_queues: HashMap::new(),
            data_buckets: HashMap::new(),
            in_destinations: HashMap::new(),
            group_destinations: HashMap::new(),
            plain_destinations: HashSet::new(),
            known_destinations: HashMap::new(),
            announce_history: HashMap::new(),
            path_table: PathTable::new(),
            dedup: PacketFilter::new(DEDUP_CAPACITY, DEDUP_TTL_SECS),
            announce_dedup: PacketFilter::new(DEDUP_CAPACITY, DEDUP_TTL_SECS),
            announce_limits: AnnounceLimits::default(),
            link_table: LinkTable::new(
                crate::link::HANDSHAKE_TIMEOUT_SECS,
                crate::link::CLOSE_AFTER_SECS,
            ),
            links: HashMap::new(),
            link_routes: HashMap::new(),
            resources: ResourceManager::new(),
            ratchet_store: RatchetStore::new(),
            path_request_dest,
            path_request_filter: PacketFilter::new(DEDUP_CAPACITY, DEDUP_TTL_SECS),
            stats: EngineStats::default(),
        }
    }

    pub fn identity_hash(&self) -> AddressHash {
        *self.config.identity.address_hash()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    // --- registration -----------------------------------------------------

    pub fn register_interface(&mut self, desc: InterfaceDesc, now: f64) {
        log::debug!("tp({}): register iface {}", self.config.name, desc.id);
        self.announce_queues.insert(desc.id, AnnounceQueue::new(&desc, now));
        self.data_buckets
            .insert(desc.id, TokenBucket::new(desc.nominal_bps, DATA_BURST_WINDOW_SECS, now));
        self.ifaces.insert(desc.id, desc);
    }

    pub fn deregister_interface(&mut self, iface: &InterfaceId) {
        log::debug!("tp({}): deregister iface {}", self.config.name, iface);
        self.ifaces.remove(iface);
        self.announce_queues.remove(iface);
        self.data_buckets.remove(iface);
        self.link_table.remove_for_iface(iface);
        // Paths over the gone interface fall out on the next tick.
    }

    pub fn set_interface_up(&mut self, iface: &InterfaceId, up: bool) {
        if let Some(desc) = self.ifaces.get_mut(iface) {
            desc.up = up;
        }
    }

    /// Idempotent: registering the same destination hash twice keeps the
    /// first registration.
    pub fn register_destination(&mut self, destination: SingleInputDestination) -> AddressHash {
        let address_hash = destination.desc.address_hash;
        self.in_destinations.entry(address_hash).or_insert(destination);
        log::debug!("tp({}): destination {}", self.config.name, address_hash);
        address_hash
    }

    pub fn register_group_destination(&mut self, destination: GroupDestination) -> AddressHash {
        let address_hash = destination.desc.address_hash;
        self.group_destinations.entry(address_hash).or_insert(destination);
        address_hash
    }

    pub fn register_plain_destination(&mut self, destination: &PlainInputDestination) -> AddressHash {
        let address_hash = destination.desc.address_hash;
        self.plain_destinations.insert(address_hash);
        address_hash
    }

    pub fn deregister_destination(&mut self, destination: &AddressHash) {
        self.in_destinations.remove(destination);
        self.group_destinations.remove(destination);
        self.plain_destinations.remove(destination);
    }

    pub fn destination_mut(
        &mut self,
        destination: &AddressHash,
    ) -> Option<&mut SingleInputDestination> {
        self.in_destinations.get_mut(destination)
    }

    // --- queries ----------------------------------------------------------

    pub fn has_path(&self, destination: &AddressHash) -> bool {
        self.path_table.has_path(destination)
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.path_table.hops_to(destination)
    }

    pub fn next_hop(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.path_table.next_hop(destination)
    }

    pub fn knows_destination(&self, destination: &AddressHash) -> bool {
        self.known_destinations.contains_key(destination)
    }

    pub fn link_status(&self, link_id: &LinkId) -> Option<LinkStatus> {
        self.links.get(link_id).map(|link| link.status())
    }

    pub fn link_peer_identity(&self, link_id: &LinkId) -> Option<AddressHash> {
        self.links.get(link_id).and_then(|link| link.peer_identity()).map(|id| id.address_hash)
    }

    // --- inbound ----------------------------------------------------------

    pub fn inbound(&mut self, frame: &[u8], iface: InterfaceId, now: f64) -> Vec<TransportAction> {
        let mut actions = Vec::new();

        match self.ifaces.get(&iface) {
            Some(desc) if desc.up => {}
            _ => {
                actions.push(TransportAction::Drop { reason: TrellisError::InvalidArgument });
                return actions;
            }
        }

        let packet = match Packet::from_bytes(frame) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.malformed += 1;
                actions.push(TransportAction::Drop { reason: TrellisError::MalformedPacket });
                return actions;
            }
        };

        if packet.destination == self.path_request_dest {
            self.handle_path_request(&packet, iface, now, &mut actions);
            return actions;
        }

        if !self.filter_duplicate(&packet, now) {
            self.stats.replays += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::Replay });
            return actions;
        }

        match packet.header.packet_type {
            PacketType::Announce => self.handle_announce(&packet, iface, now, &mut actions),
            PacketType::LinkRequest => self.handle_link_request(&packet, iface, now, &mut actions),
            PacketType::Proof => self.handle_proof(&packet, iface, now, &mut actions),
            PacketType::Data => self.handle_data(&packet, iface, now, &mut actions),
        }

        actions
    }

    /// Replay filtering with the handshake exemptions: keepalives, link
    /// requests and proofs for a link still handshaking may repeat.
    fn filter_duplicate(&mut self, packet: &Packet, now: f64) -> bool {
        let allow_duplicate = match packet.header.packet_type {
            // Announces dedup against their own 24h set.
            PacketType::Announce => return true,
            PacketType::LinkRequest => true,
            // Retransmitted resource parts are byte-identical on purpose.
            PacketType::Data => {
                packet.context == PacketContext::KeepAlive
                    || packet.context == PacketContext::Resource
            }
            PacketType::Proof => {
                packet.context == PacketContext::ResourceProof
                    || (packet.context == PacketContext::LinkRequestProof
                        && self
                            .links
                            .get(&packet.destination)
                            .map(|link| link.status().not_yet_active())
                            .unwrap_or(false))
            }
        };

        self.dedup.insert(packet.hash(), now) || allow_duplicate
    }

    fn handle_announce(
        &mut self,
        packet: &Packet,
        iface: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        if let Some(blocked_secs) = self.announce_limits.check(&packet.destination, now) {
            log::info!(
                "tp({}): too many announces from {}, blocked for {:.0} seconds",
                self.config.name,
                packet.destination,
                blocked_secs,
            );
            self.stats.rate_limited += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::RateLimited });
            return;
        }

        if !self.announce_dedup.insert(packet.hash(), now) {
            self.stats.replays += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::Replay });
            return;
        }

        // Re-floods of our own announces come back around on multi-path
        // topologies; local destinations never take table entries.
        if self.in_destinations.contains_key(&packet.destination) {
            return;
        }

        let info = match DestinationAnnounce::validate(packet) {
            Ok(info) => info,
            Err(reason) => {
                log::debug!(
                    "tp({}): invalid announce for {}: {:?}",
                    self.config.name,
                    packet.destination,
                    reason
                );
                self.stats.signature_failures += 1;
                actions.push(TransportAction::Drop { reason });
                return;
            }
        };

        if let Some(ratchet) = info.ratchet {
            self.ratchet_store.remember(&packet.destination, ratchet, now);
        }

        let announce_timestamp = info.timestamp;
        let app_data = info.app_data.to_vec();
        self.known_destinations.entry(packet.destination).or_insert(info.destination);

        let expiry = now
            + self
                .ifaces
                .get(&iface)
                .map(|desc| desc.mode.path_expiry_secs())
                .unwrap_or(7.0 * 24.0 * 3600.0);

        let ifaces = &self.ifaces;
        let adopted = self.path_table.handle_announce(
            packet,
            announce_timestamp,
            packet.transport,
            iface,
            expiry,
            |id| ifaces.get(id).map(|desc| desc.up).unwrap_or(false),
        );

        if let Some(hops) = adopted {
            actions.push(TransportAction::PathUpdated { destination: packet.destination, hops });
        }

        actions.push(TransportAction::AnnounceReceived {
            destination: packet.destination,
            hops: packet.header.hops,
            app_data,
            iface,
        });

        if self.announce_history.len() < ANNOUNCE_HISTORY_CAP
            || self.announce_history.contains_key(&packet.destination)
        {
            self.announce_history.insert(packet.destination, *packet);
        }

        if self.config.retransmit {
            self.reflood_announce(packet, iface, now, actions);
        }
    }

    /// Re-emits a validated announce on every other eligible interface,
    /// under each interface's announce budget. The original signature is
    /// untouched; only hops and the transport id change.
    fn reflood_announce(
        &mut self,
        packet: &Packet,
        arrival: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        let hops = packet.header.hops.saturating_add(1);
        if hops > MAX_HOPS {
            return;
        }

        let forwarded = Packet {
            header: Header {
                header_type: HeaderType::Transported,
                propagation_type: PropagationType::Broadcast,
                hops,
                ..packet.header
            },
            ifac: None,
            destination: packet.destination,
            transport: Some(self.identity_hash()),
            context: packet.context,
            data: packet.data,
        };

        let Ok(bytes) = forwarded.to_bytes() else {
            return;
        };

        for (iface_id, desc) in self.ifaces.iter() {
            if *iface_id == arrival || !desc.up {
                continue;
            }

            // Access-point and roaming attachments serve leaf nodes; the
            // mesh is not flooded through them.
            if matches!(desc.mode, InterfaceMode::AccessPoint | InterfaceMode::Roaming) {
                continue;
            }

            if let Some(queue) = self.announce_queues.get_mut(iface_id) {
                if let Some(ready) = queue.submit(bytes.clone(), hops, now) {
                    actions.push(TransportAction::SendFrame { iface: *iface_id, bytes: ready });
                }
            }
        }
    }

    fn handle_link_request(
        &mut self,
        packet: &Packet,
        iface: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        if let Some(destination) = self.in_destinations.get(&packet.destination) {
            let link_id: LinkId = packet.hash();
            if self.links.contains_key(&link_id) {
                return;
            }

            match Link::new_inbound(packet, destination, now) {
                Ok((link, proof)) => {
                    log::trace!(
                        "tp({}): proving link {} for {}",
                        self.config.name,
                        link_id,
                        packet.destination
                    );
                    self.links.insert(link_id, link);
                    self.link_routes.insert(link_id, iface);
                    self.push_frame(iface, &proof, actions);
                }
                Err(reason) => {
                    self.stats.malformed += 1;
                    actions.push(TransportAction::Drop { reason });
                }
            }
            return;
        }

        if self.config.retransmit {
            if let Some(entry) = self.path_table.get(&packet.destination) {
                let next_hop = entry.received_from;
                let next_iface = entry.iface;
                self.link_table.add(packet, iface, next_hop, next_iface, now);
                self.forward(packet, iface, now, actions);
                return;
            }
        }

        self.stats.no_path += 1;
        actions.push(TransportAction::Drop { reason: TrellisError::NoPath });
    }

    fn handle_proof(
        &mut self,
        packet: &Packet,
        iface: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        if self.links.contains_key(&packet.destination) {
            self.handle_link_packet(packet, iface, now, actions);
            return;
        }

        if packet.context == PacketContext::LinkRequestProof {
            if let Some((switched, out_iface)) = self.link_table.handle_proof(packet, now) {
                self.push_frame(out_iface, &switched, actions);
                return;
            }
        } else if let Some((switched, out_iface)) =
            self.link_table.handle_traffic(packet, iface, now)
        {
            self.push_frame(out_iface, &switched, actions);
            return;
        }

        actions.push(TransportAction::Drop { reason: TrellisError::NoPath });
    }

    fn handle_data(
        &mut self,
        packet: &Packet,
        iface: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        if packet.header.destination_type == DestinationType::Link {
            if self.links.contains_key(&packet.destination) {
                self.handle_link_packet(packet, iface, now, actions);
            } else if let Some((switched, out_iface)) =
                self.link_table.handle_traffic(packet, iface, now)
            {
                self.push_frame(out_iface, &switched, actions);
            }
            return;
        }

        let packet_hash = packet.hash();

        if let Some(destination) = self.in_destinations.get(&packet.destination) {
            match destination.decrypt(packet.data.as_slice()) {
                Ok((plaintext, _ratchet_used)) => {
                    self.stats.delivered += 1;
                    actions.push(TransportAction::DeliverLocal {
                        destination: packet.destination,
                        data: plaintext,
                        packet_hash,
                    });
                }
                Err(reason) => {
                    log::debug!(
                        "tp({}): can't decrypt packet for {}",
                        self.config.name,
                        packet.destination
                    );
                    self.stats.signature_failures += 1;
                    actions.push(TransportAction::Drop { reason });
                }
            }
            return;
        }

        if let Some(group) = self.group_destinations.get(&packet.destination) {
            match group.decrypt(packet.data.as_slice()) {
                Ok(plaintext) => {
                    self.stats.delivered += 1;
                    actions.push(TransportAction::DeliverLocal {
                        destination: packet.destination,
                        data: plaintext,
                        packet_hash,
                    });
                }
                Err(reason) => {
                    self.stats.signature_failures += 1;
                    actions.push(TransportAction::Drop { reason });
                }
            }
            return;
        }

        if self.plain_destinations.contains(&packet.destination) {
            self.stats.delivered += 1;
            actions.push(TransportAction::DeliverLocal {
                destination: packet.destination,
                data: packet.data.as_slice().to_vec(),
                packet_hash,
            });
            return;
        }

        self.forward(packet, iface, now, actions);
    }

    /// Forwards a packet toward its next hop when this node routes.
    fn forward(
        &mut self,
        packet: &Packet,
        _arrival: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        if !self.config.retransmit {
            self.stats.no_path += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::NoPath });
            return;
        }

        // Transported frames name the router that should carry them on.
        if packet.header.header_type == HeaderType::Transported
            && packet.transport != Some(self.identity_hash())
        {
            return;
        }

        if packet.header.hops >= MAX_HOPS {
            self.stats.no_path += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::NoPath });
            return;
        }

        let Some(entry) = self.path_table.get(&packet.destination) else {
            self.stats.no_path += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::NoPath });
            return;
        };

        let out_iface = entry.iface;
        let next_hop = entry.received_from;

        let forwarded = Packet {
            header: Header {
                header_type: HeaderType::Transported,
                propagation_type: PropagationType::Transport,
                hops: packet.header.hops.saturating_add(1),
                ..packet.header
            },
            ifac: None,
            destination: packet.destination,
            transport: Some(next_hop),
            context: packet.context,
            data: packet.data,
        };

        let Ok(bytes) = forwarded.to_bytes() else {
            self.stats.malformed += 1;
            return;
        };

        let allowed = self
            .data_buckets
            .get_mut(&out_iface)
            .map(|bucket| bucket.try_consume(bytes.len(), now))
            .unwrap_or(false);

        if !allowed {
            self.stats.rate_limited += 1;
            actions.push(TransportAction::Drop { reason: TrellisError::RateLimited });
            return;
        }

        self.stats.forwarded += 1;
        actions.push(TransportAction::SendFrame { iface: out_iface, bytes });
    }

    fn handle_link_packet(
        &mut self,
        packet: &Packet,
        iface: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        let link_id = packet.destination;
        let mut outgoing: Vec<Packet> = Vec::new();
        let mut closed_reason: Option<TrellisError> = None;

        {
            let Some(link) = self.links.get_mut(&link_id) else {
                return;
            };

            // In-link traffic follows the freshest arrival interface.
            self.link_routes.insert(link_id, iface);

            match link.handle_packet(packet, now) {
                LinkInbound::None => {}
                LinkInbound::Activated { proof } => {
                    actions.push(TransportAction::LinkActivated { link_id });
                    if let Some(proof) = proof {
                        outgoing.push(proof);
                    }
                }
                LinkInbound::KeepAliveReply(reply) => {
                    outgoing.push(reply);
                }
                LinkInbound::Identified { identity_hash } => {
                    actions.push(TransportAction::LinkIdentified { link_id, identity_hash });
                }
                LinkInbound::Closed => {
                    closed_reason = Some(TrellisError::LinkClosed);
                }
                LinkInbound::Data { context, plaintext } => match context {
                    PacketContext::None => {
                        actions.push(TransportAction::LinkData { link_id, data: plaintext });
                    }
                    PacketContext::Resource
                    | PacketContext::ResourceAdvertisement
                    | PacketContext::ResourceAck
                    | PacketContext::ResourceProof
                    | PacketContext::ResourceCancel => {
                        let (packets, events) =
                            self.resources.handle_payload(link, context, &plaintext, now);
                        outgoing.extend(packets);
                        actions.extend(events.into_iter().map(TransportAction::Resource));
                    }
                    _ => {}
                },
            }
        }

        for outbound in outgoing {
            self.push_link_frame(&link_id, &outbound, actions);
        }

        if let Some(reason) = closed_reason {
            self.drop_link(&link_id, reason, actions);
        }
    }

    fn drop_link(
        &mut self,
        link_id: &LinkId,
        reason: TrellisError,
        actions: &mut Vec<TransportAction>,
    ) {
        self.links.remove(link_id);
        self.link_routes.remove(link_id);
        actions.push(TransportAction::LinkClosed { link_id: *link_id, reason });
        actions.extend(
            self.resources.fail_for_link(link_id).into_iter().map(TransportAction::Resource),
        );
    }

    // --- path requests ----------------------------------------------------

    fn handle_path_request(
        &mut self,
        packet: &Packet,
        iface: InterfaceId,
        now: f64,
        actions: &mut Vec<TransportAction>,
    ) {
        let data = packet.data.as_slice();
        if data.len() <= ADDRESS_LENGTH {
            self.stats.malformed += 1;
            return;
        }

        let Ok(requested) = AddressHash::try_from_slice(&data[..ADDRESS_LENGTH]) else {
            return;
        };

        // One response per (destination, tag) pair.
        let request_key = AddressHash::of(data);
        if !self.path_request_filter.insert(request_key, now) {
            return;
        }

        if let Some(destination) = self.in_destinations.get_mut(&requested) {
            if let Ok(response) = destination.path_response(OsRng, now, None) {
                log::trace!(
                    "tp({}): direct path response for {} over {}",
                    self.config.name,
                    requested,
                    iface
                );
                self.push_frame(iface, &response, actions);
            }
            return;
        }

        if !self.config.retransmit {
            return;
        }

        if let Some(entry) = self.path_table.get(&requested) {
            let hops = entry.hops;
            if let Some(retained) = self.announce_history.get(&requested) {
                let mut response = *retained;
                response.header.header_type = HeaderType::Transported;
                response.header.hops = hops;
                response.transport = Some(self.identity_hash());
                response.context = PacketContext::PathResponse;
                log::trace!(
                    "tp({}): remote path response for {} ({} hops) over {}",
                    self.config.name,
                    requested,
                    hops,
                    iface
                );
                self.push_frame(iface, &response, actions);
                return;
            }
        }

        // Recurse the request outward, shielded by the (dest, tag) filter.
        for (iface_id, desc) in self.ifaces.iter() {
            if *iface_id == iface || !desc.up {
                continue;
            }
            if let Ok(bytes) = packet.to_bytes() {
                actions.push(TransportAction::SendFrame { iface: *iface_id, bytes });
            }
        }
    }

    /// Broadcasts a path request for a destination without a known path.
    pub fn request_path(&mut self, destination: &AddressHash, _now: f64) -> Vec<TransportAction> {
        let mut tag = [0u8; PATH_REQUEST_TAG_LEN];
        use rand_core::RngCore;
        OsRng.fill_bytes(&mut tag);

        let mut request = Vec::with_capacity(ADDRESS_LENGTH * 3);
        request.extend_from_slice(destination.as_slice());
        if self.config.retransmit {
            request.extend_from_slice(self.identity_hash().as_slice());
        }
        request.extend_from_slice(&tag);
        let data = PacketDataBuffer::from_slice(&request);

        let packet = Packet {
            header: Header {
                destination_type: DestinationType::Plain,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.path_request_dest,
            transport: None,
            context: PacketContext::None,
            data,
        };

        let mut actions = Vec::new();
        self.broadcast(&packet, None, &mut actions);
        actions
    }

    // --- outbound ---------------------------------------------------------

    /// Emits an announce for a registered destination on every up
    /// interface, under the announce budget.
    pub fn announce(
        &mut self,
        destination: &AddressHash,
        app_data: Option<&[u8]>,
        now: f64,
    ) -> Result<Vec<TransportAction>, TrellisError> {
        let dest = self
            .in_destinations
            .get_mut(destination)
            .ok_or(TrellisError::InvalidArgument)?;
        let packet = dest.announce(OsRng, now, app_data)?;
        let bytes = packet.to_bytes()?;

        let mut actions = Vec::new();
        for (iface_id, desc) in self.ifaces.iter() {
            if !desc.up {
                continue;
            }
            if let Some(queue) = self.announce_queues.get_mut(iface_id) {
                if let Some(ready) = queue.submit(bytes.clone(), 0, now) {
                    actions.push(TransportAction::SendFrame { iface: *iface_id, bytes: ready });
                }
            }
        }

        Ok(actions)
    }

    /// Routes a host-submitted packet. No path for a SINGLE destination is
    /// reported synchronously as a `Drop { NoPath }` action.
    pub fn outbound(&mut self, packet: Packet, _now: f64) -> Vec<TransportAction> {
        let mut actions = Vec::new();

        let (routed, iface) = self.path_table.route_packet(&packet);
        if let Some(iface) = iface {
            self.push_frame(iface, &routed, &mut actions);
            return actions;
        }

        match packet.header.destination_type {
            DestinationType::Plain | DestinationType::Group => {
                self.broadcast(&packet, None, &mut actions);
            }
            DestinationType::Link => {
                let link_id = packet.destination;
                self.push_link_frame(&link_id, &packet, &mut actions);
            }
            DestinationType::Single => {
                self.stats.no_path += 1;
                log::trace!(
                    "tp({}): no route for outbound packet dst={}",
                    self.config.name,
                    packet.destination
                );
                actions.push(TransportAction::Drop { reason: TrellisError::NoPath });
            }
        }

        actions
    }

    /// Encrypts and sends a single datagram to a destination learned from
    /// announces, preferring its current ratchet key.
    pub fn send_data(
        &mut self,
        destination: &AddressHash,
        payload: &[u8],
        now: f64,
    ) -> Result<Vec<TransportAction>, TrellisError> {
        let known = self.known_destinations.get(destination).ok_or(TrellisError::NoPath)?;
        let identity = known.identity;

        let public_key = match self.ratchet_store.get(destination, now) {
            Some(ratchet) => PublicKey::from(ratchet),
            None => identity.public_key,
        };

        let ciphertext =
            encrypt_for_public_key(&public_key, destination.as_slice(), payload, OsRng)?;

        let mut data = PacketDataBuffer::empty();
        data.push(&ciphertext)?;

        let packet = Packet {
            header: Header {
                destination_type: DestinationType::Single,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: *destination,
            transport: None,
            context: PacketContext::None,
            data,
        };

        Ok(self.outbound(packet, now))
    }

    // --- links ------------------------------------------------------------

    /// Opens a link to a destination learned from announces. Returns the
    /// link id and the actions carrying the LINKREQUEST.
    pub fn open_link(
        &mut self,
        destination: &AddressHash,
        now: f64,
    ) -> Result<(LinkId, Vec<TransportAction>), TrellisError> {
        let known = self.known_destinations.get(destination).ok_or(TrellisError::NoPath)?;
        let desc = known.desc;

        let ratchet = self.ratchet_store.get(destination, now);
        let (link, request) = Link::new_outbound(desc, ratchet, now);
        let link_id = *link.id();

        let mut actions = Vec::new();
        let (routed, iface) = self.path_table.route_packet(&request);
        match iface {
            Some(iface) => {
                self.link_routes.insert(link_id, iface);
                self.push_frame(iface, &routed, &mut actions);
            }
            None => {
                self.broadcast(&request, None, &mut actions);
            }
        }

        self.links.insert(link_id, link);

        Ok((link_id, actions))
    }

    pub fn send_link_data(
        &mut self,
        link_id: &LinkId,
        payload: &[u8],
        now: f64,
    ) -> Result<Vec<TransportAction>, TrellisError> {
        let link = self.links.get_mut(link_id).ok_or(TrellisError::LinkClosed)?;
        let packet = link.data_packet(payload, now)?;

        let mut actions = Vec::new();
        self.push_link_frame(link_id, &packet, &mut actions);
        Ok(actions)
    }

    /// Proves this node's long-term identity to the link peer.
    pub fn identify_on_link(
        &mut self,
        link_id: &LinkId,
        now: f64,
    ) -> Result<Vec<TransportAction>, TrellisError> {
        let identity = self.config.identity.clone();
        let link = self.links.get_mut(link_id).ok_or(TrellisError::LinkClosed)?;
        let packet = link.identify(&identity, now)?;

        let mut actions = Vec::new();
        self.push_link_frame(link_id, &packet, &mut actions);
        Ok(actions)
    }

    pub fn close_link(&mut self, link_id: &LinkId, now: f64) -> Vec<TransportAction> {
        let mut actions = Vec::new();

        let teardown = match self.links.get_mut(link_id) {
            Some(link) => link.close(now),
            None => return actions,
        };

        if let Some(packet) = teardown {
            self.push_link_frame(link_id, &packet, &mut actions);
        }

        self.drop_link(link_id, TrellisError::LinkClosed, &mut actions);
        actions
    }

    /// Starts a windowed resource transfer over an active link.
    pub fn send_resource(
        &mut self,
        link_id: &LinkId,
        data: &[u8],
        now: f64,
    ) -> Result<(AddressHash, Vec<TransportAction>), TrellisError> {
        let mut actions = Vec::new();
        let (resource_id, advertisement) = {
            let link = self.links.get_mut(link_id).ok_or(TrellisError::LinkClosed)?;
            if link.status() != LinkStatus::Active {
                return Err(TrellisError::LinkClosed);
            }
            self.resources.start_send(link, data, now)?
        };

        self.push_link_frame(link_id, &advertisement, &mut actions);
        Ok((resource_id, actions))
    }

    pub fn resource_window(&self, resource_id: &AddressHash) -> Option<usize> {
        self.resources.current_window(resource_id)
    }

    // --- maintenance ------------------------------------------------------

    pub fn tick(&mut self, now: f64) -> Vec<TransportAction> {
        let mut actions = Vec::new();

        let ifaces = &self.ifaces;
        self.path_table
            .expire(now, |id| ifaces.get(id).map(|desc| desc.up).unwrap_or(false));

        self.dedup.release(now);
        self.announce_dedup.release(now);
        self.path_request_filter.release(now);
        self.ratchet_store.clean_expired(now);
        self.link_table.remove_stale(now);

        // Budgeted announce queue drain.
        for (iface_id, queue) in self.announce_queues.iter_mut() {
            for bytes in queue.drain(now) {
                actions.push(TransportAction::SendFrame { iface: *iface_id, bytes });
            }
        }

        // Link timers.
        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        for link_id in link_ids {
            let upkeep = match self.links.get_mut(&link_id) {
                Some(link) => link.upkeep(now),
                None => continue,
            };

            match upkeep {
                LinkUpkeep::None | LinkUpkeep::WentStale => {}
                LinkUpkeep::SendKeepAlive(packet) => {
                    self.push_link_frame(&link_id, &packet, &mut actions);
                }
                LinkUpkeep::Close { teardown, reason } => {
                    if let Some(packet) = teardown {
                        self.push_link_frame(&link_id, &packet, &mut actions);
                    }
                    self.drop_link(&link_id, reason, &mut actions);
                }
            }
        }

        // Resource retransmission deadlines.
        if !self.resources.is_idle() {
            let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
            for link_id in link_ids {
                let (packets, events) = {
                    let Some(link) = self.links.get_mut(&link_id) else {
                        continue;
                    };
                    self.resources.tick_link(link, now)
                };
                for packet in packets {
                    self.push_link_frame(&link_id, &packet, &mut actions);
                }
                actions.extend(events.into_iter().map(TransportAction::Resource));
            }
        }

        actions
    }

    // --- helpers ----------------------------------------------------------

    fn push_frame(&self, iface: InterfaceId, packet: &Packet, actions: &mut Vec<TransportAction>) {
        if let Ok(bytes) = packet.to_bytes() {
            actions.push(TransportAction::SendFrame { iface, bytes });
        }
    }

    fn broadcast(
        &self,
        packet: &Packet,
        except: Option<InterfaceId>,
        actions: &mut Vec<TransportAction>,
    ) {
        let Ok(bytes) = packet.to_bytes() else {
            return;
        };
        for (iface_id, desc) in self.ifaces.iter() {
            if !desc.up || Some(*iface_id) == except {
                continue;
            }
            actions.push(TransportAction::SendFrame { iface: *iface_id, bytes: bytes.clone() });
        }
    }

    /// Sends an in-link packet along the freshest route for its link, or
    /// broadcasts when the route is unknown.
    fn push_link_frame(
        &mut self,
        link_id: &LinkId,
        packet: &Packet,
        actions: &mut Vec<TransportAction>,
    ) {
        match self.link_routes.get(link_id) {
            Some(iface) if self.ifaces.get(iface).map(|desc| desc.up).unwrap_or(false) => {
                self.push_frame(*iface, packet, actions);
            }
            _ => self.broadcast(packet, None, actions),
        }
    }
}
