use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use trellis_core::error::{ResourceFailure, TrellisError};
use trellis_core::hash::{AddressHash, Hash, ADDRESS_LENGTH, HASH_LENGTH};
use trellis_core::packet::{Packet, PacketContext, PacketType, ENCRYPTED_MDU};

use crate::link::{hmac_sha256, Link, LinkId};

/// Sliding transmit window bounds and starting point.
pub const WINDOW_MIN: usize = 2;
pub const WINDOW_MAX: usize = 75;
pub const WINDOW_START: usize = 4;

/// A part exceeding this many send attempts fails the whole resource.
pub const MAX_PART_RETRIES: u8 = 16;

/// Payload ceiling for a single resource, pre-compression.
pub const MAX_RESOURCE_SIZE: usize = 16 * 1024 * 1024;

const PART_HEADER_LEN: usize = ADDRESS_LENGTH + 4;
/// Ciphertext chunk per part, sized to the link's encrypted MDU.
pub const PART_SIZE: usize = ENCRYPTED_MDU - PART_HEADER_LEN;

const FLAG_COMPRESSED: u8 = 0x02;

const ACK_EVERY_PARTS: usize = 4;
const ACK_MAX_MISSING: usize = 48;
const ADVERTISEMENT_MAX_RETRIES: u8 = 5;
const RECEIVER_IDLE_TIMEOUT_SECS: f64 = 120.0;
const MIN_PART_DEADLINE_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Advertised,
    Transferring,
    Assembling,
    AwaitingProof,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Progress {
        resource_id: AddressHash,
        link_id: LinkId,
        received_parts: usize,
        total_parts: usize,
    },
    /// Inbound transfer finished and verified.
    Complete { resource_id: AddressHash, link_id: LinkId, data: Vec<u8> },
    /// Outbound transfer acknowledged by the receiver's proof.
    Delivered { resource_id: AddressHash, link_id: LinkId },
    Failed { resource_id: AddressHash, link_id: LinkId, reason: ResourceFailure },
}

#[derive(Debug, Serialize, Deserialize)]
struct AdvertisementFrame {
    #[serde(rename = "i", with = "serde_bytes")]
    resource_id: Vec<u8>,
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "f")]
    flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub resource_id: AddressHash,
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Hash,
    pub compressed: bool,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, TrellisError> {
        let frame = AdvertisementFrame {
            resource_id: self.resource_id.as_slice().to_vec(),
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            flags: if self.compressed { FLAG_COMPRESSED } else { 0 },
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| TrellisError::MalformedPacket)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, TrellisError> {
        let frame: AdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| TrellisError::MalformedPacket)?;
        Ok(Self {
            resource_id: AddressHash::try_from_slice(&frame.resource_id)?,
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Hash::try_from_slice(&frame.hash)?,
            compressed: (frame.flags & FLAG_COMPRESSED) == FLAG_COMPRESSED,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AckFrame {
    #[serde(rename = "i", with = "serde_bytes")]
    resource_id: Vec<u8>,
    #[serde(rename = "c")]
    next_needed: u32,
    #[serde(rename = "m")]
    missing: Vec<u32>,
}

/// Receiver window report: everything below `next_needed` arrived, the
/// listed indices above it are still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAck {
    pub resource_id: AddressHash,
    pub next_needed: u32,
    pub missing: Vec<u32>,
}

impl ResourceAck {
    pub fn pack(&self) -> Result<Vec<u8>, TrellisError> {
        let frame = AckFrame {
            resource_id: self.resource_id.as_slice().to_vec(),
            next_needed: self.next_needed,
            missing: self.missing.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| TrellisError::MalformedPacket)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, TrellisError> {
        let frame: AckFrame =
            rmp_serde::from_slice(data).map_err(|_| TrellisError::MalformedPacket)?;
        let mut missing = frame.missing;
        missing.truncate(ACK_MAX_MISSING);
        Ok(Self {
            resource_id: AddressHash::try_from_slice(&frame.resource_id)?,
            next_needed: frame.next_needed,
            missing,
        })
    }
}

#[derive(Clone, Copy)]
struct PartFlight {
    deadline: f64,
    /// Whether the current transmission was already repaired once from an
    /// ack report; repeats wait for the deadline.
    ack_nudged: bool,
}

struct OutboundResource {
    id: AddressHash,
    link_id: LinkId,
    parts: Vec<Vec<u8>>,
    acked: Vec<bool>,
    retries: Vec<u8>,
    in_flight: BTreeMap<u32, PartFlight>,
    window: usize,
    next_fresh: u32,
    expected_proof: [u8; 32],
    advertisement: ResourceAdvertisement,
    advertisement_retries: u8,
    advertisement_deadline: f64,
    accepted: bool,
    status: ResourceStatus,
}

impl OutboundResource {
    fn part_deadline(&self, link: &Link, now: f64) -> f64 {
        now + (2.5 * link.rtt()).max(MIN_PART_DEADLINE_SECS)
    }

    fn part_packet(
        &self,
        link: &mut Link,
        index: u32,
        now: f64,
    ) -> Result<Packet, TrellisError> {
        let chunk = self.parts.get(index as usize).ok_or(TrellisError::InvalidArgument)?;
        let mut payload = Vec::with_capacity(PART_HEADER_LEN + chunk.len());
        payload.extend_from_slice(self.id.as_slice());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(chunk);
        link.raw_packet(&payload, PacketType::Data, PacketContext::Resource, now)
    }

    /// Sends fresh parts until the window is full.
    fn fill_window(&mut self, link: &mut Link, now: f64) -> Vec<Packet> {
        let mut packets = Vec::new();

        while self.in_flight.len() < self.window && (self.next_fresh as usize) < self.parts.len() {
            let index = self.next_fresh;
            self.next_fresh += 1;

            if self.acked[index as usize] {
                continue;
            }

            match self.part_packet(link, index, now) {
                Ok(packet) => {
                    self.in_flight.insert(
                        index,
                        PartFlight { deadline: self.part_deadline(link, now), ack_nudged: false },
                    );
                    packets.push(packet);
                }
                Err(_) => break,
            }
        }

        packets
    }

    fn retransmit(
        &mut self,
        link: &mut Link,
        index: u32,
        now: f64,
        via_ack: bool,
    ) -> Result<Option<Packet>, ResourceFailure> {
        if self.acked[index as usize] {
            return Ok(None);
        }

        if self.retries[index as usize] >= MAX_PART_RETRIES {
            return Err(ResourceFailure::RetriesExhausted);
        }

        match self.part_packet(link, index, now) {
            Ok(packet) => {
                self.retries[index as usize] += 1;
                self.in_flight.insert(
                    index,
                    PartFlight { deadline: self.part_deadline(link, now), ack_nudged: via_ack },
                );
                Ok(Some(packet))
            }
            Err(_) => Ok(None),
        }
    }

    fn shrink_window(&mut self) {
        self.window = (self.window / 2).max(WINDOW_MIN);
    }

    fn grow_window(&mut self) {
        self.window = (self.window + 1).min(WINDOW_MAX);
    }

    fn all_acked(&self) -> bool {
        self.acked.iter().all(|acked| *acked)
    }
}

struct InboundResource {
    id: AddressHash,
    link_id: LinkId,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    expected_hash: Hash,
    compressed: bool,
    since_ack: usize,
    last_activity: f64,
    status: ResourceStatus,
}

impl InboundResource {
    fn build_ack(&self) -> ResourceAck {
        let next_needed =
            self.parts.iter().position(|part| part.is_none()).unwrap_or(self.parts.len());

        // Gaps below the highest received index have provably been passed
        // by later parts, so they are loss, not reordering.
        let max_received = self.parts.iter().rposition(|part| part.is_some());

        let mut missing = Vec::new();
        if let Some(max_received) = max_received {
            for index in next_needed..max_received {
                if self.parts[index].is_none() {
                    missing.push(index as u32);
                    if missing.len() >= ACK_MAX_MISSING {
                        break;
                    }
                }
            }
        }

        ResourceAck { resource_id: self.id, next_needed: next_needed as u32, missing }
    }
}

/// Windowed segmented transfer over established links. The whole payload is
/// encrypted once under the link session key, the ciphertext split into
/// indexed parts, pushed inside a sliding window and repaired from receiver
/// acks until the reassembled payload verifies against the advertised hash.
pub struct ResourceManager {
    outbound: HashMap<AddressHash, OutboundResource>,
    inbound: HashMap<AddressHash, InboundResource>,
    /// Proof payloads of recently completed inbound transfers, replayed
    /// when a sender that missed the proof keeps retransmitting parts.
    completed: HashMap<AddressHash, Vec<u8>>,
}

const COMPLETED_PROOF_CAP: usize = 64;

impl ResourceManager {
    pub fn new() -> Self {
        Self { outbound: HashMap::new(), inbound: HashMap::new(), completed: HashMap::new() }
    }

    pub fn is_idle(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    /// Starts an outbound transfer, returning the resource id and the
    /// advertisement packet.
    pub fn start_send(
        &mut self,
        link: &mut Link,
        data: &[u8],
        now: f64,
    ) -> Result<(AddressHash, Packet), TrellisError> {
        if data.is_empty() || data.len() > MAX_RESOURCE_SIZE {
            return Err(TrellisError::InvalidArgument);
        }

        let (payload, compressed) = match compress(data) {
            Some(smaller) => (smaller, true),
            None => (data.to_vec(), false),
        };

        let expected_hash = Hash::of(&payload);

        let mut id_material = [0u8; ADDRESS_LENGTH + HASH_LENGTH];
        OsRng.fill_bytes(&mut id_material[..ADDRESS_LENGTH]);
        id_material[ADDRESS_LENGTH..].copy_from_slice(expected_hash.as_slice());
        let resource_id = AddressHash::of(&id_material);

        let ciphertext = link.encrypt_payload(&payload)?;
        let parts: Vec<Vec<u8>> =
            ciphertext.chunks(PART_SIZE).map(|chunk| chunk.to_vec()).collect();
        let part_count = parts.len();

        let mut proof_subject = [0u8; ADDRESS_LENGTH + HASH_LENGTH];
        proof_subject[..ADDRESS_LENGTH].copy_from_slice(resource_id.as_slice());
        proof_subject[ADDRESS_LENGTH..].copy_from_slice(expected_hash.as_slice());
        let expected_proof = hmac_sha256(link.session_sign_key(), &proof_subject);

        let advertisement = ResourceAdvertisement {
            resource_id,
            transfer_size: ciphertext.len() as u64,
            data_size: payload.len() as u64,
            parts: part_count as u32,
            hash: expected_hash,
            compressed,
        };

        let packet = link.data_packet_with_context(
            &advertisement.pack()?,
            PacketContext::ResourceAdvertisement,
            now,
        )?;

        log::debug!(
            "resource({}): advertise {} parts, {} bytes over {}",
            resource_id,
            part_count,
            ciphertext.len(),
            link.id(),
        );

        self.outbound.insert(
            resource_id,
            OutboundResource {
                id: resource_id,
                link_id: *link.id(),
                parts,
                acked: vec![false; part_count],
                retries: vec![0; part_count],
                in_flight: BTreeMap::new(),
                window: WINDOW_START,
                next_fresh: 0,
                expected_proof,
                advertisement,
                advertisement_retries: 0,
                advertisement_deadline: now + (2.5 * link.rtt()).max(MIN_PART_DEADLINE_SECS),
                accepted: false,
                status: ResourceStatus::Advertised,
            },
        );

        Ok((resource_id, packet))
    }

    /// Demultiplexes one in-link resource payload. `payload` is the
    /// decrypted plaintext for control frames and the raw packet data for
    /// parts and proofs.
    pub fn handle_payload(
        &mut self,
        link: &mut Link,
        context: PacketContext,
        payload: &[u8],
        now: f64,
    ) -> (Vec<Packet>, Vec<ResourceEvent>) {
        match context {
            PacketContext::ResourceAdvertisement => self.handle_advertisement(link, payload, now),
            PacketContext::ResourceAck => self.handle_ack(link, payload, now),
            PacketContext::Resource => self.handle_part(link, payload, now),
            PacketContext::ResourceProof => self.handle_proof(link, payload),
            PacketContext::ResourceCancel => self.handle_cancel(payload),
            _ => (Vec::new(), Vec::new()),
        }
    }

    fn handle_advertisement(
        &mut self,
        link: &mut Link,
        payload: &[u8],
        now: f64,
    ) -> (Vec<Packet>, Vec<ResourceEvent>) {
        let Ok(adv) = ResourceAdvertisement::unpack(payload) else {
            return (Vec::new(), Vec::new());
        };

        let expected_parts =
            (adv.transfer_size as usize).div_ceil(PART_SIZE);
        if adv.transfer_size == 0
            || adv.data_size as usize > MAX_RESOURCE_SIZE
            || adv.parts as usize != expected_parts
        {
            log::warn!("resource({}): rejecting malformed advertisement", adv.resource_id);
            let cancel = link
                .data_packet_with_context(
                    adv.resource_id.as_slice(),
                    PacketContext::ResourceCancel,
                    now,
                )
                .ok();
            return (cancel.into_iter().collect(), Vec::new());
        }

        // A repeated advertisement means the accept ack was lost.
        if let Some(receiver) = self.inbound.get(&adv.resource_id) {
            let packets = receiver
                .build_ack()
                .pack()
                .and_then(|bytes| {
                    link.data_packet_with_context(&bytes, PacketContext::ResourceAck, now)
                })
                .map(|packet| vec![packet])
                .unwrap_or_default();
            return (packets, Vec::new());
        }

        let receiver = InboundResource {
            id: adv.resource_id,
            link_id: *link.id(),
            parts: vec![None; adv.parts as usize],
            received: 0,
            expected_hash: adv.hash,
            compressed: adv.compressed,
            since_ack: 0,
            last_activity: now,
            status: ResourceStatus::Transferring,
        };

        log::debug!(
            "resource({}): accepting {} parts over {}",
            adv.resource_id,
            adv.parts,
            link.id()
        );

        let accept = receiver.build_ack();
        self.inbound.insert(adv.resource_id, receiver);

        let packets = accept
            .pack()
            .and_then(|bytes| {
                link.data_packet_with_context(&bytes, PacketContext::ResourceAck, now)
            })
            .map(|packet| vec![packet])
            .unwrap_or_default();

        (packets, Vec::new())
    }

    fn handle_ack(
        &mut self,
        link: &mut Link,
        payload: &[u8],
        now: f64,
    ) -> (Vec<Packet>, Vec<ResourceEvent>) {
        let Ok(ack) = ResourceAck::unpack(payload) else {
            return (Vec::new(), Vec::new());
        };

        let Some(resource) = self.outbound.get_mut(&ack.resource_id) else {
            return (Vec::new(), Vec::new());
        };

        resource.accepted = true;
        if resource.status == ResourceStatus::Advertised {
            resource.status = ResourceStatus::Transferring;
        }

        // Cumulative edge: everything below next_needed has arrived. Parts
        // in flight above it stay in flight; the deadline timer covers
        // them if their ack never comes.
        for index in 0..(ack.next_needed as usize).min(resource.acked.len()) {
            if !resource.acked[index] {
                resource.acked[index] = true;
                resource.in_flight.remove(&(index as u32));
            }
        }

        let mut packets = Vec::new();
        let mut events = Vec::new();

        // Repair each reported gap once per transmission; repeated reports
        // of the same gap wait for the deadline instead of burning the
        // retry budget.
        let mut failure: Option<ResourceFailure> = None;
        let mut repaired = false;
        for index in ack.missing.iter().copied() {
            if resource.in_flight.get(&index).map(|flight| flight.ack_nudged).unwrap_or(false) {
                continue;
            }

            match resource.retransmit(link, index, now, true) {
                Ok(Some(packet)) => {
                    repaired = true;
                    packets.push(packet);
                }
                Ok(None) => {}
                Err(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }

        if ack.missing.is_empty() {
            resource.grow_window();
        } else if repaired {
            resource.shrink_window();
        }

        if let Some(reason) = failure {
            let resource_id = resource.id;
            let link_id = resource.link_id;
            events.push(ResourceEvent::Failed { resource_id, link_id, reason });
            self.outbound.remove(&resource_id);
            if let Ok(cancel) = link.data_packet_with_context(
                resource_id.as_slice(),
                PacketContext::ResourceCancel,
                now,
            ) {
                packets.push(cancel);
            }
            return (packets, events);
        }

        if resource.all_acked() {
            if resource.status != ResourceStatus::AwaitingProof {
                resource.status = ResourceStatus::AwaitingProof;
                resource.advertisement_retries = 0;
                resource.advertisement_deadline = resource.part_deadline(link, now);
            }
        } else {
            packets.extend(resource.fill_window(link, now));
        }

        (packets, events)
    }

    fn handle_part(
        &mut self,
        link: &mut Link,
        payload: &[u8],
        now: f64,
    ) -> (Vec<Packet>, Vec<ResourceEvent>) {
        if payload.len() <= PART_HEADER_LEN {
            return (Vec::new(), Vec::new());
        }

        let Ok(resource_id) = AddressHash::try_from_slice(&payload[..ADDRESS_LENGTH]) else {
            return (Vec::new(), Vec::new());
        };

        let mut index_bytes = [0u8; 4];
        index_bytes.copy_from_slice(&payload[ADDRESS_LENGTH..PART_HEADER_LEN]);
        let index = u32::from_be_bytes(index_bytes) as usize;

        let Some(receiver) = self.inbound.get_mut(&resource_id) else {
            // A retransmitted part for a transfer that already completed
            // means the sender missed the proof; replay it.
            if let Some(proof_payload) = self.completed.get(&resource_id) {
                let packets = link
                    .raw_packet(
                        proof_payload,
                        PacketType::Proof,
                        PacketContext::ResourceProof,
                        now,
                    )
                    .map(|packet| vec![packet])
                    .unwrap_or_default();
                return (packets, Vec::new());
            }
            return (Vec::new(), Vec::new());
        };

        if index >= receiver.parts.len() {
            return (Vec::new(), Vec::new());
        }

        receiver.last_activity = now;

        let duplicate = receiver.parts[index].is_some();
        if !duplicate {
            receiver.parts[index] = Some(payload[PART_HEADER_LEN..].to_vec());
            receiver.received += 1;
            receiver.since_ack += 1;
        }

        let complete = receiver.received == receiver.parts.len();

        let mut packets = Vec::new();
        let mut events = Vec::new();

        if complete {
            receiver.status = ResourceStatus::Assembling;
            let (mut finish_packets, mut finish_events) = self.finish_inbound(link, resource_id, now);
            packets.append(&mut finish_packets);
            events.append(&mut finish_events);
        } else {
            // Duplicates mean the sender is already retransmitting; answer
            // with a fresh window report so it can see the real gaps.
            if receiver.since_ack >= ACK_EVERY_PARTS || duplicate {
                receiver.since_ack = 0;
                let ack = receiver.build_ack();
                if let Ok(bytes) = ack.pack() {
                    if let Ok(packet) =
                        link.data_packet_with_context(&bytes, PacketContext::ResourceAck, now)
                    {
                        packets.push(packet);
                    }
                }
            }
            events.push(ResourceEvent::Progress {
                resource_id,
                link_id: *link.id(),
                received_parts: receiver.received,
                total_parts: receiver.parts.len(),
            });
        }

        (packets, events)
    }

    fn finish_inbound(
        &mut self,
        link: &mut Link,
        resource_id: AddressHash,
        now: f64,
    ) -> (Vec<Packet>, Vec<ResourceEvent>) {
        let Some(receiver) = self.inbound.remove(&resource_id) else {
            return (Vec::new(), Vec::new());
        };

        let mut ciphertext = Vec::new();
        for part in receiver.parts.iter() {
            match part {
                Some(bytes) => ciphertext.extend_from_slice(bytes),
                None => return (Vec::new(), Vec::new()),
            }
        }

        let fail = |reason: ResourceFailure| {
            (
                Vec::new(),
                vec![ResourceEvent::Failed { resource_id, link_id: receiver.link_id, reason }],
            )
        };

        let Ok(payload) = link.decrypt_payload(&ciphertext) else {
            log::warn!("resource({}): payload does not decrypt", resource_id);
            return fail(ResourceFailure::HashMismatch);
        };

        if Hash::of(&payload) != receiver.expected_hash {
            log::warn!("resource({}): reassembled hash mismatch", resource_id);
            return fail(ResourceFailure::HashMismatch);
        }

        let data = if receiver.compressed {
            let mut decoder = BzDecoder::new(payload.as_slice());
            let mut decompressed = Vec::new();
            if decoder.read_to_end(&mut decompressed).is_err() {
                return fail(ResourceFailure::HashMismatch);
            }
            decompressed
        } else {
            payload
        };

        let mut proof_subject = [0u8; ADDRESS_LENGTH + HASH_LENGTH];
        proof_subject[..ADDRESS_LENGTH].copy_from_slice(resource_id.as_slice());
        proof_subject[ADDRESS_LENGTH..].copy_from_slice(receiver.expected_hash.as_slice());
        let proof = hmac_sha256(link.session_sign_key(), &proof_subject);

        let mut proof_payload = Vec::with_capacity(ADDRESS_LENGTH + proof.len());
        proof_payload.extend_from_slice(resource_id.as_slice());
        proof_payload.extend_from_slice(&proof);

        let packets = link
            .raw_packet(&proof_payload, PacketType::Proof, PacketContext::ResourceProof, now)
            .map(|packet| vec![packet])
            .unwrap_or_default();

        if self.completed.len() >= COMPLETED_PROOF_CAP {
            if let Some(oldest) = self.completed.keys().next().copied() {
                self.completed.remove(&oldest);
            }
        }
        self.completed.insert(resource_id, proof_payload.clone());

        log::debug!("resource({}): complete, {} bytes", resource_id, data.len());

        (
            packets,
            vec![ResourceEvent::Complete { resource_id, link_id: receiver.link_id, data }],
        )
    }

    fn handle_proof(
        &mut self,
        _link: &mut Link,
        payload: &[u8],
    ) -> (Vec<Packet>, Vec<ResourceEvent>) {
        if payload.len() != ADDRESS_LENGTH + 32 {
            return (Vec::new(), Vec::new());
        }

        let Ok(resource_id) = AddressHash::try_from_slice(&payload[..ADDRESS_LENGTH]) else {
            return (Vec::new(), Vec::new());
        };

        let Some(resource) = self.outbound.get(&resource_id) else {
            return (Vec::new(), Vec::new());
        };

        if resource.expected_proof[..] != payload[ADDRESS_LENGTH..] {
            log::warn!("resource({}): completion proof is not valid", resource_id);
            return (Vec::new(), Vec::new());
        }

        let link_id = resource.link_id;
        self.outbound.remove(&resource_id);

        log::debug!("resource({}): delivered", resource_id);

        (Vec::new(), vec![ResourceEvent::Delivered { resource_id, link_id }])
    }

    fn handle_cancel(&mut self, payload: &[u8]) -> (Vec<Packet>, Vec<ResourceEvent>) {
        let Ok(resource_id) = AddressHash::try_from_slice(payload) else {
            return (Vec::new(), Vec::new());
        };

        let mut events = Vec::new();
        if let Some(resource) = self.outbound.remove(&resource_id) {
            events.push(ResourceEvent::Failed {
                resource_id,
                link_id: resource.link_id,
                reason: ResourceFailure::Aborted,
            });
        }
        if let Some(receiver) = self.inbound.remove(&resource_id) {
            events.push(ResourceEvent::Failed {
                resource_id,
                link_id: receiver.link_id,
                reason: ResourceFailure::Aborted,
            });
        }

        (Vec::new(), events)
    }

    /// Deadline-driven retransmission and stall handling for resources on
    /// one link.
    pub fn tick_link(&mut self, link: &mut Link, now: f64) -> (Vec<Packet>, Vec<ResourceEvent>) {
        let link_id = *link.id();
        let mut packets = Vec::new();
        let mut events = Vec::new();
        let mut failed: Vec<AddressHash> = Vec::new();

        for resource in self.outbound.values_mut().filter(|entry| entry.link_id == link_id) {
            if !resource.accepted {
                if now >= resource.advertisement_deadline {
                    if resource.advertisement_retries >= ADVERTISEMENT_MAX_RETRIES {
                        events.push(ResourceEvent::Failed {
                            resource_id: resource.id,
                            link_id,
                            reason: ResourceFailure::Aborted,
                        });
                        failed.push(resource.id);
                        continue;
                    }
                    resource.advertisement_retries += 1;
                    resource.advertisement_deadline =
                        now + (2.5 * link.rtt()).max(MIN_PART_DEADLINE_SECS);
                    if let Ok(bytes) = resource.advertisement.pack() {
                        if let Ok(packet) = link.data_packet_with_context(
                            &bytes,
                            PacketContext::ResourceAdvertisement,
                            now,
                        ) {
                            packets.push(packet);
                        }
                    }
                }
                continue;
            }

            // Everything acked but no proof yet: re-send the last part so a
            // receiver that already finished replays its proof.
            if resource.status == ResourceStatus::AwaitingProof {
                if now >= resource.advertisement_deadline {
                    if resource.advertisement_retries >= ADVERTISEMENT_MAX_RETRIES {
                        events.push(ResourceEvent::Failed {
                            resource_id: resource.id,
                            link_id,
                            reason: ResourceFailure::RetriesExhausted,
                        });
                        failed.push(resource.id);
                        continue;
                    }
                    resource.advertisement_retries += 1;
                    resource.advertisement_deadline = resource.part_deadline(link, now);
                    let last = (resource.parts.len() - 1) as u32;
                    if let Ok(packet) = resource.part_packet(link, last, now) {
                        packets.push(packet);
                    }
                }
                continue;
            }

            let expired: Vec<u32> = resource
                .in_flight
                .iter()
                .filter(|(_, flight)| flight.deadline <= now)
                .map(|(index, _)| *index)
                .collect();

            if !expired.is_empty() {
                resource.shrink_window();
            }

            let mut exhausted = false;
            for index in expired {
                match resource.retransmit(link, index, now, false) {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => {}
                    Err(reason) => {
                        events.push(ResourceEvent::Failed {
                            resource_id: resource.id,
                            link_id,
                            reason,
                        });
                        exhausted = true;
                        break;
                    }
                }
            }

            if exhausted {
                failed.push(resource.id);
                continue;
            }

            packets.extend(resource.fill_window(link, now));
        }

        for resource_id in failed {
            self.outbound.remove(&resource_id);
            if let Ok(cancel) = link.data_packet_with_context(
                resource_id.as_slice(),
                PacketContext::ResourceCancel,
                now,
            ) {
                packets.push(cancel);
            }
        }

        let mut stalled: Vec<AddressHash> = Vec::new();
        for receiver in self.inbound.values_mut().filter(|entry| entry.link_id == link_id) {
            if now - receiver.last_activity > RECEIVER_IDLE_TIMEOUT_SECS {
                stalled.push(receiver.id);
            } else if now - receiver.last_activity > (4.0 * link.rtt()).max(2.0)
                && receiver.received < receiver.parts.len()
            {
                // Nudge the sender with a fresh window report.
                receiver.last_activity = now;
                let ack = receiver.build_ack();
                if let Ok(bytes) = ack.pack() {
                    if let Ok(packet) =
                        link.data_packet_with_context(&bytes, PacketContext::ResourceAck, now)
                    {
                        packets.push(packet);
                    }
                }
            }
        }

        for resource_id in stalled {
            self.inbound.remove(&resource_id);
            events.push(ResourceEvent::Failed {
                resource_id,
                link_id,
                reason: ResourceFailure::Aborted,
            });
        }

        (packets, events)
    }

    /// Fails every resource riding a link that closed.
    pub fn fail_for_link(&mut self, link_id: &LinkId) -> Vec<ResourceEvent> {
        let mut events = Vec::new();

        let outbound: Vec<AddressHash> = self
            .outbound
            .values()
            .filter(|entry| entry.link_id == *link_id)
            .map(|entry| entry.id)
            .collect();
        for resource_id in outbound {
            self.outbound.remove(&resource_id);
            events.push(ResourceEvent::Failed {
                resource_id,
                link_id: *link_id,
                reason: ResourceFailure::LinkClosed,
            });
        }

        let inbound: Vec<AddressHash> = self
            .inbound
            .values()
            .filter(|entry| entry.link_id == *link_id)
            .map(|entry| entry.id)
            .collect();
        for resource_id in inbound {
            self.inbound.remove(&resource_id);
            events.push(ResourceEvent::Failed {
                resource_id,
                link_id: *link_id,
                reason: ResourceFailure::LinkClosed,
            });
        }

        events
    }

    pub fn current_window(&self, resource_id: &AddressHash) -> Option<usize> {
        self.outbound.get(resource_id).map(|resource| resource.window)
    }

    pub fn outbound_status(&self, resource_id: &AddressHash) -> Option<ResourceStatus> {
        self.outbound.get(resource_id).map(|resource| resource.status)
    }

    pub fn inbound_status(&self, resource_id: &AddressHash) -> Option<ResourceStatus> {
        self.inbound.get(resource_id).map(|receiver| receiver.status)
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = BzEncoder::new(data, Compression::default());
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).ok()?;
    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}


#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use trellis_core::destination::new_in;
    use trellis_core::hash::{AddressHash, Hash};
    use trellis_core::identity::PrivateIdentity;
    use trellis_core::packet::PacketContext;

    use super::{
        ResourceAck, ResourceAdvertisement, ResourceEvent, ResourceManager, ACK_MAX_MISSING,
        MAX_RESOURCE_SIZE, WINDOW_START,
    };
    use crate::link::{Link, LinkInbound};

    fn established_pair() -> (Link, Link) {
        let responder_dest = new_in(PrivateIdentity::new_from_rand(OsRng), "files", "drop");
        let (mut initiator, request) = Link::new_outbound(responder_dest.desc, None, 0.0);
        let (mut responder, proof) =
            Link::new_inbound(&request, &responder_dest, 0.1).expect("inbound link");

        let LinkInbound::Activated { proof: Some(own_proof) } =
            initiator.handle_packet(&proof, 0.2)
        else {
            panic!("initiator should activate");
        };
        responder.handle_packet(&own_proof, 0.3);

        (initiator, responder)
    }

    #[test]
    fn advertisement_roundtrip() {
        let advertisement = ResourceAdvertisement {
            resource_id: AddressHash::random(OsRng),
            transfer_size: 123_456,
            data_size: 120_000,
            parts: 341,
            hash: Hash::of(b"resource payload"),
            compressed: true,
        };

        let packed = advertisement.pack().expect("packs");
        let unpacked = ResourceAdvertisement::unpack(&packed).expect("unpacks");
        assert_eq!(unpacked, advertisement);
    }

    #[test]
    fn ack_roundtrip_caps_missing_list() {
        let ack = ResourceAck {
            resource_id: AddressHash::random(OsRng),
            next_needed: 12,
            missing: (13..200).collect(),
        };

        let packed = ack.pack().expect("packs");
        let unpacked = ResourceAck::unpack(&packed).expect("unpacks");
        assert_eq!(unpacked.next_needed, 12);
        assert_eq!(unpacked.missing.len(), ACK_MAX_MISSING);
    }

    #[test]
    fn start_send_rejects_degenerate_sizes() {
        let (mut initiator, _responder) = established_pair();
        let mut manager = ResourceManager::new();

        assert!(manager.start_send(&mut initiator, &[], 1.0).is_err());

        let oversized = vec![0u8; MAX_RESOURCE_SIZE + 1];
        assert!(manager.start_send(&mut initiator, &oversized, 1.0).is_err());
    }

    #[test]
    fn small_transfer_between_managers() {
        let (mut sender_link, mut receiver_link) = established_pair();
        let mut sender = ResourceManager::new();
        let mut receiver = ResourceManager::new();

        let payload = vec![0x5Au8; 4096];
        let (resource_id, advertisement) =
            sender.start_send(&mut sender_link, &payload, 1.0).expect("transfer starts");
        assert_eq!(sender.current_window(&resource_id), Some(WINDOW_START));

        // Shuttle packets between the two sides until both go quiet.
        let mut to_receiver = vec![advertisement];
        let mut to_sender = Vec::new();
        let mut received = None;
        let mut delivered = false;

        for _ in 0..64 {
            for packet in to_receiver.drain(..) {
                if let LinkInbound::Data { context, plaintext } =
                    receiver_link.handle_packet(&packet, 2.0)
                {
                    let (replies, events) =
                        receiver.handle_payload(&mut receiver_link, context, &plaintext, 2.0);
                    to_sender.extend(replies);
                    for event in events {
                        if let ResourceEvent::Complete { data, .. } = event {
                            received = Some(data);
                        }
                    }
                }
            }

            for packet in to_sender.drain(..) {
                if let LinkInbound::Data { context, plaintext } =
                    sender_link.handle_packet(&packet, 2.0)
                {
                    let (replies, events) =
                        sender.handle_payload(&mut sender_link, context, &plaintext, 2.0);
                    to_receiver.extend(replies);
                    for event in events {
                        if let ResourceEvent::Delivered { .. } = event {
                            delivered = true;
                        }
                    }
                }
            }

            let (retries, _) = sender.tick_link(&mut sender_link, 2.0);
            to_receiver.extend(retries);

            if received.is_some() && delivered {
                break;
            }
        }

        assert_eq!(received.expect("transfer completes"), payload);
        assert!(delivered, "sender should see the completion proof");
        assert!(sender.is_idle());
    }

    #[test]
    fn cancel_aborts_transfer() {
        let (mut sender_link, _receiver_link) = established_pair();
        let mut sender = ResourceManager::new();

        let payload = vec![1u8; 2048];
        let (resource_id, _advertisement) =
            sender.start_send(&mut sender_link, &payload, 1.0).expect("transfer starts");

        let (_, events) = sender.handle_payload(
            &mut sender_link,
            PacketContext::ResourceCancel,
            resource_id.as_slice(),
            2.0,
        );

        assert!(events.iter().any(|event| matches!(
            event,
            ResourceEvent::Failed { reason: trellis_core::error::ResourceFailure::Aborted, .. }
        )));
        assert!(sender.is_idle());
    }
}
