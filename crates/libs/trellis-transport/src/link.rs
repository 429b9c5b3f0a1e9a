use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use trellis_core::{
    crypt::fernet::{Fernet, TOKEN_BLOCK, TOKEN_OVERHEAD},
    destination::{DestinationDesc, SingleInputDestination},
    error::TrellisError,
    hash::{AddressHash, ADDRESS_LENGTH},
    identity::{DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH},
    packet::{
        DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType,
        ENCRYPTED_MDU,
    },
    ratchet::{ratchet_id, RATCHET_LENGTH},
};

pub type LinkId = AddressHash;

pub const KEEPALIVE_SECS: f64 = 360.0;
pub const STALE_AFTER_SECS: f64 = 2.0 * KEEPALIVE_SECS;
pub const CLOSE_AFTER_SECS: f64 = 4.0 * KEEPALIVE_SECS;
pub const HANDSHAKE_TIMEOUT_SECS: f64 = 15.0;

pub const KEEP_ALIVE_REQUEST: u8 = 0xFF;
pub const KEEP_ALIVE_RESPONSE: u8 = 0xFE;

const SEQ_LEN: usize = 4;
const HMAC_LEN: usize = 32;

/// Largest in-link plaintext that still tokenizes under the encrypted MDU.
const LINK_PLAINTEXT_MDU: usize =
    ((ENCRYPTED_MDU - TOKEN_OVERHEAD) / TOKEN_BLOCK) * TOKEN_BLOCK - 1;
/// Application payload budget once the sequence prefix is accounted for.
pub const LINK_MDU: usize = LINK_PLAINTEXT_MDU - SEQ_LEN;

const REQUEST_PLAIN_LEN: usize = PUBLIC_KEY_LENGTH;
const REQUEST_RATCHET_LEN: usize = PUBLIC_KEY_LENGTH + ADDRESS_LENGTH;
const PROOF_LEN: usize = PUBLIC_KEY_LENGTH + HMAC_LEN;
const IDENTIFY_LEN: usize = PUBLIC_KEY_LENGTH * 2 + 64;

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending,
    Handshake,
    Active,
    Stale,
    Closed,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        *self == LinkStatus::Pending || *self == LinkStatus::Handshake
    }
}

/// Outcome of feeding one in-link packet to the state machine.
pub enum LinkInbound {
    None,
    /// The link reached Active. Initiators carry their own proof to send.
    Activated { proof: Option<Packet> },
    /// Decrypted (or raw, for resource parts and proofs) in-link payload.
    Data { context: PacketContext, plaintext: Vec<u8> },
    KeepAliveReply(Packet),
    Identified { identity_hash: AddressHash },
    Closed,
}

/// Timer-driven work for one link, produced by the maintenance tick.
pub enum LinkUpkeep {
    None,
    SendKeepAlive(Packet),
    WentStale,
    Close { teardown: Option<Packet>, reason: TrellisError },
}

pub struct Link {
    id: LinkId,
    role: LinkRole,
    status: LinkStatus,
    destination: DestinationDesc,
    ephemeral: Option<StaticSecret>,
    target_key: PublicKey,
    used_ratchet: Option<[u8; RATCHET_LENGTH]>,
    derived: DerivedKey,
    peer_identity: Option<Identity>,
    request_time: f64,
    last_inbound: f64,
    last_outbound: f64,
    rtt: f64,
    tx_seq: u32,
    rx_seq: Option<u32>,
}

impl Link {
    /// Opens a link toward a remote destination. Uses the destination's
    /// current ratchet key when one is supplied, falling back to the
    /// long-term key. Returns the link and the LINKREQUEST to send.
    pub fn new_outbound(
        destination: DestinationDesc,
        ratchet: Option<[u8; RATCHET_LENGTH]>,
        now: f64,
    ) -> (Self, Packet) {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);

        let target_key = match ratchet {
            Some(ratchet_pub) => PublicKey::from(ratchet_pub),
            None => destination.identity.public_key,
        };

        let mut request = [0u8; REQUEST_RATCHET_LEN];
        request[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_pub.as_bytes());
        let request_len = match ratchet {
            Some(ref ratchet_pub) => {
                request[PUBLIC_KEY_LENGTH..]
                    .copy_from_slice(ratchet_id(ratchet_pub).as_slice());
                REQUEST_RATCHET_LEN
            }
            None => REQUEST_PLAIN_LEN,
        };
        let packet_data = PacketDataBuffer::from_slice(&request[..request_len]);

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            ifac: None,
            destination: destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        let id = packet.hash();
        log::debug!("link({}): request {}", id, destination.address_hash);

        let link = Self {
            id,
            role: LinkRole::Initiator,
            status: LinkStatus::Pending,
            destination,
            ephemeral: Some(ephemeral),
            target_key,
            used_ratchet: ratchet,
            derived: DerivedKey::new_empty(),
            peer_identity: None,
            request_time: now,
            last_inbound: now,
            last_outbound: now,
            rtt: 0.0,
            tx_seq: 0,
            rx_seq: None,
        };

        (link, packet)
    }

    /// Accepts an inbound LINKREQUEST at the destination it addresses.
    /// Derives the session keys and returns the link in Handshake state
    /// together with the proof packet to send back.
    pub fn new_inbound(
        packet: &Packet,
        destination: &SingleInputDestination,
        now: f64,
    ) -> Result<(Self, Packet), TrellisError> {
        let data = packet.data.as_slice();

        if data.len() != REQUEST_PLAIN_LEN && data.len() != REQUEST_RATCHET_LEN {
            return Err(TrellisError::MalformedPacket);
        }

        let mut initiator_pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
        initiator_pub_bytes.copy_from_slice(&data[..PUBLIC_KEY_LENGTH]);
        let initiator_pub = PublicKey::from(initiator_pub_bytes);

        let static_shared = if data.len() == REQUEST_RATCHET_LEN {
            let requested = AddressHash::try_from_slice(&data[PUBLIC_KEY_LENGTH..])?;
            destination
                .ratchet_exchange(&requested, &initiator_pub)
                .ok_or(TrellisError::CryptoError)?
        } else {
            destination.identity.exchange(&initiator_pub)
        };

        let id: LinkId = packet.hash();
        log::debug!("link({}): create from request", id);

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let ephemeral_shared = ephemeral.diffie_hellman(&initiator_pub);

        let derived = derive_session_keys(
            ephemeral_shared.as_bytes(),
            static_shared.as_bytes(),
            &id,
        );

        let mut link = Self {
            id,
            role: LinkRole::Responder,
            status: LinkStatus::Handshake,
            destination: destination.desc,
            ephemeral: None,
            target_key: initiator_pub,
            used_ratchet: None,
            derived,
            peer_identity: None,
            request_time: now,
            last_inbound: now,
            last_outbound: now,
            rtt: 0.0,
            tx_seq: 0,
            rx_seq: None,
        };

        let proof = link.proof_packet(ephemeral_pub, PacketContext::LinkRequestProof);
        link.last_outbound = now;

        Ok((link, proof))
    }

    fn proof_packet(&self, ephemeral_pub: PublicKey, context: PacketContext) -> Packet {
        let mut signed = [0u8; ADDRESS_LENGTH + PUBLIC_KEY_LENGTH];
        signed[..ADDRESS_LENGTH].copy_from_slice(self.id.as_slice());
        signed[ADDRESS_LENGTH..].copy_from_slice(ephemeral_pub.as_bytes());

        let tag = hmac_sha256(self.derived.sign_half(), &signed);

        let mut proof = [0u8; PROOF_LEN];
        proof[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_pub.as_bytes());
        proof[PUBLIC_KEY_LENGTH..].copy_from_slice(&tag);
        let packet_data = PacketDataBuffer::from_slice(&proof);

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        }
    }

    /// Verifies the responder's proof on the initiator side, derives the
    /// session keys and activates the link.
    fn handle_request_proof(&mut self, packet: &Packet, now: f64) -> LinkInbound {
        if self.role != LinkRole::Initiator || self.status != LinkStatus::Pending {
            return LinkInbound::None;
        }

        let data = packet.data.as_slice();
        if data.len() != PROOF_LEN {
            return LinkInbound::None;
        }

        let mut responder_pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
        responder_pub_bytes.copy_from_slice(&data[..PUBLIC_KEY_LENGTH]);
        let responder_pub = PublicKey::from(responder_pub_bytes);

        let Some(ephemeral) = self.ephemeral.take() else {
            return LinkInbound::None;
        };

        let ephemeral_shared = ephemeral.diffie_hellman(&responder_pub);
        let static_shared = ephemeral.diffie_hellman(&self.target_key);
        let derived = derive_session_keys(
            ephemeral_shared.as_bytes(),
            static_shared.as_bytes(),
            &self.id,
        );

        let mut signed = [0u8; ADDRESS_LENGTH + PUBLIC_KEY_LENGTH];
        signed[..ADDRESS_LENGTH].copy_from_slice(self.id.as_slice());
        signed[ADDRESS_LENGTH..].copy_from_slice(responder_pub.as_bytes());
        let expected = hmac_sha256(derived.sign_half(), &signed);

        if expected[..] != data[PUBLIC_KEY_LENGTH..] {
            log::warn!("link({}): proof is not valid", self.id);
            self.ephemeral = Some(ephemeral);
            return LinkInbound::None;
        }

        self.derived = derived;
        self.status = LinkStatus::Active;
        self.rtt = now - self.request_time;
        self.last_inbound = now;

        log::debug!("link({}): activated, rtt {:.3}s", self.id, self.rtt);

        let own_proof = self.proof_packet(PublicKey::from(&ephemeral), PacketContext::LinkProof);
        self.last_outbound = now;

        LinkInbound::Activated { proof: Some(own_proof) }
    }

    /// Verifies the initiator's closing proof on the responder side.
    fn handle_link_proof(&mut self, packet: &Packet, now: f64) -> LinkInbound {
        if self.role != LinkRole::Responder || self.status != LinkStatus::Handshake {
            return LinkInbound::None;
        }

        let data = packet.data.as_slice();
        if data.len() != PROOF_LEN {
            return LinkInbound::None;
        }

        let mut signed = [0u8; ADDRESS_LENGTH + PUBLIC_KEY_LENGTH];
        signed[..ADDRESS_LENGTH].copy_from_slice(self.id.as_slice());
        signed[ADDRESS_LENGTH..].copy_from_slice(&data[..PUBLIC_KEY_LENGTH]);
        let expected = hmac_sha256(self.derived.sign_half(), &signed);

        if expected[..] != data[PUBLIC_KEY_LENGTH..] {
            log::warn!("link({}): initiator proof is not valid", self.id);
            return LinkInbound::None;
        }

        self.status = LinkStatus::Active;
        self.rtt = now - self.request_time;
        self.last_inbound = now;

        log::debug!("link({}): activated", self.id);

        LinkInbound::Activated { proof: None }
    }

    pub fn handle_packet(&mut self, packet: &Packet, now: f64) -> LinkInbound {
        if packet.destination != self.id || self.status == LinkStatus::Closed {
            return LinkInbound::None;
        }

        match packet.header.packet_type {
            PacketType::Proof => match packet.context {
                PacketContext::LinkRequestProof => self.handle_request_proof(packet, now),
                PacketContext::LinkProof => self.handle_link_proof(packet, now),
                PacketContext::ResourceProof => {
                    self.mark_inbound(now);
                    LinkInbound::Data {
                        context: packet.context,
                        plaintext: packet.data.as_slice().to_vec(),
                    }
                }
                _ => LinkInbound::None,
            },
            PacketType::Data => self.handle_data_packet(packet, now),
            _ => LinkInbound::None,
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet, now: f64) -> LinkInbound {
        match packet.context {
            PacketContext::KeepAlive => {
                let data = packet.data.as_slice();
                if data.first() == Some(&KEEP_ALIVE_REQUEST) {
                    self.mark_inbound(now);
                    log::trace!("link({}): keep-alive request", self.id);
                    let reply = self.keep_alive_packet(KEEP_ALIVE_RESPONSE);
                    self.last_outbound = now;
                    return LinkInbound::KeepAliveReply(reply);
                }
                if data.first() == Some(&KEEP_ALIVE_RESPONSE) {
                    self.mark_inbound(now);
                    log::trace!("link({}): keep-alive response", self.id);
                }
                LinkInbound::None
            }
            // Resource parts travel as raw ciphertext chunks; the whole
            // payload was tokenized once at the sender.
            PacketContext::Resource => {
                self.mark_inbound(now);
                LinkInbound::Data {
                    context: packet.context,
                    plaintext: packet.data.as_slice().to_vec(),
                }
            }
            PacketContext::None
            | PacketContext::ResourceAdvertisement
            | PacketContext::ResourceAck
            | PacketContext::ResourceCancel
            | PacketContext::LinkIdentify
            | PacketContext::LinkClose => {
                let Ok(plaintext) = self.decrypt_sequenced(packet.data.as_slice()) else {
                    log::debug!("link({}): can't decrypt packet", self.id);
                    return LinkInbound::None;
                };

                self.mark_inbound(now);

                match packet.context {
                    PacketContext::LinkIdentify => self.handle_identify(&plaintext),
                    PacketContext::LinkClose => {
                        log::debug!("link({}): peer teardown", self.id);
                        self.status = LinkStatus::Closed;
                        LinkInbound::Closed
                    }
                    _ => LinkInbound::Data { context: packet.context, plaintext },
                }
            }
            _ => LinkInbound::None,
        }
    }

    fn handle_identify(&mut self, plaintext: &[u8]) -> LinkInbound {
        if plaintext.len() != IDENTIFY_LEN {
            return LinkInbound::None;
        }

        let Ok(identity) = Identity::new_from_slices(
            &plaintext[..PUBLIC_KEY_LENGTH],
            &plaintext[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH * 2],
        ) else {
            return LinkInbound::None;
        };

        let mut signed = [0u8; ADDRESS_LENGTH + PUBLIC_KEY_LENGTH];
        signed[..ADDRESS_LENGTH].copy_from_slice(self.id.as_slice());
        signed[ADDRESS_LENGTH..].copy_from_slice(self.destination.identity.public_key_bytes());

        let Ok(signature) =
            ed25519_dalek::Signature::from_slice(&plaintext[PUBLIC_KEY_LENGTH * 2..])
        else {
            return LinkInbound::None;
        };

        if identity.verify(&signed, &signature).is_err() {
            log::warn!("link({}): identify signature is not valid", self.id);
            return LinkInbound::None;
        }

        let identity_hash = identity.address_hash;
        self.peer_identity = Some(identity);
        log::debug!("link({}): peer identified as {}", self.id, identity_hash);

        LinkInbound::Identified { identity_hash }
    }

    /// Initiator-side identity proof: binds a long-term identity to the
    /// link without exposing it during setup.
    pub fn identify(&mut self, identity: &PrivateIdentity, now: f64) -> Result<Packet, TrellisError> {
        if self.role != LinkRole::Initiator || self.status != LinkStatus::Active {
            return Err(TrellisError::InvalidArgument);
        }

        let mut signed = [0u8; ADDRESS_LENGTH + PUBLIC_KEY_LENGTH];
        signed[..ADDRESS_LENGTH].copy_from_slice(self.id.as_slice());
        signed[ADDRESS_LENGTH..].copy_from_slice(self.destination.identity.public_key_bytes());
        let signature = identity.sign(&signed);

        let mut plaintext = Vec::with_capacity(IDENTIFY_LEN);
        plaintext.extend_from_slice(identity.as_identity().public_key_bytes());
        plaintext.extend_from_slice(identity.as_identity().verifying_key_bytes());
        plaintext.extend_from_slice(&signature.to_bytes());

        self.data_packet_with_context(&plaintext, PacketContext::LinkIdentify, now)
    }

    pub fn data_packet(&mut self, data: &[u8], now: f64) -> Result<Packet, TrellisError> {
        self.data_packet_with_context(data, PacketContext::None, now)
    }

    pub fn data_packet_with_context(
        &mut self,
        data: &[u8],
        context: PacketContext,
        now: f64,
    ) -> Result<Packet, TrellisError> {
        if self.status != LinkStatus::Active && self.status != LinkStatus::Stale {
            return Err(TrellisError::LinkClosed);
        }

        if data.len() > LINK_MDU {
            return Err(TrellisError::InvalidArgument);
        }

        let mut sequenced = Vec::with_capacity(SEQ_LEN + data.len());
        sequenced.extend_from_slice(&self.tx_seq.to_be_bytes());
        sequenced.extend_from_slice(data);
        self.tx_seq = self.tx_seq.wrapping_add(1);

        let fernet = self.fernet();
        let mut packet_data = PacketDataBuffer::empty();
        packet_data.fill_with(|out| fernet.encrypt(OsRng, &sequenced, out))?;

        self.last_outbound = now;

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        })
    }

    /// Raw in-link packet without encryption or sequencing, for payloads
    /// that carry their own integrity (resource parts and proofs).
    pub fn raw_packet(
        &mut self,
        data: &[u8],
        packet_type: PacketType,
        context: PacketContext,
        now: f64,
    ) -> Result<Packet, TrellisError> {
        let mut packet_data = PacketDataBuffer::empty();
        packet_data.push(data)?;

        self.last_outbound = now;

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        })
    }

    pub fn keep_alive_packet(&self, data: u8) -> Packet {
        let packet_data = PacketDataBuffer::from_slice(&[data]);

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::KeepAlive,
            data: packet_data,
        }
    }

    fn fernet(&self) -> Fernet {
        Fernet::from_halves(self.derived.sign_half(), self.derived.enc_half())
    }

    /// Whole-payload encryption for the resource layer.
    pub fn encrypt_payload(&self, data: &[u8]) -> Result<Vec<u8>, TrellisError> {
        self.fernet().encrypt_vec(OsRng, data)
    }

    pub fn decrypt_payload(&self, data: &[u8]) -> Result<Vec<u8>, TrellisError> {
        self.fernet().decrypt_vec(data)
    }

    fn decrypt_sequenced(&mut self, data: &[u8]) -> Result<Vec<u8>, TrellisError> {
        let plain = self.decrypt_payload(data)?;
        if plain.len() < SEQ_LEN {
            return Err(TrellisError::MalformedPacket);
        }

        let mut seq_bytes = [0u8; SEQ_LEN];
        seq_bytes.copy_from_slice(&plain[..SEQ_LEN]);
        let seq = u32::from_be_bytes(seq_bytes);

        if let Some(last) = self.rx_seq {
            if seq <= last {
                log::debug!("link({}): replayed sequence {}", self.id, seq);
                return Err(TrellisError::Replay);
            }
        }
        self.rx_seq = Some(seq);

        Ok(plain[SEQ_LEN..].to_vec())
    }

    fn mark_inbound(&mut self, now: f64) {
        self.last_inbound = now;
        if self.status == LinkStatus::Stale {
            log::debug!("link({}): recovered from stale", self.id);
            self.status = LinkStatus::Active;
        }
    }

    /// Drives timers: handshake timeout, keepalive emission, staleness and
    /// teardown.
    pub fn upkeep(&mut self, now: f64) -> LinkUpkeep {
        match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                if now - self.request_time > HANDSHAKE_TIMEOUT_SECS {
                    log::debug!("link({}): handshake timeout", self.id);
                    self.status = LinkStatus::Closed;
                    return LinkUpkeep::Close { teardown: None, reason: TrellisError::HandshakeTimeout };
                }
                LinkUpkeep::None
            }
            LinkStatus::Active | LinkStatus::Stale => {
                if now - self.last_inbound > CLOSE_AFTER_SECS {
                    log::debug!("link({}): closing after silence", self.id);
                    let teardown = self.teardown_packet(now);
                    self.status = LinkStatus::Closed;
                    return LinkUpkeep::Close { teardown, reason: TrellisError::LinkClosed };
                }

                if self.status == LinkStatus::Active && now - self.last_inbound > STALE_AFTER_SECS {
                    log::debug!("link({}): stale", self.id);
                    self.status = LinkStatus::Stale;
                    return LinkUpkeep::WentStale;
                }

                if now - self.last_outbound >= KEEPALIVE_SECS {
                    let packet = self.keep_alive_packet(KEEP_ALIVE_REQUEST);
                    self.last_outbound = now;
                    return LinkUpkeep::SendKeepAlive(packet);
                }

                LinkUpkeep::None
            }
            LinkStatus::Closed => LinkUpkeep::None,
        }
    }

    fn teardown_packet(&mut self, now: f64) -> Option<Packet> {
        let id_bytes = self.id.as_slice().to_vec();
        self.data_packet_with_context(&id_bytes, PacketContext::LinkClose, now).ok()
    }

    /// Unilateral close. Returns a best-effort teardown packet when the
    /// session keys exist.
    pub fn close(&mut self, now: f64) -> Option<Packet> {
        let teardown = if self.status == LinkStatus::Active || self.status == LinkStatus::Stale {
            self.teardown_packet(now)
        } else {
            None
        };
        self.status = LinkStatus::Closed;
        log::debug!("link({}): closed", self.id);
        teardown
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    /// Signing half of the session key, for HMAC proofs layered over the
    /// link.
    pub fn session_sign_key(&self) -> &[u8] {
        self.derived.sign_half()
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> Option<&Identity> {
        self.peer_identity.as_ref()
    }

    pub fn rtt(&self) -> f64 {
        self.rtt
    }

    pub fn used_ratchet(&self) -> Option<&[u8; RATCHET_LENGTH]> {
        self.used_ratchet.as_ref()
    }
}

fn derive_session_keys(
    ephemeral_shared: &[u8; 32],
    static_shared: &[u8; 32],
    link_id: &LinkId,
) -> DerivedKey {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ephemeral_shared);
    ikm[32..].copy_from_slice(static_shared);
    DerivedKey::new_from_bytes(&ikm, Some(link_id.as_slice()))
}
