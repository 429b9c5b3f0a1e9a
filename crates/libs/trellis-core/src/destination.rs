use core::fmt;
use core::marker::PhantomData;

use ed25519_dalek::{Signature, SigningKey, SIGNATURE_LENGTH};
use rand_core::CryptoRngCore;

use crate::{
    crypt::fernet::Fernet,
    error::TrellisError,
    hash::{AddressHash, Hash, Hasher},
    identity::{
        decrypt_with_identity, DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH,
    },
    packet::{
        ContextFlag, DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType,
    },
    ratchet::{RatchetState, RATCHET_LENGTH},
};

pub const NAME_HASH_LENGTH: usize = 10;
pub const RAND_HASH_LENGTH: usize = 10;
pub const MIN_ANNOUNCE_DATA_LENGTH: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_LENGTH + RAND_HASH_LENGTH + SIGNATURE_LENGTH;

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

pub trait Type {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Plain;
pub struct Group;

impl Type for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Type for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

impl Type for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

/// Full hash of the dotted aspect path. Only the first ten bytes travel on
/// the wire.
#[derive(Copy, Clone)]
pub struct DestinationName {
    pub hash: Hash,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &str) -> Self {
        let hash = Hasher::new()
            .update(app_name.as_bytes())
            .update(".".as_bytes())
            .update(aspects.as_bytes())
            .finish();

        Self { hash }
    }

    pub fn new_from_hash_slice(hash_slice: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        let len = hash_slice.len().min(32);
        hash[..len].copy_from_slice(&hash_slice[..len]);

        Self { hash: Hash::from_bytes(hash) }
    }

    pub fn as_name_hash_slice(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_LENGTH]
    }
}

#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: AddressHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

pub fn create_address_hash(identity_hash: &[u8], name: &DestinationName) -> AddressHash {
    Hasher::new()
        .update(name.as_name_hash_slice())
        .update(identity_hash)
        .finish_address()
}

/// A validated inbound announce.
pub struct AnnounceInfo<'a> {
    pub destination: SingleOutputDestination,
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
    /// Announce emission time, big-endian seconds from the trailing five
    /// bytes of the random-hash field. Orders announce freshness.
    pub timestamp: u64,
}

pub struct DestinationAnnounce;

impl DestinationAnnounce {
    /// Parses and validates an announce packet: length, destination-hash
    /// binding, signature. Rejects on any failure.
    pub fn validate(packet: &Packet) -> Result<AnnounceInfo<'_>, TrellisError> {
        if packet.header.packet_type != PacketType::Announce {
            return Err(TrellisError::MalformedPacket);
        }

        let announce_data = packet.data.as_slice();

        if announce_data.len() < MIN_ANNOUNCE_DATA_LENGTH {
            return Err(TrellisError::MalformedPacket);
        }

        let mut offset = 0usize;

        let public_key = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;
        let verifying_key = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;

        let identity = Identity::new_from_slices(public_key, verifying_key)?;

        let name_hash = &announce_data[offset..offset + NAME_HASH_LENGTH];
        offset += NAME_HASH_LENGTH;
        let rand_hash = &announce_data[offset..offset + RAND_HASH_LENGTH];
        offset += RAND_HASH_LENGTH;

        let name = DestinationName::new_from_hash_slice(name_hash);
        let expected_hash = create_address_hash(identity.address_hash.as_slice(), &name);
        if expected_hash != packet.destination {
            return Err(TrellisError::HashMismatch);
        }

        let has_ratchet = packet.header.context_flag == ContextFlag::Set;
        let remaining = announce_data.len() - offset;
        let ratchet_len = if has_ratchet { RATCHET_LENGTH } else { 0 };

        if remaining < ratchet_len + SIGNATURE_LENGTH {
            return Err(TrellisError::MalformedPacket);
        }

        let ratchet = if has_ratchet {
            let mut bytes = [0u8; RATCHET_LENGTH];
            bytes.copy_from_slice(&announce_data[offset..offset + RATCHET_LENGTH]);
            offset += RATCHET_LENGTH;
            Some(bytes)
        } else {
            None
        };

        let signature = &announce_data[offset..offset + SIGNATURE_LENGTH];
        let app_data = &announce_data[offset + SIGNATURE_LENGTH..];

        // The verifying key has no prehash mode, so the signed region is
        // rebuilt on the stack.
        let mut signed_data = PacketDataBuffer::empty();
        signed_data.extend(&[
            packet.destination.as_slice(),
            public_key,
            verifying_key,
            name_hash,
            rand_hash,
        ])?;
        if let Some(ref ratchet) = ratchet {
            signed_data.push(ratchet)?;
        }
        if !app_data.is_empty() {
            signed_data.push(app_data)?;
        }

        let signature =
            Signature::from_slice(signature).map_err(|_| TrellisError::CryptoError)?;
        identity.verify(signed_data.as_slice(), &signature)?;

        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes[3..].copy_from_slice(&rand_hash[RAND_HASH_LENGTH / 2..]);
        let timestamp = u64::from_be_bytes(timestamp_bytes);

        Ok(AnnounceInfo {
            destination: SingleOutputDestination::new(identity, name),
            app_data,
            ratchet,
            timestamp,
        })
    }
}

pub struct Destination<I, D: Direction, T: Type> {
    pub direction: PhantomData<D>,
    pub r#type: PhantomData<T>,
    pub identity: I,
    pub desc: DestinationDesc,
    ratchet_state: RatchetState,
}

impl<I, D: Direction, T: Type> Destination<I, D, T> {
    pub fn destination_type(&self) -> DestinationType {
        <T as Type>::destination_type()
    }
}

impl Destination<PrivateIdentity, Input, Single> {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(identity.address_hash().as_slice(), &name);
        let pub_identity = *identity.as_identity();

        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity: pub_identity, name, address_hash },
            ratchet_state: RatchetState::default(),
        }
    }

    pub fn enable_ratchets<R: CryptoRngCore>(&mut self, rng: R, now: f64) {
        self.ratchet_state.enable(rng, now);
    }

    pub fn set_ratchet_rotation_secs(&mut self, secs: f64) -> Result<(), TrellisError> {
        self.ratchet_state.set_rotation_secs(secs)
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) -> Result<(), TrellisError> {
        self.ratchet_state.set_retained(retained)
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.ratchet_state.set_enforce(enforce);
    }

    pub fn rotate_ratchet<R: CryptoRngCore>(&mut self, rng: R, now: f64) {
        self.ratchet_state.rotate(rng, now);
    }

    pub fn current_ratchet_id(&self) -> Option<AddressHash> {
        self.ratchet_state.current_ratchet_id()
    }

    /// Key agreement against a specific retained ratchet, addressed by id.
    pub fn ratchet_exchange(
        &self,
        id: &AddressHash,
        public: &x25519_dalek::PublicKey,
    ) -> Option<x25519_dalek::SharedSecret> {
        self.ratchet_state.exchange_by_id(id, public)
    }

    /// Decrypts an inbound SINGLE payload, trying retained ratchets before
    /// the long-term key. Returns the plaintext and whether a ratchet key
    /// was used.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), TrellisError> {
        let salt = self.desc.address_hash;
        if let Some(plaintext) = self.ratchet_state.try_decrypt(salt.as_slice(), ciphertext) {
            return Ok((plaintext, true));
        }
        if self.ratchet_state.is_enabled() && self.ratchet_state.enforces() {
            return Err(TrellisError::CryptoError);
        }

        let plaintext = decrypt_with_identity(&self.identity, salt.as_slice(), ciphertext)?;
        Ok((plaintext, false))
    }

    /// Builds a signed announce for this destination, carrying the current
    /// ratchet key when ratchets are enabled.
    pub fn announce<R: CryptoRngCore + Copy>(
        &mut self,
        mut rng: R,
        now: f64,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, TrellisError> {
        // Five random bytes followed by a five byte big-endian timestamp;
        // the timestamp half orders announce freshness between routers.
        let mut rand_hash = [0u8; RAND_HASH_LENGTH];
        rng.fill_bytes(&mut rand_hash[..RAND_HASH_LENGTH / 2]);
        let emitted_be = (now.max(0.0).floor() as u64).to_be_bytes();
        rand_hash[RAND_HASH_LENGTH / 2..].copy_from_slice(&emitted_be[3..8]);

        let pub_key = self.identity.as_identity().public_key_bytes();
        let verifying_key = self.identity.as_identity().verifying_key_bytes();

        let ratchet = if self.ratchet_state.is_enabled() {
            self.ratchet_state.rotate_if_needed(rng, now);
            self.ratchet_state.current_public()
        } else {
            None
        };

        let mut signed_data = PacketDataBuffer::empty();
        signed_data.extend(&[
            self.desc.address_hash.as_slice(),
            pub_key,
            verifying_key,
            self.desc.name.as_name_hash_slice(),
            &rand_hash,
        ])?;
        if let Some(ref ratchet) = ratchet {
            signed_data.push(ratchet)?;
        }
        if let Some(data) = app_data {
            signed_data.push(data)?;
        }

        let signature = self.identity.sign(signed_data.as_slice());

        let mut packet_data = PacketDataBuffer::empty();
        packet_data.extend(&[
            pub_key,
            verifying_key,
            self.desc.name.as_name_hash_slice(),
            &rand_hash,
        ])?;
        if let Some(ref ratchet) = ratchet {
            packet_data.push(ratchet)?;
        }
        packet_data.push(&signature.to_bytes())?;
        if let Some(data) = app_data {
            packet_data.push(data)?;
        }

        Ok(Packet {
            header: Header {
                context_flag: if ratchet.is_some() { ContextFlag::Set } else { ContextFlag::Unset },
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                ..Default::default()
            },
            ifac: None,
            destination: self.desc.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        })
    }

    pub fn path_response<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        now: f64,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, TrellisError> {
        let mut announce = self.announce(rng, now, app_data)?;
        announce.context = PacketContext::PathResponse;

        Ok(announce)
    }

    pub fn sign_key(&self) -> &SigningKey {
        self.identity.sign_key()
    }
}

impl Destination<Identity, Output, Single> {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(identity.address_hash.as_slice(), &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity, name, address_hash },
            ratchet_state: RatchetState::default(),
        }
    }
}

impl<D: Direction> Destination<(), D, Plain> {
    pub fn new(name: DestinationName) -> Self {
        let address_hash = create_address_hash(&[], &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity: (),
            desc: DestinationDesc { identity: Identity::default(), name, address_hash },
            ratchet_state: RatchetState::default(),
        }
    }
}

pub const GROUP_KEY_LENGTH: usize = 32;

/// Symmetric destination shared by every holder of the group key. The
/// address is derived from the key material so members agree on it without
/// an identity.
pub struct GroupDestination {
    pub desc: DestinationDesc,
    key: DerivedKey,
}

impl GroupDestination {
    pub fn new(group_key: &[u8; GROUP_KEY_LENGTH], name: DestinationName) -> Self {
        let key = DerivedKey::new_from_bytes(group_key, Some(name.as_name_hash_slice()));
        let key_hash = AddressHash::of(group_key);
        let address_hash = create_address_hash(key_hash.as_slice(), &name);

        Self {
            desc: DestinationDesc { identity: Identity::default(), name, address_hash },
            key,
        }
    }

    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        data: &[u8],
    ) -> Result<Vec<u8>, TrellisError> {
        Fernet::from_halves(self.key.sign_half(), self.key.enc_half()).encrypt_vec(rng, data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TrellisError> {
        Fernet::from_halves(self.key.sign_half(), self.key.enc_half()).decrypt_vec(data)
    }
}

pub type SingleInputDestination = Destination<PrivateIdentity, Input, Single>;
pub type SingleOutputDestination = Destination<Identity, Output, Single>;
pub type PlainInputDestination = Destination<(), Input, Plain>;
pub type PlainOutputDestination = Destination<(), Output, Plain>;

pub fn new_in(identity: PrivateIdentity, app_name: &str, aspect: &str) -> SingleInputDestination {
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspect))
}

pub fn new_out(identity: Identity, app_name: &str, aspect: &str) -> SingleOutputDestination {
    SingleOutputDestination::new(identity, DestinationName::new(app_name, aspect))
}
