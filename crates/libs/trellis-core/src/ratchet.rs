use std::collections::HashMap;

use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::error::TrellisError;
use crate::hash::AddressHash;
use crate::identity::decrypt_with_static_secret;

/// Short identifier for a ratchet public key, used to address a specific
/// retained ratchet without shipping the key itself.
pub fn ratchet_id(ratchet_pub: &[u8; RATCHET_LENGTH]) -> AddressHash {
    AddressHash::of(ratchet_pub)
}

pub const RATCHET_LENGTH: usize = 32;

/// How long a remembered peer ratchet stays usable for outbound encryption.
pub const RATCHET_EXPIRY_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;
/// Default rotation cadence for a responder's own ratchets.
pub const RATCHET_ROTATION_SECS: f64 = 600.0;
/// Default number of retired ratchet secrets kept for late traffic.
pub const RATCHET_RETAINED: usize = 128;

struct RatchetSecret {
    secret: StaticSecret,
    created: f64,
}

/// A responder's rotating ratchet keys. The current public key rides in
/// announces; retired secrets are retained so sessions opened against an
/// older announce still decrypt.
pub struct RatchetState {
    enabled: bool,
    secrets: Vec<RatchetSecret>,
    rotation_secs: f64,
    retained: usize,
    enforce: bool,
}

impl RatchetState {
    pub fn new() -> Self {
        Self {
            enabled: false,
            secrets: Vec::new(),
            rotation_secs: RATCHET_ROTATION_SECS,
            retained: RATCHET_RETAINED,
            enforce: false,
        }
    }

    pub fn enable<R: CryptoRngCore>(&mut self, rng: R, now: f64) {
        self.enabled = true;
        if self.secrets.is_empty() {
            self.rotate(rng, now);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_rotation_secs(&mut self, secs: f64) -> Result<(), TrellisError> {
        if secs <= 0.0 {
            return Err(TrellisError::InvalidArgument);
        }
        self.rotation_secs = secs;
        Ok(())
    }

    pub fn set_retained(&mut self, retained: usize) -> Result<(), TrellisError> {
        if retained == 0 {
            return Err(TrellisError::InvalidArgument);
        }
        self.retained = retained;
        self.secrets.truncate(retained);
        Ok(())
    }

    pub fn set_enforce(&mut self, enforce: bool) {
        self.enforce = enforce;
    }

    pub fn enforces(&self) -> bool {
        self.enforce
    }

    pub fn rotate<R: CryptoRngCore>(&mut self, rng: R, now: f64) {
        let secret = StaticSecret::random_from_rng(rng);
        self.secrets.insert(0, RatchetSecret { secret, created: now });
        self.secrets.truncate(self.retained);
    }

    pub fn rotate_if_needed<R: CryptoRngCore>(&mut self, rng: R, now: f64) -> bool {
        if !self.enabled {
            return false;
        }

        match self.secrets.first() {
            Some(newest) if now - newest.created < self.rotation_secs => false,
            _ => {
                self.rotate(rng, now);
                true
            }
        }
    }

    pub fn current_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        if !self.enabled {
            return None;
        }
        self.secrets.first().map(|entry| *PublicKey::from(&entry.secret).as_bytes())
    }

    /// Key agreement against the retained ratchet matching `id`.
    pub fn exchange_by_id(&self, id: &AddressHash, public: &PublicKey) -> Option<SharedSecret> {
        self.secrets
            .iter()
            .find(|entry| ratchet_id(PublicKey::from(&entry.secret).as_bytes()) == *id)
            .map(|entry| entry.secret.diffie_hellman(public))
    }

    pub fn current_ratchet_id(&self) -> Option<AddressHash> {
        self.current_public().map(|public| ratchet_id(&public))
    }

    /// Tries every retained ratchet secret against the ciphertext, newest
    /// first.
    pub fn try_decrypt(&self, salt: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        for entry in &self.secrets {
            if let Ok(plain) = decrypt_with_static_secret(&entry.secret, salt, ciphertext) {
                return Some(plain);
            }
        }
        None
    }
}

impl Default for RatchetState {
    fn default() -> Self {
        Self::new()
    }
}

struct RatchetRecord {
    ratchet: [u8; RATCHET_LENGTH],
    received: f64,
}

/// Initiator-side cache of ratchet keys learned from announces, keyed by
/// destination. Entries expire; persistence belongs to the host.
pub struct RatchetStore {
    cache: HashMap<AddressHash, RatchetRecord>,
    expiry_secs: f64,
}

impl RatchetStore {
    pub fn new() -> Self {
        Self { cache: HashMap::new(), expiry_secs: RATCHET_EXPIRY_SECS }
    }

    pub fn remember(&mut self, destination: &AddressHash, ratchet: [u8; RATCHET_LENGTH], now: f64) {
        if let Some(existing) = self.cache.get(destination) {
            if existing.ratchet == ratchet {
                return;
            }
        }
        self.cache.insert(*destination, RatchetRecord { ratchet, received: now });
    }

    pub fn get(&mut self, destination: &AddressHash, now: f64) -> Option<[u8; RATCHET_LENGTH]> {
        if let Some(record) = self.cache.get(destination) {
            if now <= record.received + self.expiry_secs {
                return Some(record.ratchet);
            }
            self.cache.remove(destination);
        }
        None
    }

    pub fn clean_expired(&mut self, now: f64) {
        self.cache.retain(|_, record| now <= record.received + self.expiry_secs);
    }
}

impl Default for RatchetStore {
    fn default() -> Self {
        Self::new()
    }
}
