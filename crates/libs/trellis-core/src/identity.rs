use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::{
    crypt::fernet::Fernet,
    error::TrellisError,
    hash::{AddressHash, Hash, Hasher},
};

pub const PUBLIC_KEY_LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;
pub const DERIVED_KEY_LENGTH: usize = 512 / 8;

/// Public half of a node identity: an X25519 key for key agreement and an
/// Ed25519 key for signatures. The identity hash is the truncated SHA-256
/// of the two public keys concatenated.
#[derive(Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let address_hash = Hasher::new()
            .update(public_key.as_bytes())
            .update(verifying_key.as_bytes())
            .finish_address();

        Self { public_key, verifying_key, address_hash }
    }

    pub fn new_from_slices(public_key: &[u8], verifying_key: &[u8]) -> Result<Self, TrellisError> {
        if public_key.len() != PUBLIC_KEY_LENGTH || verifying_key.len() != PUBLIC_KEY_LENGTH {
            return Err(TrellisError::InvalidArgument);
        }

        let public_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(public_key);
            PublicKey::from(key_data)
        };

        let verifying_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(verifying_key);
            VerifyingKey::from_bytes(&key_data).map_err(|_| TrellisError::CryptoError)?
        };

        Ok(Self::new(public_key, verifying_key))
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), TrellisError> {
        self.verifying_key
            .verify_strict(data, signature)
            .map_err(|_| TrellisError::SignatureInvalid)
    }

    pub fn to_hex(&self) -> String {
        format!(
            "{}{}",
            hex::encode(self.public_key.as_bytes()),
            hex::encode(self.verifying_key.as_bytes())
        )
    }
}

impl Default for Identity {
    fn default() -> Self {
        let empty_key = [0u8; PUBLIC_KEY_LENGTH];
        Self::new(PublicKey::from(empty_key), VerifyingKey::default())
    }
}

/// Full identity with private material. Private keys never leave this
/// struct; signing and key agreement borrow them in place.
#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    private_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(private_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&private_key).into(), sign_key.verifying_key()),
            private_key,
            sign_key,
        }
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let private_key = StaticSecret::random_from_rng(rng);

        Self::new(private_key, sign_key)
    }

    /// Deterministic identity from a name. Test fixtures only; the key
    /// space of names is trivially searchable.
    pub fn new_from_name(name: &str) -> Self {
        let hash = Hash::of(name.as_bytes());
        let private_key = StaticSecret::from(hash.to_bytes());

        let hash = Hash::of(hash.as_slice());
        let sign_key = SigningKey::from_bytes(hash.as_bytes());

        Self::new(private_key, sign_key)
    }

    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, TrellisError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(TrellisError::InvalidArgument);
        }

        let mut private_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        let mut sign_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        private_key_bytes.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        sign_key_bytes.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(
            StaticSecret::from(private_key_bytes),
            SigningKey::from_bytes(&sign_key_bytes),
        ))
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.private_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), TrellisError> {
        self.identity.verify(data, signature)
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.try_sign(data).expect("signature")
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::new(&self.private_key.diffie_hellman(public_key), salt)
    }

    pub(crate) fn static_secret(&self) -> &StaticSecret {
        &self.private_key
    }
}

/// 64 bytes of HKDF-SHA256 output from an X25519 shared secret. The first
/// half keys the token HMAC, the second half the AES cipher.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_LENGTH],
}

impl DerivedKey {
    pub fn new(shared_key: &SharedSecret, salt: Option<&[u8]>) -> Self {
        Self::new_from_bytes(shared_key.as_bytes(), salt)
    }

    pub fn new_from_bytes(shared_key: &[u8], salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(salt, shared_key).expand(&[], &mut key[..]);
        Self { key }
    }

    pub fn new_empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_LENGTH] }
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LENGTH] {
        &self.key
    }

    pub fn sign_half(&self) -> &[u8] {
        &self.key[..DERIVED_KEY_LENGTH / 2]
    }

    pub fn enc_half(&self) -> &[u8] {
        &self.key[DERIVED_KEY_LENGTH / 2..]
    }
}

/// Encrypts for a bare X25519 public key: ephemeral public key followed by
/// an encrypted token under the HKDF-derived key, salted with the
/// recipient's destination hash.
pub fn encrypt_for_public_key<R: CryptoRngCore + Copy>(
    public_key: &PublicKey,
    salt: &[u8],
    plaintext: &[u8],
    rng: R,
) -> Result<Vec<u8>, TrellisError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(public_key);
    let derived = DerivedKey::new(&shared, Some(salt));

    let fernet = Fernet::from_halves(derived.sign_half(), derived.enc_half());
    let mut out = vec![0u8; PUBLIC_KEY_LENGTH + Fernet::token_len(plaintext.len())];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let written = fernet.encrypt(rng, plaintext, &mut out[PUBLIC_KEY_LENGTH..])?;
    out.truncate(PUBLIC_KEY_LENGTH + written);
    Ok(out)
}

pub fn decrypt_with_static_secret(
    private_key: &StaticSecret,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, TrellisError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(TrellisError::InvalidArgument);
    }
    let mut pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
    pub_bytes.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let ephemeral_public = PublicKey::from(pub_bytes);
    let shared = private_key.diffie_hellman(&ephemeral_public);
    let derived = DerivedKey::new(&shared, Some(salt));

    Fernet::from_halves(derived.sign_half(), derived.enc_half())
        .decrypt_vec(&ciphertext[PUBLIC_KEY_LENGTH..])
}

pub fn decrypt_with_identity(
    identity: &PrivateIdentity,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, TrellisError> {
    decrypt_with_static_secret(identity.static_secret(), salt, ciphertext)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{
        decrypt_with_identity, encrypt_for_public_key, PrivateIdentity, PRIVATE_KEY_LENGTH,
    };
    use crate::hash::ADDRESS_LENGTH;

    #[test]
    fn private_key_bytes_roundtrip() {
        let original = PrivateIdentity::new_from_rand(OsRng);
        let bytes = original.to_private_key_bytes();
        assert_eq!(bytes.len(), PRIVATE_KEY_LENGTH);

        let actual = PrivateIdentity::from_private_key_bytes(&bytes).expect("valid identity");
        assert_eq!(actual.address_hash(), original.address_hash());
    }

    #[test]
    fn identity_hash_is_deterministic() {
        let identity = PrivateIdentity::new_from_name("determinism");
        let again = PrivateIdentity::new_from_name("determinism");
        assert_eq!(identity.address_hash(), again.address_hash());
        assert_eq!(identity.address_hash().as_slice().len(), ADDRESS_LENGTH);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let recipient = PrivateIdentity::new_from_rand(OsRng);
        let salt = recipient.address_hash().as_slice().to_vec();

        let message = b"over the mesh and far away";
        let ciphertext = encrypt_for_public_key(
            &recipient.as_identity().public_key,
            &salt,
            message,
            OsRng,
        )
        .expect("ciphertext");

        let plain = decrypt_with_identity(&recipient, &salt, &ciphertext).expect("plaintext");
        assert_eq!(plain, message);
    }

    #[test]
    fn decrypt_with_wrong_identity_fails() {
        let recipient = PrivateIdentity::new_from_rand(OsRng);
        let wrong = PrivateIdentity::new_from_rand(OsRng);
        let salt = recipient.address_hash().as_slice().to_vec();

        let ciphertext = encrypt_for_public_key(
            &recipient.as_identity().public_key,
            &salt,
            b"secret",
            OsRng,
        )
        .expect("ciphertext");

        assert!(decrypt_with_identity(&wrong, &salt, &ciphertext).is_err());
    }
}
