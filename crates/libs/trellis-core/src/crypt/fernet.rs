use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, Key, KeyIvInit};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::TrellisError;

type AesCbcEnc = cbc::Encryptor<aes::Aes256>;
type AesCbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const KEY_LEN: usize = 32;

/// AES block width; PKCS#7 pads every token up to a block boundary.
pub const TOKEN_BLOCK: usize = 16;
/// Fixed token cost on top of the padded ciphertext: IV plus HMAC tag.
pub const TOKEN_OVERHEAD: usize = IV_LEN + TAG_LEN;

/// The encrypted-token construction carried on every confidential wire
/// payload: `IV(16) ∥ AES-256-CBC/PKCS#7 ciphertext ∥ HMAC-SHA256(32)`,
/// with the tag covering everything before it.
///
/// This is the Fernet layout with the spec's VERSION and TIMESTAMP fields
/// left out: both cost bytes on narrow links and the timestamp leaks
/// initiator metadata.
pub struct Fernet {
    sign_key: [u8; KEY_LEN],
    enc_key: Key<aes::Aes256>,
}

impl Fernet {
    /// Builds a token cipher from the two halves of a derived session key.
    /// Key material beyond 32 bytes per half is ignored.
    pub fn from_halves(sign_key: &[u8], enc_key: &[u8]) -> Self {
        let mut sign = [0u8; KEY_LEN];
        let sign_len = sign_key.len().min(KEY_LEN);
        sign[..sign_len].copy_from_slice(&sign_key[..sign_len]);

        let mut enc = [0u8; KEY_LEN];
        let enc_len = enc_key.len().min(KEY_LEN);
        enc[..enc_len].copy_from_slice(&enc_key[..enc_len]);

        Self { sign_key: sign, enc_key: enc.into() }
    }

    /// Exact token size for a plaintext of the given length.
    pub fn token_len(plaintext_len: usize) -> usize {
        let padded = (plaintext_len / TOKEN_BLOCK + 1) * TOKEN_BLOCK;
        TOKEN_OVERHEAD + padded
    }

    fn tag_over(&self, data: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .expect("hmac accepts any key size");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Tokenizes `plaintext` into `out`, returning the token length.
    pub fn encrypt<R: CryptoRngCore>(
        &self,
        mut rng: R,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, TrellisError> {
        let token_len = Self::token_len(plaintext.len());
        if out.len() < token_len {
            return Err(TrellisError::OutOfMemory);
        }

        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);
        out[..IV_LEN].copy_from_slice(&iv);

        let cipher_end = token_len - TAG_LEN;
        AesCbcEnc::new(&self.enc_key, &iv.into())
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut out[IV_LEN..cipher_end])
            .map_err(|_| TrellisError::CryptoError)?;

        let tag = self.tag_over(&out[..cipher_end]);
        out[cipher_end..token_len].copy_from_slice(&tag);

        Ok(token_len)
    }

    pub fn encrypt_vec<R: CryptoRngCore>(
        &self,
        rng: R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TrellisError> {
        let mut out = vec![0u8; Self::token_len(plaintext.len())];
        let written = self.encrypt(rng, plaintext, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Authenticates and decrypts a token into `out`, returning the
    /// plaintext length. The tag check runs over the whole token before
    /// any ciphertext is touched.
    pub fn decrypt(&self, token: &[u8], out: &mut [u8]) -> Result<usize, TrellisError> {
        if token.len() < Self::token_len(0)
            || (token.len() - TOKEN_OVERHEAD) % TOKEN_BLOCK != 0
        {
            return Err(TrellisError::InvalidArgument);
        }

        let (body, tag) = token.split_at(token.len() - TAG_LEN);
        let expected = self.tag_over(body);

        let mut difference = 0u8;
        for (ours, theirs) in expected.iter().zip(tag) {
            difference |= ours ^ theirs;
        }
        if difference != 0 {
            return Err(TrellisError::SignatureInvalid);
        }

        let (iv, ciphertext) = body.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| TrellisError::InvalidArgument)?;

        let plaintext = AesCbcDec::new(&self.enc_key, &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, out)
            .map_err(|_| TrellisError::CryptoError)?;

        Ok(plaintext.len())
    }

    pub fn decrypt_vec(&self, token: &[u8]) -> Result<Vec<u8>, TrellisError> {
        let mut out = vec![0u8; token.len()];
        let written = self.decrypt(token, &mut out)?;
        out.truncate(written);
        Ok(out)
    }
}
