//! Node identity and crypto: Ed25519 signing key, X25519 shared secrets, PSK sealing.

use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::packet::{PUB_KEY_SIZE, SIGNATURE_SIZE};

pub const SEED_SIZE: usize = 32;
pub const PSK_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const MAX_GENERATE_ATTEMPTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    PublicKey,
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("sealed payload too short")]
    Truncated,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// This node's keypair. The secret never leaves the struct except as the persisted seed.
pub struct LocalIdentity {
    signing: SigningKey,
    dh_secret: StaticSecret,
}

impl LocalIdentity {
    pub fn from_seed(seed: [u8; SEED_SIZE]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let expanded = Sha512::digest(seed);
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&expanded[..32]);
        Self {
            signing,
            dh_secret: StaticSecret::from(scalar),
        }
    }

    /// Fresh identity. Keys starting with 0x00 or 0xFF are rerolled: those hash prefixes are reserved.
    pub fn generate() -> Self {
        Self::generate_with(random_seed)
    }

    /// Up to `MAX_GENERATE_ATTEMPTS` rerolls; the last key is kept even if still reserved.
    fn generate_with(mut next_seed: impl FnMut() -> [u8; SEED_SIZE]) -> Self {
        let mut identity = Self::from_seed(next_seed());
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            if !has_reserved_prefix(&identity.public_key()) {
                break;
            }
            identity = Self::from_seed(next_seed());
        }
        identity
    }

    pub fn seed(&self) -> [u8; SEED_SIZE] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> [u8; PUB_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 secret shared with the holder of the Ed25519 key `peer`.
    pub fn shared_secret(&self, peer: &[u8; PUB_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
        let peer = VerifyingKey::from_bytes(peer).map_err(|_| CryptoError::PublicKey)?;
        let montgomery = X25519PublicKey::from(peer.to_montgomery().to_bytes());
        Ok(self.dh_secret.diffie_hellman(&montgomery).to_bytes())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self, CryptoError> {
        let mut seed = [0u8; SEED_SIZE];
        r.read_exact(&mut seed)?;
        Ok(Self::from_seed(seed))
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<(), CryptoError> {
        w.write_all(&self.seed())?;
        w.flush()?;
        Ok(())
    }
}

fn has_reserved_prefix(public_key: &[u8; PUB_KEY_SIZE]) -> bool {
    matches!(public_key[0], 0x00 | 0xFF)
}

fn random_seed() -> [u8; SEED_SIZE] {
    let mut seed = [0u8; SEED_SIZE];
    OsRng.fill_bytes(&mut seed);
    seed
}

pub fn verify(public_key: &[u8; PUB_KEY_SIZE], message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn psk_cipher(psk: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
    let mut hasher = Sha256::new();
    hasher.update(b"meshnode-psk-v1");
    hasher.update(psk);
    let key: [u8; 32] = hasher.finalize().into();
    ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::Key)
}

/// Encrypt under a pre-shared key. Output is `nonce || ciphertext || tag`.
pub fn seal(psk: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = psk_cipher(psk)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(psk: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated);
    }
    let cipher = psk_cipher(psk)?;
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
