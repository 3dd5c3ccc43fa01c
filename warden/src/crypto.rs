use blake3::Hasher;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::{rngs::OsRng, rngs::StdRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Source of key material and token bytes.
pub trait EntropySource: Send + Sync + fmt::Debug {
    fn fill(&self, dest: &mut [u8]) -> Result<()>;
}

/// The operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| Error::Crypto(format!("OS entropy unavailable: {e}")))
    }
}

/// Deterministic entropy for tests and simulations. Never use for real keys.
#[derive(Debug)]
pub struct SeededEntropy {
    rng: Mutex<StdRng>,
}

impl SeededEntropy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl EntropySource for SeededEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        self.rng.lock().fill_bytes(dest);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_serde")] pub Vec<u8>);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_serde")] pub [u8; 32]);

impl PublicKey {
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| Error::Crypto(format!("Invalid public key: {e}")))?;
        let bytes: [u8; 64] = signature
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("Invalid signature length".to_string()))?;
        key.verify(message, &Ed25519Signature::from_bytes(&bytes))
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone)]
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    pub fn generate(entropy: &dyn EntropySource) -> Result<Self> {
        let mut bytes = [0u8; 32];
        entropy.fill(&mut bytes)?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes().to_vec())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.public_key().verify(message, signature)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash of several byte strings, each prefixed with its length so boundaries can't shift.
pub fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Hex encoding for byte fields in the JSON artifacts.
pub mod hex_serde {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: hex::FromHex,
        T::Error: std::fmt::Display,
    {
        let s = String::deserialize(deserializer)?;
        T::from_hex(s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Ed25519KeyPair::generate(&SeededEntropy::new(7)).unwrap();
        let sig = keypair.sign(b"certificate body");

        assert!(keypair.verify(b"certificate body", &sig).is_ok());
        assert!(keypair.verify(b"tampered body", &sig).is_err());
    }

    #[test]
    fn test_keypair_restores_from_secret() {
        let keypair = Ed25519KeyPair::generate(&OsEntropy).unwrap();
        let restored = Ed25519KeyPair::from_secret_bytes(&keypair.secret_bytes());
        assert_eq!(keypair.public_key(), restored.public_key());
    }

    #[test]
    fn test_seeded_entropy_is_deterministic() {
        let (mut a, mut b) = ([0u8; 16], [0u8; 16]);
        SeededEntropy::new(42).fill(&mut a).unwrap();
        SeededEntropy::new(42).fill(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_parts_respects_boundaries() {
        assert_ne!(
            hash_parts(&[b"ab".as_slice(), b"c".as_slice()]),
            hash_parts(&[b"a".as_slice(), b"bc".as_slice()])
        );
    }
}
