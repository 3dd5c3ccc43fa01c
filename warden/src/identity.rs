use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    crypto::{self, hex_serde, EntropySource, Ed25519KeyPair, PublicKey, Signature},
    storage::Storage,
    DeviceId, Error, Result,
};

pub const IDENTITY_FILE: &str = "identity.json";

/// A node's own keypair and the device id derived from it. Never leaves the node.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    device_id: DeviceId,
    keypair: Ed25519KeyPair,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    device_id: DeviceId,
    public_key: PublicKey,
    #[serde(with = "hex_serde")]
    secret_key: [u8; 32],
    #[serde(with = "hex_serde")]
    checksum: [u8; 32],
}

impl IdentityFile {
    fn checksum_of(device_id: &DeviceId, public_key: &PublicKey, secret_key: &[u8; 32]) -> [u8; 32] {
        crypto::hash_parts(&[
            secret_key.as_slice(),
            public_key.0.as_slice(),
            device_id.0.as_slice(),
        ])
    }
}

/// The device id for a public key.
pub fn fingerprint(public_key: &PublicKey) -> DeviceId {
    DeviceId(crypto::hash(&public_key.0))
}

impl DeviceIdentity {
    /// Loads the persisted identity, or generates and persists a fresh one.
    ///
    /// A persisted identity that fails any integrity check is reported as
    /// `IdentityCorrupt` and is left on disk untouched.
    pub async fn generate_or_load(
        storage: &dyn Storage,
        entropy: &dyn EntropySource,
    ) -> Result<Self> {
        if let Some(bytes) = storage.read(IDENTITY_FILE).await? {
            let identity = Self::decode(&bytes).map_err(|e| {
                error!("Refusing to use persisted identity: {}", e);
                e
            })?;
            info!("Loaded device identity {}", identity.device_id);
            return Ok(identity);
        }

        let keypair = Ed25519KeyPair::generate(entropy)?;
        let identity = Self {
            device_id: fingerprint(&keypair.public_key()),
            keypair,
        };
        storage.write_atomic(IDENTITY_FILE, &identity.encode()?).await?;
        info!("Generated device identity {}", identity.device_id);
        Ok(identity)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let public_key = self.keypair.public_key();
        let secret_key = self.keypair.secret_bytes();
        let file = IdentityFile {
            device_id: self.device_id,
            public_key,
            secret_key,
            checksum: IdentityFile::checksum_of(&self.device_id, &public_key, &secret_key),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| Error::IdentityCorrupt {
            reason: reason.to_string(),
        };

        let file: IdentityFile = serde_json::from_slice(bytes)
            .map_err(|e| corrupt(&format!("unreadable identity file: {e}")))?;

        let expected = IdentityFile::checksum_of(&file.device_id, &file.public_key, &file.secret_key);
        if expected != file.checksum {
            return Err(corrupt("checksum mismatch"));
        }

        let keypair = Ed25519KeyPair::from_secret_bytes(&file.secret_key);
        if keypair.public_key() != file.public_key {
            return Err(corrupt("public key does not match secret key"));
        }
        if fingerprint(&file.public_key) != file.device_id {
            return Err(corrupt("device id is not the public key fingerprint"));
        }

        Ok(Self {
            device_id: file.device_id,
            keypair,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }

    pub(crate) fn keypair(&self) -> &Ed25519KeyPair {
        &self.keypair
    }
}
