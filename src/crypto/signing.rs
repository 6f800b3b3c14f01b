//! Signing keys, the secret store seam and the configurable algorithms.

use crate::{WipeError, WipeResult};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING, ED25519,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    Ed25519,
    EcdsaP256Sha256,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::EcdsaP256Sha256 => "ecdsa-p256-sha256",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = WipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ed25519" => Ok(SignatureAlgorithm::Ed25519),
            "ecdsa-p256-sha256" | "ecdsa-p256" | "es256" => Ok(SignatureAlgorithm::EcdsaP256Sha256),
            other => Err(WipeError::Config(format!(
                "unknown signature algorithm '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn hex_digest(&self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = WipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            other => Err(WipeError::Config(format!("unknown hash algorithm '{}'", other))),
        }
    }
}

/// PKCS#8 private key handed out by a secret store
#[derive(Clone)]
pub struct KeyMaterial {
    algorithm: SignatureAlgorithm,
    pkcs8: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("pkcs8", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    pub fn new(algorithm: SignatureAlgorithm, pkcs8: Vec<u8>) -> Self {
        Self { algorithm, pkcs8 }
    }

    /// Generate a fresh key pair
    pub fn generate(algorithm: SignatureAlgorithm) -> WipeResult<Self> {
        let rng = SystemRandom::new();
        let document = match algorithm {
            SignatureAlgorithm::Ed25519 => Ed25519KeyPair::generate_pkcs8(&rng),
            SignatureAlgorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            }
        }
        .map_err(|_| WipeError::Signing("key generation failed".to_string()))?;

        Ok(Self::new(algorithm, document.as_ref().to_vec()))
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Raw PKCS#8 bytes, for writing a freshly generated key into a store
    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn signer(&self) -> WipeResult<Signer> {
        let rng = SystemRandom::new();
        let key = match self.algorithm {
            SignatureAlgorithm::Ed25519 => Ed25519KeyPair::from_pkcs8(&self.pkcs8)
                .map(SignerKey::Ed25519)
                .map_err(|e| WipeError::Signing(format!("rejected Ed25519 key: {}", e)))?,
            SignatureAlgorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &self.pkcs8, &rng)
                    .map(SignerKey::EcdsaP256)
                    .map_err(|e| WipeError::Signing(format!("rejected ECDSA key: {}", e)))?
            }
        };
        Ok(Signer { key, rng })
    }
}

enum SignerKey {
    Ed25519(Ed25519KeyPair),
    EcdsaP256(EcdsaKeyPair),
}

/// Loaded signing key
pub struct Signer {
    key: SignerKey,
    rng: SystemRandom,
}

impl Signer {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self.key {
            SignerKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
            SignerKey::EcdsaP256(_) => SignatureAlgorithm::EcdsaP256Sha256,
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        match &self.key {
            SignerKey::Ed25519(pair) => pair.public_key().as_ref().to_vec(),
            SignerKey::EcdsaP256(pair) => pair.public_key().as_ref().to_vec(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> WipeResult<Vec<u8>> {
        match &self.key {
            SignerKey::Ed25519(pair) => Ok(pair.sign(message).as_ref().to_vec()),
            SignerKey::EcdsaP256(pair) => pair
                .sign(&self.rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| WipeError::Signing("ECDSA signing failed".to_string())),
        }
    }
}

/// Check `signature` over `message` against a raw public key
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> bool {
    match algorithm {
        SignatureAlgorithm::Ed25519 => UnparsedPublicKey::new(&ED25519, public_key)
            .verify(message, signature)
            .is_ok(),
        SignatureAlgorithm::EcdsaP256Sha256 => {
            UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, public_key)
                .verify(message, signature)
                .is_ok()
        }
    }
}

/// Supplier of signing key material. The core never persists or logs keys.
pub trait SecretStore: Send + Sync {
    fn signing_key(&self, key_id: &str) -> WipeResult<KeyMaterial>;

    /// Public half of a stored key, the trust anchor for verification
    fn public_key(&self, key_id: &str) -> WipeResult<Vec<u8>> {
        Ok(self.signing_key(key_id)?.signer()?.public_key())
    }
}

/// Reads `<dir>/<key_id>.pk8` PKCS#8 DER files
pub struct FileSecretStore {
    dir: PathBuf,
    algorithm: SignatureAlgorithm,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>, algorithm: SignatureAlgorithm) -> Self {
        Self {
            dir: dir.into(),
            algorithm,
        }
    }

    pub fn key_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{}.pk8", key_id))
    }

    /// Write a key into the store directory, refusing to overwrite
    pub fn store(&self, key_id: &str, key: &KeyMaterial) -> WipeResult<PathBuf> {
        use std::io::Write;

        std::fs::create_dir_all(&self.dir)?;
        let path = self.key_path(key_id);
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(key.pkcs8())?;
        file.sync_all()?;
        Ok(path)
    }
}

impl SecretStore for FileSecretStore {
    fn signing_key(&self, key_id: &str) -> WipeResult<KeyMaterial> {
        let path = self.key_path(key_id);
        let pkcs8 = std::fs::read(&path).map_err(|e| {
            WipeError::Signing(format!("cannot read key '{}' from secret store: {}", key_id, e))
        })?;
        tracing::debug!(key_id, "Loaded signing key from secret store");
        Ok(KeyMaterial::new(self.algorithm, pkcs8))
    }
}

/// In-memory secret store
#[derive(Default)]
pub struct MemorySecretStore {
    keys: HashMap<String, KeyMaterial>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_id: impl Into<String>, key: KeyMaterial) -> Self {
        self.keys.insert(key_id.into(), key);
        self
    }

    /// Store holding one freshly generated key
    pub fn generated(key_id: impl Into<String>, algorithm: SignatureAlgorithm) -> WipeResult<Self> {
        Ok(Self::new().with_key(key_id, KeyMaterial::generate(algorithm)?))
    }
}

impl SecretStore for MemorySecretStore {
    fn signing_key(&self, key_id: &str) -> WipeResult<KeyMaterial> {
        self.keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| WipeError::Signing(format!("no key '{}' in secret store", key_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(SignatureAlgorithm::Ed25519 ; "ed25519")]
    #[test_case(SignatureAlgorithm::EcdsaP256Sha256 ; "ecdsa p256")]
    fn test_sign_and_verify(algorithm: SignatureAlgorithm) {
        let signer = KeyMaterial::generate(algorithm).unwrap().signer().unwrap();
        let message = b"log hash payload";

        let signature = signer.sign(message).unwrap();

        assert_eq!(signer.algorithm(), algorithm);
        assert!(verify_signature(algorithm, &signer.public_key(), message, &signature));
        assert!(!verify_signature(algorithm, &signer.public_key(), b"tampered", &signature));
    }

    #[test]
    fn test_wrong_algorithm_key_is_rejected() {
        let ed = KeyMaterial::generate(SignatureAlgorithm::Ed25519).unwrap();
        let mislabeled = KeyMaterial::new(SignatureAlgorithm::EcdsaP256Sha256, ed.pkcs8().to_vec());
        assert!(matches!(mislabeled.signer(), Err(WipeError::Signing(_))));
    }

    #[test]
    fn test_key_material_debug_redacts() {
        let key = KeyMaterial::new(SignatureAlgorithm::Ed25519, vec![1, 2, 3]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("[1, 2, 3]"));
    }

    #[test]
    fn test_hash_algorithms() {
        assert_eq!(
            HashAlgorithm::Sha256.hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(HashAlgorithm::Sha512.digest(b"abc").len(), 64);
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("ED25519".parse::<SignatureAlgorithm>().unwrap(), SignatureAlgorithm::Ed25519);
        assert_eq!(
            "es256".parse::<SignatureAlgorithm>().unwrap(),
            SignatureAlgorithm::EcdsaP256Sha256
        );
        assert_eq!("sha-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_memory_store_missing_key() {
        let store = MemorySecretStore::new();
        assert!(matches!(store.signing_key("nope"), Err(WipeError::Signing(_))));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path(), SignatureAlgorithm::Ed25519);
        let key = KeyMaterial::generate(SignatureAlgorithm::Ed25519).unwrap();

        let path = store.store("signer", &key).unwrap();
        assert!(path.ends_with("signer.pk8"));
        assert!(store.store("signer", &key).is_err(), "existing keys are never overwritten");

        let loaded = store.signing_key("signer").unwrap();
        assert_eq!(loaded.pkcs8(), key.pkcs8());
        assert!(loaded.signer().is_ok());
    }
}
