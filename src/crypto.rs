//! Self-describing addresses and public keys, the identifier tables that fix
//! their lengths, and the node identity keypair.
//!
//! An address is `<curve_id:1><hash_algo_id:1><digest:N>` and a public key is
//! `<curve_id:1><origin_id:1><key:K>`; `N` and `K` come from the lookup
//! tables below, so both types can be parsed out of a byte stream without an
//! explicit length prefix.

use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_256, Sha3_512};

use crate::encoding::ByteReader;
use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Curve {
    Ed25519,
    NistP256,
    Secp256k1,
}

impl Curve {
    pub fn from_id(id: u8) -> ChainResult<Self> {
        match id {
            0 => Ok(Curve::Ed25519),
            1 => Ok(Curve::NistP256),
            2 => Ok(Curve::Secp256k1),
            other => Err(ChainError::Crypto(format!("unknown curve id {other}"))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Curve::Ed25519 => 0,
            Curve::NistP256 => 1,
            Curve::Secp256k1 => 2,
        }
    }

    /// Raw key length for the curve, excluding the two id bytes.
    pub fn key_size(self) -> usize {
        match self {
            Curve::Ed25519 => 32,
            Curve::NistP256 | Curve::Secp256k1 => 65,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Sha3_256,
    Sha3_512,
    Blake3,
}

impl HashAlgorithm {
    pub fn from_id(id: u8) -> ChainResult<Self> {
        match id {
            0 => Ok(HashAlgorithm::Sha256),
            1 => Ok(HashAlgorithm::Sha512),
            2 => Ok(HashAlgorithm::Sha3_256),
            3 => Ok(HashAlgorithm::Sha3_512),
            4 => Ok(HashAlgorithm::Blake3),
            other => Err(ChainError::Crypto(format!("unknown hash algorithm id {other}"))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            HashAlgorithm::Sha256 => 0,
            HashAlgorithm::Sha512 => 1,
            HashAlgorithm::Sha3_256 => 2,
            HashAlgorithm::Sha3_512 => 3,
            HashAlgorithm::Blake3 => 4,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 | HashAlgorithm::Sha3_256 | HashAlgorithm::Blake3 => 32,
            HashAlgorithm::Sha512 | HashAlgorithm::Sha3_512 => 64,
        }
    }
}

pub fn hash(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        HashAlgorithm::Sha3_256 => Sha3_256::digest(data).to_vec(),
        HashAlgorithm::Sha3_512 => Sha3_512::digest(data).to_vec(),
        HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
    }
}

/// Chain address: curve id, hash algorithm id, digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Vec<u8>);

impl Address {
    pub fn from_bytes(bytes: Vec<u8>) -> ChainResult<Self> {
        if bytes.len() < 2 {
            return Err(ChainError::Crypto("address shorter than its header".into()));
        }
        Curve::from_id(bytes[0])?;
        let algorithm = HashAlgorithm::from_id(bytes[1])?;
        let expected = 2 + algorithm.digest_size();
        if bytes.len() != expected {
            return Err(ChainError::Crypto(format!(
                "address length {} does not match algorithm (expected {expected})",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Derives the address of a public key: the key's curve id, the given
    /// hash algorithm, and the digest of the full key bytes.
    pub fn from_public_key(algorithm: HashAlgorithm, public_key: &PublicKey) -> Self {
        let mut bytes = Vec::with_capacity(2 + algorithm.digest_size());
        bytes.push(public_key.curve().id());
        bytes.push(algorithm.id());
        bytes.extend_from_slice(&hash(algorithm, public_key.as_bytes()));
        Self(bytes)
    }

    /// Reads a self-describing address off a byte stream.
    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let curve_id = reader.read_u8()?;
        let algo_id = reader.read_u8()?;
        Curve::from_id(curve_id)?;
        let algorithm = HashAlgorithm::from_id(algo_id)?;
        let digest = reader.read_bytes(algorithm.digest_size())?;
        let mut bytes = Vec::with_capacity(2 + digest.len());
        bytes.push(curve_id);
        bytes.push(algo_id);
        bytes.extend_from_slice(digest);
        Ok(Self(bytes))
    }

    pub fn curve(&self) -> Curve {
        Curve::from_id(self.0[0]).expect("validated at construction")
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::from_id(self.0[1]).expect("validated at construction")
    }

    /// Partitioning byte: the third byte of the address (first digest byte).
    pub fn subset(&self) -> u8 {
        self.0[2]
    }

    pub fn digest(&self) -> &[u8] {
        &self.0[2..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid address encoding: {err}")))?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::from_hex(&raw).map_err(D::Error::custom)
    }
}

/// Public key: curve id, origin id, raw key bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: Vec<u8>) -> ChainResult<Self> {
        if bytes.len() < 2 {
            return Err(ChainError::Crypto("public key shorter than its header".into()));
        }
        let curve = Curve::from_id(bytes[0])?;
        let expected = 2 + curve.key_size();
        if bytes.len() != expected {
            return Err(ChainError::Crypto(format!(
                "public key length {} does not match curve (expected {expected})",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let curve_id = reader.read_u8()?;
        let origin_id = reader.read_u8()?;
        let curve = Curve::from_id(curve_id)?;
        let key = reader.read_bytes(curve.key_size())?;
        let mut bytes = Vec::with_capacity(2 + key.len());
        bytes.push(curve_id);
        bytes.push(origin_id);
        bytes.extend_from_slice(key);
        Ok(Self(bytes))
    }

    /// Placeholder key used when no origin key matched during the proof of
    /// work search; always fails verification.
    pub fn null() -> Self {
        Self(vec![0u8; 2 + Curve::Ed25519.key_size()])
    }

    pub fn curve(&self) -> Curve {
        Curve::from_id(self.0[0]).expect("validated at construction")
    }

    pub fn origin_id(&self) -> u8 {
        self.0[1]
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.0[2..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
        Self::from_bytes(bytes)
    }

    /// Verifies a signature, failing on malformed input or an unsupported
    /// curve.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> ChainResult<()> {
        if self.verifies(message, signature) {
            Ok(())
        } else {
            Err(ChainError::Crypto("signature verification failed".into()))
        }
    }

    /// Signature check as a plain predicate, for search loops where a
    /// mismatch is expected rather than exceptional.
    pub fn verifies(&self, message: &[u8], signature: &[u8]) -> bool {
        if self.curve() != Curve::Ed25519 {
            return false;
        }
        let Ok(public) = ed25519_dalek::PublicKey::from_bytes(self.key_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_bytes(signature) else {
            return false;
        };
        public.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PublicKey::from_hex(&raw).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeypair {
    public_key: String,
    secret_key: String,
}

/// Node identity: an ed25519 keypair plus its self-describing public form.
pub struct NodeKeys {
    keypair: Keypair,
    public_key: PublicKey,
}

impl NodeKeys {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate(&mut OsRng))
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let mut bytes = Vec::with_capacity(2 + 32);
        bytes.push(Curve::Ed25519.id());
        bytes.push(0);
        bytes.extend_from_slice(keypair.public.as_bytes());
        let public_key = PublicKey::from_bytes(bytes).expect("well-formed ed25519 key");
        Self {
            keypair,
            public_key,
        }
    }

    pub fn load_or_generate(path: &Path) -> ChainResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let keys = Self::generate();
            keys.save(path)?;
            Ok(keys)
        }
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let raw = fs::read_to_string(path)?;
        let stored: StoredKeypair = toml::from_str(&raw)
            .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
        let secret_bytes = hex::decode(stored.secret_key)
            .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
        let secret = SecretKey::from_bytes(&secret_bytes)
            .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
        let public = ed25519_dalek::PublicKey::from(&secret);
        Ok(Self::from_keypair(Keypair { secret, public }))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let stored = StoredKeypair {
            public_key: hex::encode(self.keypair.public.to_bytes()),
            secret_key: hex::encode(self.keypair.secret.to_bytes()),
        };
        let encoded = toml::to_string_pretty(&stored)
            .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
        fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeys({})", self.public_key.to_hex())
    }
}
