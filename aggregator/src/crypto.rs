//! Cryptographic primitives used by the signature aggregation engine.
//!
//! The exact implementations of these primitives is an implementation detail for this module only and dependents
//! should not care about the implementations. This gives us some confidence that we could replace the implementations
//! in the future if we wanted to.

use std::fmt::Display;

use anyhow::{Result, anyhow};
use bls12_381::G1Projective;
use bls_signatures::Serialize as BlsSerialize;
use serde::{
    Deserialize,
    de::{self, Unexpected},
};
use sha3::{Digest, Keccak256};

/// A single validator's BLS signature over an unsigned message, prior to aggregation. Also the
/// type of the aggregate itself, since BLS aggregation is closed over signatures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSignature(bls_signatures::Signature);

impl NodeSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<NodeSignature> {
        Ok(NodeSignature(bls_signatures::Signature::from_bytes(bytes)?))
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.0.as_bytes()
    }

    /// Combines partial signatures into one aggregate signature. Order-independent.
    pub fn aggregate(signatures: &[NodeSignature]) -> Result<NodeSignature> {
        let signatures: Vec<_> = signatures.iter().map(|s| s.0).collect();
        Ok(NodeSignature(bls_signatures::aggregate(&signatures)?))
    }

    // Verifying an aggregated signature over a single message is a case of verifying the
    // aggregated public key against the aggregated signature.
    pub fn verify_aggregate(
        signature: &NodeSignature,
        message: &[u8],
        public_keys: &[NodePublicKey],
    ) -> Result<()> {
        if public_keys.is_empty() {
            return Err(anyhow!("no public keys"));
        }
        let aggregated: G1Projective = public_keys
            .iter()
            .map(|p| G1Projective::from(p.0.as_affine()))
            .sum();
        let aggregated = bls_signatures::PublicKey::from(aggregated);
        if !aggregated.verify(signature.0, message) {
            return Err(anyhow!("invalid aggregate signature"));
        }

        Ok(())
    }
}

impl serde::Serialize for NodeSignature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::serialize(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for NodeSignature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        NodeSignature::from_bytes(&bytes)
            .map_err(|_| de::Error::invalid_value(Unexpected::Bytes(&bytes), &"a signature"))
    }
}

/// The public key identifying a canonical validator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodePublicKey(bls_signatures::PublicKey);

impl NodePublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<NodePublicKey> {
        Ok(NodePublicKey(bls_signatures::PublicKey::from_bytes(bytes)?))
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: NodeSignature) -> Result<()> {
        if !self.0.verify(signature.0, message) {
            return Err(anyhow!("invalid signature"));
        }

        Ok(())
    }
}

impl Display for NodePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl serde::Serialize for NodePublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::serialize(&self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for NodePublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        NodePublicKey::from_bytes(&bytes)
            .map_err(|_| de::Error::invalid_value(Unexpected::Bytes(&bytes), &"a public key"))
    }
}

/// The secret key type used as the basis of all cryptography in the node.
/// The BLS signing key of a validator node and its libp2p identity are both derived from this.
#[derive(Debug, Clone, Copy)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    pub fn new_from_rng<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Result<SecretKey> {
        let bls = bls_signatures::PrivateKey::generate(rng);
        Self::from_bytes(&bls.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        // Reject byte strings which do not encode a valid scalar, so `as_bls` cannot fail later.
        bls_signatures::PrivateKey::from_bytes(&bytes)?;

        Ok(SecretKey { bytes })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s)?;
        Self::from_bytes(&bytes_vec)
    }

    fn as_bls(&self) -> bls_signatures::PrivateKey {
        // `from_bytes` can only fail when the bytes do not encode a valid scalar. We validate
        // this is not the case on construction, so it is safe to unwrap here.
        bls_signatures::PrivateKey::from_bytes(&self.bytes).unwrap()
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn sign(&self, message: &[u8]) -> NodeSignature {
        NodeSignature(self.as_bls().sign(message))
    }

    pub fn node_public_key(&self) -> NodePublicKey {
        NodePublicKey(self.as_bls().public_key())
    }

    pub fn to_libp2p_keypair(&self) -> libp2p::identity::Keypair {
        let keypair: libp2p::identity::ed25519::Keypair = libp2p::identity::ed25519::SecretKey::try_from_bytes(self.bytes)
            .expect("`SecretKey::from_bytes` returns an `Err` only when the length is not 32, we know the length is 32")
            .into();
        keypair.into()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Hash> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Ok(Hash(bytes.as_slice().try_into()?))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}
