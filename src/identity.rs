//! # Identity, Addresses and Distance
//!
//! This module defines the identity types used throughout the seed node:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte Ed25519 public key, verified by the transport on every envelope
//! - [`Address`]: 20-byte routing address derived from an [`Identity`]
//! - [`Peer`]: an address together with the endpoint it can be reached at
//!
//! ## Address Derivation
//!
//! `Address = BLAKE3(ADDRESS_DOMAIN || public_key)[12..32]`
//!
//! The derivation is deterministic, so any peer can recompute the address of
//! a sender from the public key carried in a signed envelope. A [`Peer`]
//! whose address does not match its public key is never admitted.
//!
//! ## Distance
//!
//! Distance between two addresses is their bitwise XOR, compared
//! lexicographically. The bucket a peer belongs to is the number of leading
//! bits its address shares with ours (see [`bucket_index`]).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Length of a routing address in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Number of distance classes (one bucket per possible shared-prefix length).
pub const TABLE_SIZE: usize = ADDRESS_LEN * 8;

const ADDRESS_DOMAIN: &[u8] = b"korium-seed-address-v1:";

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(bytes) }
    }

    /// Parse a hex-encoded 32-byte Ed25519 secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self::from_secret_key_bytes(&arr))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity(self.signing_key.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.identity().address()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that this identity is a usable Ed25519 public key.
    ///
    /// All-zero and all-0xFF keys are rejected up front; everything else must
    /// decode as a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Derive the routing address for this public key.
    pub fn address(&self) -> Address {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ADDRESS_DOMAIN);
        hasher.update(&self.0);
        let digest = hasher.finalize();
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest.as_bytes()[32 - ADDRESS_LEN..]);
        Address(out)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Fixed-length routing address. Immutable; derived from an [`Identity`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Address) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits shared with `other` (`TABLE_SIZE` when equal).
    pub fn common_prefix_len(&self, other: &Address) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        TABLE_SIZE
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// Compare two XOR distances.
///
/// # Example
/// ```ignore
/// let dist_a = target.xor_distance(&a);
/// let dist_b = target.xor_distance(&b);
/// if distance_cmp(&dist_a, &dist_b) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &[u8; ADDRESS_LEN], b: &[u8; ADDRESS_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Bucket index of `other` relative to `self_addr`.
///
/// Equal addresses map to the last bucket; callers reject their own address
/// before indexing.
pub fn bucket_index(self_addr: &Address, other: &Address) -> usize {
    self_addr.common_prefix_len(other).min(TABLE_SIZE - 1)
}

/// Random address that falls into bucket `bucket_idx` relative to `self_addr`.
pub fn random_address_in_bucket(self_addr: &Address, bucket_idx: usize) -> Address {
    let bucket_idx = bucket_idx.min(TABLE_SIZE - 1);
    let self_bytes = self_addr.as_bytes();

    let mut distance: [u8; ADDRESS_LEN] = rand::random();

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ADDRESS_LEN];
    for i in 0..ADDRESS_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    Address(target)
}

/// A reachable participant of the overlay. Equality is by address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub identity: Identity,
    pub address: Address,
    /// `host:port` the peer listens on.
    pub endpoint: String,
    /// IP the peer was last observed sending from, if any.
    #[serde(default)]
    pub public_ip: Option<IpAddr>,
}

impl Peer {
    pub fn new(identity: Identity, endpoint: impl Into<String>) -> Self {
        Self {
            identity,
            address: identity.address(),
            endpoint: endpoint.into(),
            public_ip: None,
        }
    }

    pub fn with_public_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.public_ip = ip;
        self
    }

    /// Whether the advertised address really belongs to the public key.
    pub fn is_consistent(&self) -> bool {
        self.identity.address() == self.address && self.identity.is_valid()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.address, self.endpoint)
    }
}
