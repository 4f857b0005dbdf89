//! Cryptographic utilities for DVPN
//!
//! X25519 tunnel keys, Ed25519 owner signatures binding a tunnel key to a
//! paid session, and hash-derived tunnel addresses.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{DvpnError, Result};
use crate::ledger::Pubkey;

/// Size of the X25519 public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// A client's tunnel public key (base64 of 32 bytes on the wire)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelKey([u8; PUBLIC_KEY_SIZE]);

impl TunnelKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Canonical base64 text, the exact message owners sign
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl FromStr for TunnelKey {
    type Err = DvpnError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = BASE64
            .decode(s.trim().as_bytes())
            .map_err(|e| DvpnError::InvalidTunnelKey(format!("not base64: {}", e)))?;
        let bytes: [u8; PUBLIC_KEY_SIZE] = raw.try_into().map_err(|v: Vec<u8>| {
            DvpnError::InvalidTunnelKey(format!("{} bytes, expected {}", v.len(), PUBLIC_KEY_SIZE))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelKey({})", self.to_base64())
    }
}

impl Serialize for TunnelKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for TunnelKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// X25519 key pair for a tunnel interface
#[derive(Clone)]
pub struct TunnelKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl TunnelKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from existing secret bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> TunnelKey {
        TunnelKey(*self.public.as_bytes())
    }

    /// Secret key in the base64 form `wg` expects
    pub fn secret_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for TunnelKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelKeyPair")
            .field("public", &BASE64.encode(self.public.as_bytes()))
            .finish()
    }
}

/// Parse a detached signature, base58 (wallet default) or base64
pub fn parse_signature(text: &str) -> Result<Signature> {
    let text = text.trim();
    let raw = bs58::decode(text)
        .into_vec()
        .ok()
        .filter(|v| v.len() == SIGNATURE_SIZE)
        .or_else(|| BASE64.decode(text.as_bytes()).ok())
        .ok_or_else(|| DvpnError::InvalidSignature("neither base58 nor base64".to_string()))?;
    let bytes: [u8; SIGNATURE_SIZE] = raw.try_into().map_err(|v: Vec<u8>| {
        DvpnError::InvalidSignature(format!("{} bytes, expected {}", v.len(), SIGNATURE_SIZE))
    })?;
    Ok(Signature::from_bytes(&bytes))
}

/// Check that `owner` signed the UTF-8 bytes of `message`
pub fn verify_owner_signature(owner: &Pubkey, message: &str, signature: &Signature) -> Result<()> {
    let key = VerifyingKey::from_bytes(owner.as_bytes())
        .map_err(|e| DvpnError::InvalidSignature(format!("owner is not an ed25519 key: {}", e)))?;
    key.verify(message.as_bytes(), signature)
        .map_err(|_| DvpnError::InvalidSignature(format!("not signed by session owner {}", owner)))
}

/// Sign a tunnel key as a session owner would, returning base58
pub fn sign_tunnel_key(owner: &SigningKey, key: &TunnelKey) -> String {
    bs58::encode(owner.sign(key.to_base64().as_bytes()).to_bytes()).into_string()
}

/// Ledger address of an Ed25519 signing key
pub fn owner_pubkey(owner: &SigningKey) -> Pubkey {
    Pubkey::new(owner.verifying_key().to_bytes())
}

/// IPv4 range tunnel addresses are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Addr,
    prefix_len: u8,
    reserved_low: u32,
}

impl AddressPool {
    /// `cidr` like `10.10.0.0/24`; the lowest `reserved_low` host numbers are
    /// never handed out
    pub fn new(cidr: &str, reserved_low: u32) -> Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| DvpnError::Config(format!("address pool {} is not CIDR", cidr)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| DvpnError::Config(format!("address pool {}: {}", cidr, e)))?;
        let prefix_len: u8 = prefix
            .parse()
            .ok()
            .filter(|p| (8..=30).contains(p))
            .ok_or_else(|| DvpnError::Config(format!("address pool prefix /{} must be 8..=30", prefix)))?;

        let mask = u32::MAX << (32 - prefix_len);
        let pool = Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
            reserved_low,
        };
        if pool.span() == 0 {
            return Err(DvpnError::Config(format!(
                "address pool {} has no hosts left after reserving {}",
                cidr, reserved_low
            )));
        }
        Ok(pool)
    }

    fn size(&self) -> u32 {
        1u32 << (32 - self.prefix_len)
    }

    /// Number of allocatable hosts: everything except the reserved low
    /// block and the broadcast address
    pub fn span(&self) -> u32 {
        self.size().saturating_sub(1).saturating_sub(self.reserved_low)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix_len);
        u32::from(addr) & mask == u32::from(self.network)
    }

    /// Inside the allocatable span: not the network address, not the
    /// reserved low block, not broadcast
    pub fn is_allocatable(&self, addr: Ipv4Addr) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let host = u32::from(addr) - u32::from(self.network);
        host >= self.reserved_low && host < self.size() - 1
    }

    /// Deterministic address for a tunnel key: `sha256(key text)` reduced
    /// into the allocatable span
    pub fn allocate(&self, key: &TunnelKey) -> Ipv4Addr {
        let digest = Sha256::digest(key.to_base64().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let host = (u64::from_be_bytes(head) % u64::from(self.span())) as u32 + self.reserved_low;
        Ipv4Addr::from(u32::from(self.network) + host)
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let keypair = TunnelKeyPair::generate();
        let public = keypair.public_key();
        assert_eq!(public.to_base64().parse::<TunnelKey>().unwrap(), public);
        let restored = TunnelKeyPair::from_secret_bytes(
            BASE64.decode(keypair.secret_base64()).unwrap().try_into().unwrap(),
        );
        assert_eq!(restored.public_key(), public);
    }

    #[test]
    fn test_tunnel_key_rejects_wrong_length() {
        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(short.parse::<TunnelKey>(), Err(DvpnError::InvalidTunnelKey(_))));
        assert!("%%%".parse::<TunnelKey>().is_err());
    }

    #[test]
    fn test_owner_signature_binds_key() {
        let owner = SigningKey::generate(&mut OsRng);
        let key = TunnelKeyPair::generate().public_key();
        let sig = parse_signature(&sign_tunnel_key(&owner, &key)).unwrap();
        assert!(verify_owner_signature(&owner_pubkey(&owner), &key.to_base64(), &sig).is_ok());

        // Same signature, different key
        let other = TunnelKeyPair::generate().public_key();
        assert!(verify_owner_signature(&owner_pubkey(&owner), &other.to_base64(), &sig).is_err());

        // Right key, wrong signer
        let stranger = SigningKey::generate(&mut OsRng);
        assert!(matches!(
            verify_owner_signature(&owner_pubkey(&stranger), &key.to_base64(), &sig),
            Err(DvpnError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_signature_accepts_base64() {
        let owner = SigningKey::generate(&mut OsRng);
        let sig = owner.sign(b"hello");
        let parsed = parse_signature(&BASE64.encode(sig.to_bytes())).unwrap();
        assert_eq!(parsed, sig);
        assert!(parse_signature("abc").is_err());
    }

    #[test]
    fn test_allocation_is_deterministic_and_in_range() {
        let pool = AddressPool::new("10.10.0.0/24", 4).unwrap();
        assert_eq!(pool.span(), 251);
        for _ in 0..200 {
            let key = TunnelKeyPair::generate().public_key();
            let addr = pool.allocate(&key);
            assert_eq!(addr, pool.allocate(&key));
            assert!(pool.contains(addr));
            assert!(pool.is_allocatable(addr));
            let host = addr.octets()[3];
            assert!((4..255).contains(&host), "host {host}");
        }
    }

    #[test]
    fn test_pool_validation() {
        assert!(AddressPool::new("10.10.0.0", 4).is_err());
        assert!(AddressPool::new("10.10.0.0/31", 0).is_err());
        assert!(AddressPool::new("10.10.0.0/30", 3).is_err());
        let pool = AddressPool::new("10.10.0.77/24", 4).unwrap();
        assert_eq!(pool.to_string(), "10.10.0.0/24");
        assert!(!pool.contains("10.10.1.5".parse().unwrap()));
    }

    #[test]
    fn test_reserved_and_edge_addresses_are_not_allocatable() {
        let pool = AddressPool::new("10.10.0.0/24", 4).unwrap();
        for edge in ["10.10.0.0", "10.10.0.1", "10.10.0.3", "10.10.0.255", "10.10.1.9"] {
            assert!(!pool.is_allocatable(edge.parse().unwrap()), "{edge}");
        }
        assert!(pool.is_allocatable("10.10.0.4".parse().unwrap()));
        assert!(pool.is_allocatable("10.10.0.254".parse().unwrap()));
    }
}
