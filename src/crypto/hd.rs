//! BIP-32 HD Key Derivation
//!
//! Deterministic tree derivation from a seed to child key material. Each
//! segment of a path mixes the parent chain code with either the parent
//! private key (hardened) or the parent public key (normal) and the segment
//! index:
//!
//! ```text
//! IL || IR = HMAC-SHA512(chain_code, data || ser32(index))
//! child    = parent + IL (mod n)
//! ```
//!
//! Provers derive full key pairs from the seed. Verifiers only ever see the
//! neutered root ([`ExtendedPublicKey`]) plus a path, and can re-derive the
//! public key for any path without hardened segments.
//!
//! ## Usage
//!
//! ```ignore
//! let path: DerivationPath = "m/0/1".parse()?;
//! let pair = derive(seed.as_bytes(), &path, Network::Bitcoin)?;
//! let public = derive_public(pair.root(), &path)?;
//! assert_eq!(public, pair.public_key());
//! ```

use crate::error::{ProofError, Result};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::{base58, Network};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// First hardened child index (2^31)
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";
const MIN_SEED_LEN: usize = 16;
const MAX_SEED_LEN: usize = 64;

const ENCODED_LEN: usize = 78;
const XPRV_MAINNET: [u8; 4] = [0x04, 0x88, 0xAD, 0xE4];
const XPUB_MAINNET: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const XPRV_TESTNET: [u8; 4] = [0x04, 0x35, 0x83, 0x94];
const XPUB_TESTNET: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

// ============================================================================
// Derivation Paths
// ============================================================================

/// One path segment, stored as the raw BIP-32 index (hardened bit included)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildIndex(u32);

impl ChildIndex {
    pub fn normal(index: u32) -> Result<Self> {
        if index >= HARDENED_OFFSET {
            return Err(ProofError::malformed_path(
                &index.to_string(),
                "index out of range (must be < 2^31)",
            ));
        }
        Ok(Self(index))
    }

    pub fn hardened(index: u32) -> Result<Self> {
        if index >= HARDENED_OFFSET {
            return Err(ProofError::malformed_path(
                &format!("{}'", index),
                "index out of range (must be < 2^31)",
            ));
        }
        Ok(Self(index | HARDENED_OFFSET))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Index without the hardened bit
    pub fn index(self) -> u32 {
        self.0 & !HARDENED_OFFSET
    }

    pub fn is_hardened(self) -> bool {
        self.0 & HARDENED_OFFSET != 0
    }

    /// Next index with the same hardening.
    ///
    /// Used to retry after [`ProofError::InvalidChild`].
    pub fn successor(self) -> Option<Self> {
        let next = self.index().checked_add(1)?;
        if next >= HARDENED_OFFSET {
            return None;
        }
        Some(Self(next | (self.0 & HARDENED_OFFSET)))
    }
}

impl fmt::Display for ChildIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hardened() {
            write!(f, "{}'", self.index())
        } else {
            write!(f, "{}", self.index())
        }
    }
}

/// Non-empty sequence of child indices, e.g. `m/84'/0'/0'/0/3`
///
/// The textual form is `/`-separated decimal indices with an optional
/// leading `m` segment; `'` or `h` marks a hardened segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationPath(Vec<ChildIndex>);

impl DerivationPath {
    pub fn new(indices: Vec<ChildIndex>) -> Result<Self> {
        if indices.is_empty() {
            return Err(ProofError::malformed_path("m", "path has no segments"));
        }
        Ok(Self(indices))
    }

    /// Path of normal (non-hardened) indices
    pub fn from_indices(indices: &[u32]) -> Result<Self> {
        let indices = indices
            .iter()
            .map(|&i| ChildIndex::normal(i))
            .collect::<Result<Vec<_>>>()?;
        Self::new(indices)
    }

    /// Instantiate a template such as `m/84'/0'/0'/0/i` for key number `index`
    pub fn from_template(template: &str, index: u32) -> Result<Self> {
        let index = index.to_string();
        let expanded = template
            .split('/')
            .map(|segment| match segment {
                "i" => index.clone(),
                "i'" | "ih" | "iH" => format!("{}'", index),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        expanded.parse()
    }

    pub fn indices(&self) -> &[ChildIndex] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if the whole path can be followed from an extended public key
    pub fn is_public_derivable(&self) -> bool {
        self.0.iter().all(|index| !index.is_hardened())
    }
}

fn parse_segment(segment: &str, path: &str) -> Result<ChildIndex> {
    if segment.is_empty() {
        return Err(ProofError::malformed_path(path, "empty segment"));
    }

    let (digits, hardened) = match segment
        .strip_suffix('\'')
        .or_else(|| segment.strip_suffix('h'))
        .or_else(|| segment.strip_suffix('H'))
    {
        Some(digits) => (digits, true),
        None => (segment, false),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProofError::malformed_path(
            path,
            format!("non-numeric segment {:?}", segment),
        ));
    }

    let index: u32 = digits.parse().map_err(|_| {
        ProofError::malformed_path(path, format!("segment {:?} out of range", segment))
    })?;
    if index >= HARDENED_OFFSET {
        return Err(ProofError::malformed_path(
            path,
            format!("segment {:?} out of range (must be < 2^31)", segment),
        ));
    }

    Ok(if hardened {
        ChildIndex(index | HARDENED_OFFSET)
    } else {
        ChildIndex(index)
    })
}

impl FromStr for DerivationPath {
    type Err = ProofError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ProofError::malformed_path(s, "empty path"));
        }

        let mut segments = trimmed.split('/').peekable();
        if matches!(segments.peek(), Some(&"m") | Some(&"M")) {
            segments.next();
        }

        let indices = segments
            .map(|segment| parse_segment(segment, s))
            .collect::<Result<Vec<_>>>()?;
        if indices.is_empty() {
            return Err(ProofError::malformed_path(s, "path has no segments"));
        }

        Ok(Self(indices))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for index in &self.0 {
            write!(f, "/{}", index)?;
        }
        Ok(())
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Core Derivation Functions
// ============================================================================

/// HMAC-SHA512 over the concatenation of `parts`
fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let mut hmac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        hmac.update(part);
    }
    let mut output = [0u8; 64];
    output.copy_from_slice(&hmac.finalize().into_bytes());
    output
}

/// Split HMAC output into (IL, IR), wiping the buffer
fn split_hmac(mut output: [u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&output[..32]);
    ir.copy_from_slice(&output[32..]);
    output.zeroize();
    (il, ir)
}

fn fingerprint(public_key: &PublicKey) -> [u8; 4] {
    let hash = hash160::Hash::hash(&public_key.serialize()).to_byte_array();
    [hash[0], hash[1], hash[2], hash[3]]
}

fn next_depth(depth: u8) -> Result<u8> {
    depth
        .checked_add(1)
        .ok_or_else(|| ProofError::InvalidExtendedKey("maximum depth (255) exceeded".into()))
}

/// Extended private key: secret scalar plus chain code and tree position
#[derive(Clone)]
pub struct ExtendedPrivateKey {
    network: Network,
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_index: ChildIndex,
    chain_code: [u8; 32],
    secret_key: SecretKey,
}

impl ExtendedPrivateKey {
    /// Master key from seed: HMAC-SHA512("Bitcoin seed", seed)
    pub fn new_master(network: Network, seed: &[u8]) -> Result<Self> {
        if seed.len() < MIN_SEED_LEN || seed.len() > MAX_SEED_LEN {
            return Err(ProofError::InvalidSeed(format!(
                "seed must be {}-{} bytes, got {}",
                MIN_SEED_LEN,
                MAX_SEED_LEN,
                seed.len()
            )));
        }

        let (mut il, ir) = split_hmac(hmac_sha512(MASTER_HMAC_KEY, &[seed]));
        let secret_key = SecretKey::from_slice(&il);
        il.zeroize();
        let secret_key = secret_key.map_err(|_| {
            ProofError::InvalidSeed("seed yields an out-of-range master key".into())
        })?;

        Ok(Self {
            network,
            depth: 0,
            parent_fingerprint: [0; 4],
            child_index: ChildIndex(0),
            chain_code: ir,
            secret_key,
        })
    }

    /// Derive one level down (hardened or normal)
    pub fn derive_child<C: Signing>(&self, secp: &Secp256k1<C>, index: ChildIndex) -> Result<Self> {
        let depth = next_depth(self.depth)?;
        let parent_public = PublicKey::from_secret_key(secp, &self.secret_key);
        let index_bytes = index.raw().to_be_bytes();

        let output = if index.is_hardened() {
            let mut secret = self.secret_key.secret_bytes();
            let output = hmac_sha512(&self.chain_code, &[&[0u8][..], &secret[..], &index_bytes[..]]);
            secret.zeroize();
            output
        } else {
            hmac_sha512(
                &self.chain_code,
                &[&parent_public.serialize()[..], &index_bytes[..]],
            )
        };
        let (mut il, chain_code) = split_hmac(output);

        // IL >= n or a zero child key: the index is unusable
        let tweak = Scalar::from_be_bytes(il);
        il.zeroize();
        let secret_key = tweak
            .ok()
            .and_then(|tweak| self.secret_key.add_tweak(&tweak).ok())
            .ok_or(ProofError::InvalidChild { depth, index })?;

        Ok(Self {
            network: self.network,
            depth,
            parent_fingerprint: fingerprint(&parent_public),
            child_index: index,
            chain_code,
            secret_key,
        })
    }

    pub fn derive_path<C: Signing>(&self, secp: &Secp256k1<C>, path: &DerivationPath) -> Result<Self> {
        path.indices()
            .iter()
            .try_fold(self.clone(), |key, &index| key.derive_child(secp, index))
    }

    /// Strip the private material. One-way.
    pub fn neuter<C: Signing>(&self, secp: &Secp256k1<C>) -> ExtendedPublicKey {
        ExtendedPublicKey {
            network: self.network,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_index: self.child_index,
            chain_code: self.chain_code,
            public_key: PublicKey::from_secret_key(secp, &self.secret_key),
        }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// BIP-32 serialization (78 bytes)
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let version = match self.network {
            Network::Bitcoin => XPRV_MAINNET,
            _ => XPRV_TESTNET,
        };
        let mut secret = self.secret_key.secret_bytes();
        let mut key = [0u8; 33];
        key[1..].copy_from_slice(&secret);
        secret.zeroize();
        let encoded = encode_parts(
            version,
            self.depth,
            self.parent_fingerprint,
            self.child_index,
            &self.chain_code,
            &key,
        );
        key.zeroize();
        encoded
    }
}

impl fmt::Display for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut encoded = self.encode();
        let result = f.write_str(&base58::encode_check(&encoded));
        encoded.zeroize();
        result
    }
}

impl fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivateKey")
            .field("network", &self.network)
            .field("depth", &self.depth)
            .field("child_index", &self.child_index)
            .finish_non_exhaustive()
    }
}

impl Drop for ExtendedPrivateKey {
    fn drop(&mut self) {
        self.chain_code.zeroize();
    }
}

/// Extended public key (xpub): safe to hand to verifiers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedPublicKey {
    network: Network,
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_index: ChildIndex,
    chain_code: [u8; 32],
    public_key: PublicKey,
}

impl ExtendedPublicKey {
    /// Derive one normal child; hardened indices need the private key
    pub fn derive_child<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        index: ChildIndex,
    ) -> Result<Self> {
        if index.is_hardened() {
            return Err(ProofError::HardenedPublicDerivation(index));
        }
        let depth = next_depth(self.depth)?;

        let output = hmac_sha512(
            &self.chain_code,
            &[&self.public_key.serialize()[..], &index.raw().to_be_bytes()[..]],
        );
        let (il, chain_code) = split_hmac(output);

        let public_key = Scalar::from_be_bytes(il)
            .ok()
            .and_then(|tweak| self.public_key.add_exp_tweak(secp, &tweak).ok())
            .ok_or(ProofError::InvalidChild { depth, index })?;

        Ok(Self {
            network: self.network,
            depth,
            parent_fingerprint: fingerprint(&self.public_key),
            child_index: index,
            chain_code,
            public_key,
        })
    }

    pub fn derive_path<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        path: &DerivationPath,
    ) -> Result<Self> {
        path.indices()
            .iter()
            .try_fold(self.clone(), |key, &index| key.derive_child(secp, index))
    }

    pub fn public_key(&self) -> bitcoin::PublicKey {
        bitcoin::PublicKey::new(self.public_key)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        fingerprint(&self.public_key)
    }

    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let version = match self.network {
            Network::Bitcoin => XPUB_MAINNET,
            _ => XPUB_TESTNET,
        };
        encode_parts(
            version,
            self.depth,
            self.parent_fingerprint,
            self.child_index,
            &self.chain_code,
            &self.public_key.serialize(),
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != ENCODED_LEN {
            return Err(ProofError::InvalidExtendedKey(format!(
                "expected {} bytes, got {}",
                ENCODED_LEN,
                data.len()
            )));
        }

        let network = match [data[0], data[1], data[2], data[3]] {
            XPUB_MAINNET => Network::Bitcoin,
            XPUB_TESTNET => Network::Testnet,
            XPRV_MAINNET | XPRV_TESTNET => {
                return Err(ProofError::InvalidExtendedKey(
                    "expected an extended public key, got a private one".into(),
                ))
            }
            other => {
                return Err(ProofError::InvalidExtendedKey(format!(
                    "unknown version bytes {}",
                    hex::encode(other)
                )))
            }
        };

        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let mut child_bytes = [0u8; 4];
        child_bytes.copy_from_slice(&data[9..13]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let public_key = PublicKey::from_slice(&data[45..78])
            .map_err(|e| ProofError::InvalidExtendedKey(format!("bad public key: {}", e)))?;

        Ok(Self {
            network,
            depth: data[4],
            parent_fingerprint,
            child_index: ChildIndex(u32::from_be_bytes(child_bytes)),
            chain_code,
            public_key,
        })
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base58::encode_check(&self.encode()))
    }
}

impl FromStr for ExtendedPublicKey {
    type Err = ProofError;

    fn from_str(s: &str) -> Result<Self> {
        let data = base58::decode_check(s.trim())
            .map_err(|e| ProofError::InvalidExtendedKey(e.to_string()))?;
        Self::decode(&data)
    }
}

fn encode_parts(
    version: [u8; 4],
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_index: ChildIndex,
    chain_code: &[u8; 32],
    key: &[u8; 33],
) -> [u8; ENCODED_LEN] {
    let mut out = [0u8; ENCODED_LEN];
    out[0..4].copy_from_slice(&version);
    out[4] = depth;
    out[5..9].copy_from_slice(&parent_fingerprint);
    out[9..13].copy_from_slice(&child_index.raw().to_be_bytes());
    out[13..45].copy_from_slice(chain_code);
    out[45..78].copy_from_slice(key);
    out
}

// ============================================================================
// Key Pairs
// ============================================================================

/// Derived key material together with the path and root it came from
#[derive(Clone, Debug)]
pub struct KeyPair {
    path: DerivationPath,
    key: ExtendedPrivateKey,
    public_key: bitcoin::PublicKey,
    root: ExtendedPublicKey,
}

impl KeyPair {
    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn secret_key(&self) -> &SecretKey {
        self.key.secret_key()
    }

    /// Compressed public key
    pub fn public_key(&self) -> bitcoin::PublicKey {
        self.public_key
    }

    pub fn extended_key(&self) -> &ExtendedPrivateKey {
        &self.key
    }

    /// Neutered root this pair descends from
    pub fn root(&self) -> &ExtendedPublicKey {
        &self.root
    }

    /// Extended public key at this pair's own path
    pub fn neuter(&self) -> ExtendedPublicKey {
        let secp = Secp256k1::signing_only();
        self.key.neuter(&secp)
    }

    /// Compressed WIF encoding of the private key
    pub fn to_wif(&self) -> String {
        bitcoin::PrivateKey::new(*self.key.secret_key(), self.key.network()).to_wif()
    }
}

/// Derive the key pair at `path` from `seed`. Deterministic.
pub fn derive(seed: &[u8], path: &DerivationPath, network: Network) -> Result<KeyPair> {
    let secp = Secp256k1::new();
    let master = ExtendedPrivateKey::new_master(network, seed)?;
    let root = master.neuter(&secp);
    let key = master.derive_path(&secp, path)?;
    let public_key = bitcoin::PublicKey::new(PublicKey::from_secret_key(&secp, key.secret_key()));

    log::debug!("Derived key at {}: {}", path, public_key);

    Ok(KeyPair {
        path: path.clone(),
        key,
        public_key,
        root,
    })
}

/// Neutered master key for a seed
pub fn master_public_key(seed: &[u8], network: Network) -> Result<ExtendedPublicKey> {
    let secp = Secp256k1::signing_only();
    Ok(ExtendedPrivateKey::new_master(network, seed)?.neuter(&secp))
}

/// Public key at `path` below `root`, without private material
pub fn derive_public(root: &ExtendedPublicKey, path: &DerivationPath) -> Result<bitcoin::PublicKey> {
    let secp = Secp256k1::verification_only();
    Ok(root.derive_path(&secp, path)?.public_key())
}

// ============================================================================
// Tests
// ============================================================================
