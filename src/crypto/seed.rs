//! Seed Material
//!
//! A prover's keys all descend from one seed. It can come from raw hex,
//! from a BIP-39 mnemonic (PBKDF2 with an optional passphrase), or be drawn
//! fresh from the OS RNG.
//!
//! ## Usage
//!
//! ```ignore
//! let seed = Seed::from_mnemonic("abandon abandon ... about", "")?;
//! let pair = hd::derive(seed.as_bytes(), &path, Network::Bitcoin)?;
//! ```

use crate::error::{ProofError, Result};
use bip39::{Language, Mnemonic};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

const MIN_SEED_LEN: usize = 16;
const MAX_SEED_LEN: usize = 64;

/// Length of a freshly generated seed
pub const RANDOM_SEED_LEN: usize = 32;

/// Secret seed bytes, wiped on drop
#[derive(Clone)]
pub struct Seed(Zeroizing<Vec<u8>>);

impl Seed {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_SEED_LEN || bytes.len() > MAX_SEED_LEN {
            return Err(ProofError::InvalidSeed(format!(
                "seed must be {}-{} bytes, got {}",
                MIN_SEED_LEN,
                MAX_SEED_LEN,
                bytes.len()
            )));
        }
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s.trim())
            .map_err(|e| ProofError::InvalidSeed(format!("bad hex: {}", e)))?;
        let seed = Self::from_bytes(&bytes);
        bytes.zeroize();
        seed
    }

    /// BIP-39 seed: PBKDF2-HMAC-SHA512 over the phrase and passphrase
    pub fn from_mnemonic(words: &str, passphrase: &str) -> Result<Self> {
        let mnemonic = parse_mnemonic(words)?;
        let mut seed = mnemonic.to_seed(passphrase);
        let result = Self::from_bytes(&seed);
        seed.zeroize();
        result
    }

    /// Fresh 32-byte seed from the OS RNG
    pub fn random() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; RANDOM_SEED_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({} bytes)", self.0.len())
    }
}

/// Parse mnemonic from space-separated words
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic> {
    Mnemonic::parse_in(Language::English, words)
        .map_err(|e| ProofError::InvalidSeed(format!("invalid mnemonic: {}", e)))
}

/// Validate mnemonic words (checksum and wordlist)
pub fn validate_mnemonic(words: &str) -> bool {
    Mnemonic::parse_in(Language::English, words).is_ok()
}
