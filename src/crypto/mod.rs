//! Key Material
//!
//! - **hd**: BIP-32 hierarchical derivation, extended keys and paths
//! - **seed**: Seed sources (hex, BIP-39 mnemonic, random)

pub mod hd;
pub mod seed;
