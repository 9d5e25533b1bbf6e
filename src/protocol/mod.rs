//! Key-Possession Proof Protocol
//!
//! - **challenge**: binds a verifier challenge to a synthetic prevout and builds the proof transaction
//! - **signing**: per-key signatures and path-keyed witness assembly
//! - **verify**: address, challenge, script and interpreter checks
//! - **records**: JSON records exchanged between participants

pub mod challenge;
pub mod records;
pub mod signing;
pub mod verify;
