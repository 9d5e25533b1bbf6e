//! Key-possession proofs for m-of-n P2WSH addresses.
//!
//! A prover shows control of a threshold address by signing a transaction
//! that spends a synthetic, challenge-bound prevout. The transaction can
//! never be mined, but the verifier runs it through the consensus script
//! interpreter exactly as if it could.

pub mod btc;
pub mod commands;
pub mod crypto;
pub mod error;
pub mod params;
pub mod protocol;
pub mod storage;

pub use error::ProofError;
pub use params::ProtocolParams;

/// Result from a command, separating explanatory output from the JSON result
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Human-readable progress and explanations
    pub output: String,
    /// Clean JSON result for copy-pasting
    pub result: String,
}
