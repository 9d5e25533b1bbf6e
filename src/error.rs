//! Error taxonomy for the key-possession proof protocol.

use crate::crypto::hd::{ChildIndex, DerivationPath};
use bitcoin::OutPoint;
use thiserror::Error;

/// Every failure names the invariant that broke.
#[derive(Error, Debug)]
pub enum ProofError {
    // Input validation
    #[error("Malformed derivation path {path:?}: {reason}")]
    MalformedPath { path: String, reason: String },
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),
    #[error("Invalid threshold: {m}-of-{n}")]
    InvalidThreshold { m: usize, n: usize },
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
    #[error("Invalid extended key: {0}")]
    InvalidExtendedKey(String),
    #[error("Invalid challenge: {0}")]
    InvalidChallenge(String),
    #[error("Invalid threshold script: {0}")]
    InvalidScript(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Invalid protocol parameters: {0}")]
    InvalidParams(String),

    // Derivation edge cases
    #[error("Child key at depth {depth}, index {index} is degenerate; retry with another index")]
    InvalidChild { depth: u8, index: ChildIndex },
    #[error("Hardened index {0} cannot be derived from a public key")]
    HardenedPublicDerivation(ChildIndex),

    // Matching failures
    #[error("No partial signature resolves signer slot {0}")]
    UnresolvedSigner(DerivationPath),
    #[error("Conflicting partial signatures for signer slot {0}")]
    DuplicateSigner(DerivationPath),
    #[error("Malformed witness: {0}")]
    MalformedWitness(String),
    #[error("Malformed proof transaction: {0}")]
    MalformedTransaction(String),

    // Verification failures
    #[error("Address mismatch: derived {derived}, declared {declared}")]
    AddressMismatch { derived: String, declared: String },
    #[error("Challenge mismatch: expected prevout {expected}, transaction spends {found}")]
    ChallengeMismatch { expected: OutPoint, found: OutPoint },
    #[error("Witness script does not match the threshold script")]
    ScriptMismatch,
    #[error("Script execution failed: {0}")]
    ScriptExecution(String),
}

impl ProofError {
    /// Only a degenerate child can be recovered from, by deriving at an adjusted index.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProofError::InvalidChild { .. })
    }

    pub(crate) fn malformed_path(path: &str, reason: impl Into<String>) -> Self {
        ProofError::MalformedPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = ProofError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_child_is_retryable() {
        let child = ProofError::InvalidChild {
            depth: 3,
            index: ChildIndex::from_raw(7),
        };
        assert!(child.is_retryable());
        assert!(!ProofError::ScriptMismatch.is_retryable());
        assert!(!ProofError::InvalidSeed("short".into()).is_retryable());
    }

    #[test]
    fn test_messages_name_the_failing_check() {
        let err = ProofError::InvalidThreshold { m: 3, n: 2 };
        assert_eq!(err.to_string(), "Invalid threshold: 3-of-2");

        let err = ProofError::malformed_path("m//1", "empty segment");
        assert!(err.to_string().contains("m//1"));
        assert!(err.to_string().contains("empty segment"));
    }
}
