//! Challenge binding and the proof transaction skeleton
//!
//! A 32-byte challenge is hashed under the protocol's domain prefix and the
//! digest used as the txid of a non-existent prior output:
//!
//! ```text
//! prevout = (SHA256(domain_prefix || challenge), 0)
//! ```
//!
//! Real txids are double-SHA256 of a serialized transaction, never a single
//! prefixed hash, so the proof transaction can never spend a real output.

use crate::btc::multisig::WitnessProgramAddress;
use crate::error::{ProofError, Result};
use crate::params::ProtocolParams;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::transaction::Version;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::fmt;
use std::str::FromStr;

pub const CHALLENGE_LEN: usize = 32;

/// Verifier-chosen 32-byte nonce
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Challenge([u8; CHALLENGE_LEN]);

impl Challenge {
    pub fn new(bytes: [u8; CHALLENGE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; CHALLENGE_LEN] = bytes.try_into().map_err(|_| {
            ProofError::InvalidChallenge(format!(
                "expected {} bytes, got {}",
                CHALLENGE_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ProofError::InvalidChallenge(format!("bad hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }
}

impl FromStr for Challenge {
    type Err = ProofError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Domain-separated stand-in for a real output reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyntheticPriorReference(OutPoint);

impl SyntheticPriorReference {
    pub fn outpoint(&self) -> OutPoint {
        self.0
    }

    pub fn txid(&self) -> Txid {
        self.0.txid
    }
}

impl fmt::Display for SyntheticPriorReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Bind a challenge to a synthetic prevout under `params`' domain prefix
pub fn bind_challenge(params: &ProtocolParams, challenge: &Challenge) -> SyntheticPriorReference {
    let mut engine = sha256::Hash::engine();
    engine.input(params.domain_prefix());
    engine.input(challenge.as_bytes());
    let digest = sha256::Hash::from_engine(engine);

    let txid = Txid::from_byte_array(digest.to_byte_array());
    SyntheticPriorReference(OutPoint::new(txid, 0))
}

// ============================================================================
// Proof Transaction
// ============================================================================

/// Single-input, single-output transaction spending a synthetic prevout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofTransaction {
    tx: Transaction,
}

impl ProofTransaction {
    /// Wrap a transaction, checking the one-in/one-out shape
    pub fn from_transaction(tx: Transaction) -> Result<Self> {
        if tx.input.len() != 1 {
            return Err(ProofError::MalformedTransaction(format!(
                "expected exactly 1 input, found {}",
                tx.input.len()
            )));
        }
        if tx.output.len() != 1 {
            return Err(ProofError::MalformedTransaction(format!(
                "expected exactly 1 output, found {}",
                tx.output.len()
            )));
        }
        Ok(Self { tx })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tx: Transaction =
            deserialize(bytes).map_err(|e| ProofError::MalformedTransaction(e.to_string()))?;
        Self::from_transaction(tx)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ProofError::MalformedTransaction(format!("bad hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Consensus serialization (witness included when present)
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(&self.tx)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn prior_reference(&self) -> OutPoint {
        self.tx.input[0].previous_output
    }

    pub fn witness(&self) -> &Witness {
        &self.tx.input[0].witness
    }

    pub fn is_signed(&self) -> bool {
        !self.witness().is_empty()
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn as_transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn into_transaction(self) -> Transaction {
        self.tx
    }

    /// Same transaction with the input witness replaced
    pub fn with_witness(&self, witness: Witness) -> Self {
        let mut tx = self.tx.clone();
        tx.input[0].witness = witness;
        Self { tx }
    }

    /// Reject anything but the proof skeleton paying the nominal amount to `destination`
    pub fn check_pays_to(
        &self,
        destination: &WitnessProgramAddress,
        params: &ProtocolParams,
    ) -> Result<()> {
        let (input, output) = (&self.tx.input[0], &self.tx.output[0]);
        if self.tx.version != Version::ONE
            || self.tx.lock_time != LockTime::ZERO
            || input.sequence != Sequence::MAX
            || !input.script_sig.is_empty()
        {
            return Err(ProofError::MalformedTransaction(
                "version, lock time, sequence or scriptSig differ from the proof skeleton".into(),
            ));
        }
        if output.value != params.nominal_amount() {
            return Err(ProofError::MalformedTransaction(format!(
                "output pays {}, expected the nominal {}",
                output.value,
                params.nominal_amount()
            )));
        }
        if output.script_pubkey != destination.script_pubkey() {
            return Err(ProofError::MalformedTransaction(format!(
                "output does not pay {}",
                destination
            )));
        }
        Ok(())
    }

    /// Check that the input spends the prevout bound to `challenge`
    pub fn check_binding(&self, params: &ProtocolParams, challenge: &Challenge) -> Result<()> {
        let expected = bind_challenge(params, challenge).outpoint();
        let found = self.prior_reference();
        if found != expected {
            return Err(ProofError::ChallengeMismatch { expected, found });
        }
        Ok(())
    }
}

/// Build the unsigned proof transaction paying the nominal amount to `destination`
pub fn build_proof_transaction(
    reference: &SyntheticPriorReference,
    destination: &WitnessProgramAddress,
    params: &ProtocolParams,
) -> ProofTransaction {
    let tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: reference.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: params.nominal_amount(),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    log::debug!(
        "Proof transaction {} spends synthetic prevout {}",
        tx.compute_txid(),
        reference
    );
    ProofTransaction { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btc::multisig::build_script;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{Network, PublicKey};

    fn incrementing_challenge() -> Challenge {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        Challenge::new(bytes)
    }

    fn destination() -> WitnessProgramAddress {
        let secp = Secp256k1::new();
        let keys: Vec<PublicKey> = (1..=3u8)
            .map(|i| PublicKey::new(SecretKey::from_slice(&[i; 32]).unwrap().public_key(&secp)))
            .collect();
        build_script(&keys, 2).unwrap().address(Network::Bitcoin)
    }

    #[test]
    fn test_binding_is_prefixed_sha256() {
        let params = ProtocolParams::v1();
        let challenge = incrementing_challenge();
        let reference = bind_challenge(&params, &challenge);

        let mut preimage = b"txid random prefix".to_vec();
        preimage.extend_from_slice(challenge.as_bytes());
        let expected = sha256::Hash::hash(&preimage).to_byte_array();

        assert_eq!(reference.txid().to_byte_array(), expected);
        assert_eq!(reference.outpoint().vout, 0);
    }

    #[test]
    fn test_binding_deterministic_and_distinct() {
        let params = ProtocolParams::v1();
        let a = bind_challenge(&params, &Challenge::new([1; 32]));
        let b = bind_challenge(&params, &Challenge::new([1; 32]));
        let c = bind_challenge(&params, &Challenge::new([2; 32]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_binding_differs_from_double_sha() {
        // A txid computed the usual way never lands on the synthetic reference
        let params = ProtocolParams::v1();
        let challenge = incrementing_challenge();
        let reference = bind_challenge(&params, &challenge);
        let double = bitcoin::hashes::sha256d::Hash::hash(challenge.as_bytes());
        assert_ne!(reference.txid().to_byte_array(), double.to_byte_array());
    }

    #[test]
    fn test_challenge_parsing() {
        let challenge = incrementing_challenge();
        let parsed: Challenge = challenge.to_string().parse().unwrap();
        assert_eq!(parsed, challenge);

        assert!(matches!(
            Challenge::from_hex("00ff"),
            Err(ProofError::InvalidChallenge(_))
        ));
        assert!(matches!(
            Challenge::from_hex("not hex"),
            Err(ProofError::InvalidChallenge(_))
        ));
    }

    #[test]
    fn test_proof_transaction_shape() {
        let params = ProtocolParams::v1();
        let reference = bind_challenge(&params, &incrementing_challenge());
        let destination = destination();
        let proof = build_proof_transaction(&reference, &destination, &params);
        let tx = proof.as_transaction();

        assert_eq!(tx.version, Version::ONE);
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence, Sequence::MAX);
        assert!(tx.input[0].script_sig.is_empty());
        assert_eq!(proof.prior_reference(), reference.outpoint());
        assert_eq!(tx.output[0].value, params.nominal_amount());
        assert_eq!(tx.output[0].script_pubkey, destination.script_pubkey());
        assert!(!proof.is_signed());

        let decoded = ProofTransaction::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let params = ProtocolParams::v1();
        let reference = bind_challenge(&params, &incrementing_challenge());
        let mut tx = build_proof_transaction(&reference, &destination(), &params).into_transaction();
        tx.output.push(tx.output[0].clone());
        assert!(matches!(
            ProofTransaction::from_transaction(tx),
            Err(ProofError::MalformedTransaction(_))
        ));
        assert!(ProofTransaction::from_hex("deadbeef").is_err());
    }

    #[test]
    fn test_pays_to_and_binding_checks() {
        let params = ProtocolParams::v1();
        let challenge = incrementing_challenge();
        let reference = bind_challenge(&params, &challenge);
        let destination = destination();
        let proof = build_proof_transaction(&reference, &destination, &params);

        proof.check_pays_to(&destination, &params).unwrap();
        proof.check_binding(&params, &challenge).unwrap();
        assert!(matches!(
            proof.check_binding(&params, &Challenge::new([0xAA; 32])),
            Err(ProofError::ChallengeMismatch { .. })
        ));

        // Real-looking prevout, foreign destination
        let mut tx = proof.clone().into_transaction();
        tx.input[0].previous_output = OutPoint::new(Txid::from_byte_array([0x77; 32]), 3);
        tx.output[0].script_pubkey =
            ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::from_byte_array([0x99; 32]));
        let redirected = ProofTransaction::from_transaction(tx).unwrap();
        assert!(matches!(
            redirected.check_pays_to(&destination, &params),
            Err(ProofError::MalformedTransaction(_))
        ));
        assert!(redirected.check_binding(&params, &challenge).is_err());

        let mut tx = proof.into_transaction();
        tx.output[0].value = bitcoin::Amount::from_sat(50_000);
        let inflated = ProofTransaction::from_transaction(tx).unwrap();
        assert!(matches!(
            inflated.check_pays_to(&destination, &params),
            Err(ProofError::MalformedTransaction(_))
        ));
    }
}
