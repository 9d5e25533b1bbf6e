//! Partial signatures and witness assembly
//!
//! Each key holder signs the BIP-143 digest of the proof transaction
//! independently. Signatures are collected in any order and placed into the
//! witness by derivation path, never by arrival order.
//!
//! Witness layout for an m-of-n script:
//!
//! ```text
//! [ <empty>, sig_1, ..., sig_m, <threshold script> ]
//! ```
//!
//! The leading empty element is the extra item OP_CHECKMULTISIG pops.

use crate::btc::multisig::ThresholdScript;
use crate::crypto::hd::{DerivationPath, KeyPair};
use crate::error::{ProofError, Result};
use crate::params::ProtocolParams;
use crate::protocol::challenge::ProofTransaction;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, Witness};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Signing
// ============================================================================

/// BIP-143 digest for input 0, committing to the whole transaction
pub fn signing_digest(
    tx: &ProofTransaction,
    script: &ThresholdScript,
    params: &ProtocolParams,
) -> Result<Message> {
    let mut cache = SighashCache::new(tx.as_transaction());
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            script.script(),
            params.nominal_amount(),
            EcdsaSighashType::All,
        )
        .map_err(|e| ProofError::MalformedTransaction(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// One key holder's signature, tagged with the path of the signing key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialSignature {
    path: DerivationPath,
    signature: ecdsa::Signature,
}

impl PartialSignature {
    /// Parse a DER signature with trailing sighash byte
    pub fn from_parts(path: DerivationPath, bytes: &[u8]) -> Result<Self> {
        let signature = ecdsa::Signature::from_slice(bytes)
            .map_err(|e| ProofError::InvalidSignature(e.to_string()))?;
        if signature.sighash_type != EcdsaSighashType::All {
            return Err(ProofError::InvalidSignature(format!(
                "sighash type {} does not commit to the whole transaction",
                signature.sighash_type
            )));
        }
        Ok(Self { path, signature })
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn signature(&self) -> &ecdsa::Signature {
        &self.signature
    }

    /// Witness encoding: DER signature followed by the sighash byte
    pub fn to_bytes(&self) -> Vec<u8> {
        self.signature.to_vec()
    }

    /// Check this signature against `key` before it goes into a witness
    pub fn verify(
        &self,
        tx: &ProofTransaction,
        script: &ThresholdScript,
        key: &PublicKey,
        params: &ProtocolParams,
    ) -> Result<()> {
        let message = signing_digest(tx, script, params)?;
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&message, &self.signature.signature, &key.inner)
            .map_err(|e| {
                ProofError::InvalidSignature(format!("signature for {} invalid: {}", self.path, e))
            })
    }
}

/// Sign the proof transaction with a derived key pair
pub fn sign(
    tx: &ProofTransaction,
    script: &ThresholdScript,
    key: &KeyPair,
    params: &ProtocolParams,
) -> Result<PartialSignature> {
    sign_with_key(tx, script, key.path(), key.secret_key(), params)
}

/// Sign with a bare secret key, e.g. one imported from WIF
pub fn sign_with_key(
    tx: &ProofTransaction,
    script: &ThresholdScript,
    path: &DerivationPath,
    secret_key: &SecretKey,
    params: &ProtocolParams,
) -> Result<PartialSignature> {
    let secp = Secp256k1::new();
    let public_key = PublicKey::new(secret_key.public_key(&secp));
    if script.position(&public_key).is_none() {
        return Err(ProofError::InvalidKey(format!(
            "key at {} ({}) is not part of the threshold script",
            path, public_key
        )));
    }
    tx.check_pays_to(&script.address(params.network()), params)?;

    let message = signing_digest(tx, script, params)?;
    let signature = ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, secret_key),
        sighash_type: EcdsaSighashType::All,
    };

    log::debug!("Signed proof {} with key at {}", tx.txid(), path);
    Ok(PartialSignature {
        path: path.clone(),
        signature,
    })
}

// ============================================================================
// Signer Slots
// ============================================================================

/// Script positions keyed by derivation path
#[derive(Clone, Debug)]
pub struct SignerSlots {
    threshold: usize,
    slots: Vec<(DerivationPath, PublicKey)>,
}

impl SignerSlots {
    /// `slots[i]` must name the path of the script's i-th key
    pub fn new(script: &ThresholdScript, slots: Vec<(DerivationPath, PublicKey)>) -> Result<Self> {
        if slots.len() != script.len() {
            return Err(ProofError::InvalidThreshold {
                m: script.threshold(),
                n: slots.len(),
            });
        }

        let mut seen = BTreeSet::new();
        for (position, ((path, key), expected)) in slots.iter().zip(script.keys()).enumerate() {
            if key != expected {
                return Err(ProofError::InvalidKey(format!(
                    "slot {} at {} holds {}, script expects {}",
                    position, path, key, expected
                )));
            }
            if !seen.insert(path.clone()) {
                return Err(ProofError::DuplicateSigner(path.clone()));
            }
        }

        Ok(Self {
            threshold: script.threshold(),
            slots,
        })
    }

    /// The first m slots, in script order
    pub fn designated(&self) -> impl Iterator<Item = &DerivationPath> {
        self.slots.iter().take(self.threshold).map(|(path, _)| path)
    }

    pub fn key_for(&self, path: &DerivationPath) -> Option<&PublicKey> {
        self.slots
            .iter()
            .find(|(slot, _)| slot == path)
            .map(|(_, key)| key)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ============================================================================
// Witness Assembly
// ============================================================================

/// Validated witness stack for an m-of-n threshold script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WitnessStack {
    elements: Vec<Vec<u8>>,
}

impl WitnessStack {
    pub fn new(elements: Vec<Vec<u8>>, threshold: usize) -> Result<Self> {
        if elements.len() != threshold + 2 {
            return Err(ProofError::MalformedWitness(format!(
                "expected {} elements for {} signatures, got {}",
                threshold + 2,
                threshold,
                elements.len()
            )));
        }
        if !elements[0].is_empty() {
            return Err(ProofError::MalformedWitness(
                "first element must be the empty placeholder".into(),
            ));
        }
        if elements[1..=threshold].iter().any(|sig| sig.is_empty()) {
            return Err(ProofError::MalformedWitness("empty signature element".into()));
        }
        if elements[threshold + 1].is_empty() {
            return Err(ProofError::MalformedWitness("missing witness script".into()));
        }
        Ok(Self { elements })
    }

    pub fn elements(&self) -> &[Vec<u8>] {
        &self.elements
    }

    pub fn signatures(&self) -> &[Vec<u8>] {
        &self.elements[1..self.elements.len() - 1]
    }

    pub fn witness_script(&self) -> &[u8] {
        &self.elements[self.elements.len() - 1]
    }

    pub fn to_witness(&self) -> Witness {
        Witness::from_slice(&self.elements)
    }
}

/// Place exactly m partial signatures into their designated slots
pub fn assemble_witness(
    partials: &[PartialSignature],
    script: &ThresholdScript,
    slots: &SignerSlots,
) -> Result<WitnessStack> {
    let threshold = script.threshold();
    if partials.len() != threshold {
        return Err(ProofError::MalformedWitness(format!(
            "need exactly {} signatures, got {}",
            threshold,
            partials.len()
        )));
    }

    let mut by_path: BTreeMap<&DerivationPath, &PartialSignature> = BTreeMap::new();
    for partial in partials {
        if let Some(existing) = by_path.insert(partial.path(), partial) {
            if existing != partial {
                return Err(ProofError::DuplicateSigner(partial.path().clone()));
            }
        }
    }

    let mut elements = Vec::with_capacity(threshold + 2);
    elements.push(Vec::new());
    for path in slots.designated() {
        let partial = by_path
            .get(path)
            .ok_or_else(|| ProofError::UnresolvedSigner(path.clone()))?;
        elements.push(partial.to_bytes());
    }
    elements.push(script.to_bytes());

    WitnessStack::new(elements, threshold)
}

/// Attach the witness to the proof transaction
pub fn finalize(tx: &ProofTransaction, witness: &WitnessStack) -> ProofTransaction {
    tx.with_witness(witness.to_witness())
}
