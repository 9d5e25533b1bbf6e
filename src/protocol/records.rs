//! Interchange records
//!
//! Plain JSON exchanged between the proof initiator, key holders and the
//! verifier. Binary payloads inside records are standard base64 (transaction
//! and script) or hex (keys and signatures).

use crate::btc::multisig::ThresholdScript;
use crate::crypto::hd::{derive_public, DerivationPath, ExtendedPublicKey, KeyPair};
use crate::error::{ProofError, Result};
use crate::protocol::challenge::ProofTransaction;
use crate::protocol::signing::PartialSignature;
use base64::{engine::general_purpose::STANDARD, Engine};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, Network, NetworkKind, PrivateKey, PublicKey, Script, Txid};
use serde::{Deserialize, Serialize};

pub const XPUBS_FILE: &str = "xpubs.json";
pub const PRIVKEYS_FILE: &str = "privkeys.json";
pub const PARTIALS_FILE: &str = "partial-sigs.json";
pub const SIGNED_TX_FILE: &str = "signed-tx.hex";

/// File name of the unsigned record for signer slot `index`
pub fn unsigned_file(index: usize) -> String {
    format!("unsigned-tx{}.json", index)
}

// ============================================================================
// Key Records
// ============================================================================

/// Public material for one signer slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    /// Root extended public key the path is relative to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpub: Option<String>,
    pub path: DerivationPath,
    /// Compressed public key, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

impl PublicKeyRecord {
    pub fn from_key_pair(pair: &KeyPair) -> Self {
        Self {
            xpub: Some(pair.root().to_string()),
            path: pair.path().clone(),
            pubkey: Some(pair.public_key().to_string()),
        }
    }

    /// Public key for this slot.
    ///
    /// Derived from the xpub when the path allows it; a raw key, if also
    /// present, must agree.
    pub fn resolve(&self) -> Result<PublicKey> {
        let raw = self.pubkey.as_deref().map(parse_public_key).transpose()?;

        let derived = match &self.xpub {
            Some(xpub) if self.path.is_public_derivable() => {
                let root: ExtendedPublicKey = xpub.parse()?;
                Some(derive_public(&root, &self.path)?)
            }
            _ => None,
        };

        match (derived, raw) {
            (Some(derived), Some(raw)) if derived != raw => Err(ProofError::InvalidKey(format!(
                "record at {} lists {} but its xpub derives {}",
                self.path, raw, derived
            ))),
            (Some(key), _) | (None, Some(key)) => Ok(key),
            (None, None) => Err(ProofError::InvalidRecord(format!(
                "record at {} has no usable public key (hardened path needs a raw pubkey)",
                self.path
            ))),
        }
    }
}

fn parse_public_key(s: &str) -> Result<PublicKey> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| ProofError::InvalidKey(format!("bad pubkey hex: {}", e)))?;
    let key = PublicKey::from_slice(&bytes).map_err(|e| ProofError::InvalidKey(e.to_string()))?;
    if !key.compressed {
        return Err(ProofError::InvalidKey(format!("{} is not compressed", key)));
    }
    Ok(key)
}

/// Resolve a record list into (path, key) slots in record order
pub fn resolve_slots(records: &[PublicKeyRecord]) -> Result<Vec<(DerivationPath, PublicKey)>> {
    records
        .iter()
        .map(|record| Ok((record.path.clone(), record.resolve()?)))
        .collect()
}

/// Private material for one signer slot. Sensitive.
#[derive(Clone, Serialize, Deserialize)]
pub struct PrivateKeyRecord {
    pub xpriv: String,
    #[serde(rename = "derived_priv")]
    pub wif: String,
    pub path: DerivationPath,
}

impl PrivateKeyRecord {
    pub fn from_key_pair(pair: &KeyPair) -> Self {
        Self {
            xpriv: pair.extended_key().to_string(),
            wif: pair.to_wif(),
            path: pair.path().clone(),
        }
    }

    pub fn secret_key(&self, network: Network) -> Result<SecretKey> {
        let key = PrivateKey::from_wif(self.wif.trim())
            .map_err(|e| ProofError::InvalidKey(format!("bad WIF at {}: {}", self.path, e)))?;
        if key.network != NetworkKind::from(network) {
            return Err(ProofError::InvalidKey(format!(
                "WIF at {} is for another network",
                self.path
            )));
        }
        Ok(key.inner)
    }
}

impl std::fmt::Debug for PrivateKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyRecord")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unsigned Proof Record
// ============================================================================

/// Signing request routed to the holder of `path`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedProofRecord {
    pub path: DerivationPath,
    /// Serialized unsigned transaction, base64
    pub tx: String,
    /// Spent amount per input, in satoshis
    pub vin_values: Vec<u64>,
    /// Witness script per input, base64
    pub script_sigs: Vec<String>,
}

/// Decoded contents of an [`UnsignedProofRecord`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedProof {
    pub path: DerivationPath,
    pub tx: ProofTransaction,
    pub script: ThresholdScript,
    pub amount: Amount,
}

impl UnsignedProofRecord {
    pub fn new(
        path: DerivationPath,
        tx: &ProofTransaction,
        script: &ThresholdScript,
        amount: Amount,
    ) -> Self {
        Self {
            path,
            tx: STANDARD.encode(tx.to_bytes()),
            vin_values: vec![amount.to_sat()],
            script_sigs: vec![STANDARD.encode(script.to_bytes())],
        }
    }

    pub fn decode(&self) -> Result<UnsignedProof> {
        let tx_bytes = STANDARD
            .decode(self.tx.trim())
            .map_err(|e| ProofError::InvalidRecord(format!("bad tx base64: {}", e)))?;
        let tx = ProofTransaction::from_bytes(&tx_bytes)?;

        let &[amount] = self.vin_values.as_slice() else {
            return Err(ProofError::InvalidRecord(format!(
                "expected one input value, got {}",
                self.vin_values.len()
            )));
        };
        let [script] = self.script_sigs.as_slice() else {
            return Err(ProofError::InvalidRecord(format!(
                "expected one witness script, got {}",
                self.script_sigs.len()
            )));
        };
        let script_bytes = STANDARD
            .decode(script.trim())
            .map_err(|e| ProofError::InvalidRecord(format!("bad script base64: {}", e)))?;
        let script = ThresholdScript::parse(Script::from_bytes(&script_bytes))?;

        Ok(UnsignedProof {
            path: self.path.clone(),
            tx,
            script,
            amount: Amount::from_sat(amount),
        })
    }
}

// ============================================================================
// Partial Signature Record
// ============================================================================

/// One key holder's contribution, returned to the assembler
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatureRecord {
    pub path: DerivationPath,
    /// Signing public key, hex
    pub pubkey: String,
    /// DER signature plus sighash byte, hex
    pub signature: String,
    /// Txid of the signed proof transaction
    pub txid: String,
}

impl PartialSignatureRecord {
    pub fn new(partial: &PartialSignature, key: &PublicKey, txid: Txid) -> Self {
        Self {
            path: partial.path().clone(),
            pubkey: key.to_string(),
            signature: hex::encode(partial.to_bytes()),
            txid: txid.to_string(),
        }
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        parse_public_key(&self.pubkey)
    }

    pub fn to_partial(&self) -> Result<PartialSignature> {
        let bytes = hex::decode(self.signature.trim())
            .map_err(|e| ProofError::InvalidSignature(format!("bad signature hex: {}", e)))?;
        PartialSignature::from_parts(self.path.clone(), &bytes)
    }
}
