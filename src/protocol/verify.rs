//! Proof verification
//!
//! Checks run in a fixed order and the first failure aborts:
//!
//! 1. the threshold script rebuilt from public data hashes to the declared address
//! 2. the transaction spends the prevout bound to the challenge
//! 3. the witness carries that exact script as its last element
//! 4. libbitcoinconsensus executes the spend cleanly

use crate::btc::multisig::{build_script, ThresholdScript, WitnessProgramAddress};
use crate::error::{ProofError, Result};
use crate::params::ProtocolParams;
use crate::protocol::challenge::{Challenge, ProofTransaction};
use bitcoin::{PublicKey, Script};

/// Verify a signed proof against an explicit ordered key set and threshold
pub fn verify(
    tx: &ProofTransaction,
    declared: &WitnessProgramAddress,
    keys: &[PublicKey],
    threshold: usize,
    challenge: &Challenge,
    params: &ProtocolParams,
) -> Result<()> {
    let script = build_script(keys, threshold)?;
    verify_script(tx, declared, &script, challenge, params)
}

/// Verify a signed proof using the threshold script revealed in its witness
pub fn verify_embedded(
    tx: &ProofTransaction,
    declared: &WitnessProgramAddress,
    challenge: &Challenge,
    params: &ProtocolParams,
) -> Result<ThresholdScript> {
    let revealed = tx
        .witness()
        .last()
        .ok_or_else(|| ProofError::MalformedWitness("transaction carries no witness".into()))?;
    let script = ThresholdScript::parse(Script::from_bytes(revealed))?;
    verify_script(tx, declared, &script, challenge, params)?;
    Ok(script)
}

fn verify_script(
    tx: &ProofTransaction,
    declared: &WitnessProgramAddress,
    script: &ThresholdScript,
    challenge: &Challenge,
    params: &ProtocolParams,
) -> Result<()> {
    // 1. Address agreement
    let derived = script.address(params.network());
    if &derived != declared {
        return Err(ProofError::AddressMismatch {
            derived: derived.to_string(),
            declared: declared.to_string(),
        });
    }

    // 2. Challenge binding
    tx.check_binding(params, challenge)?;

    // 3. Revealed script
    let revealed = tx
        .witness()
        .last()
        .ok_or_else(|| ProofError::MalformedWitness("transaction carries no witness".into()))?;
    if revealed != script.script().as_bytes() {
        return Err(ProofError::ScriptMismatch);
    }

    // 4. Full script execution
    declared
        .script_pubkey()
        .verify(0, params.nominal_amount(), &tx.to_bytes())
        .map_err(|e| ProofError::ScriptExecution(e.to_string()))?;

    log::info!(
        "Proof {} verified: {}-of-{} at {}",
        tx.txid(),
        script.threshold(),
        script.len(),
        declared
    );
    Ok(())
}

/// Hex dump of each witness element, for diagnostics
pub fn describe_witness(tx: &ProofTransaction) -> Vec<String> {
    tx.witness().iter().map(hex::encode).collect()
}
