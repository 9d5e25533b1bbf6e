//! Command cores
//!
//! Each `*_core` function does the work of one CLI subcommand against a
//! [`Storage`] and returns a [`CommandResult`]: explanatory text plus a
//! JSON result. The binary only parses flags and prints.

use crate::btc::multisig::{build_script, derive_address, WitnessProgramAddress, MAX_MULTISIG_KEYS};
use crate::crypto::hd::{derive, DerivationPath, KeyPair};
use crate::crypto::seed::Seed;
use crate::error::ProofError;
use crate::params::ProtocolParams;
use crate::protocol::challenge::{bind_challenge, build_proof_transaction, Challenge, ProofTransaction};
use crate::protocol::records::{
    resolve_slots, unsigned_file, PartialSignatureRecord, PrivateKeyRecord, PublicKeyRecord,
    UnsignedProofRecord, PRIVKEYS_FILE, XPUBS_FILE,
};
use crate::protocol::signing::{assemble_witness, finalize, sign_with_key, PartialSignature, SignerSlots};
use crate::protocol::verify::{describe_witness, verify, verify_embedded};
use crate::storage::Storage;
use crate::CommandResult;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use bitcoin::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

fn read_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<T> {
    let bytes = storage.read(key)?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", key))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_string_pretty(value)?.into_bytes())
}

// ============================================================================
// gen
// ============================================================================

/// Where the prover's seed comes from
#[derive(Clone, Debug)]
pub enum SeedSource {
    Hex(String),
    Mnemonic { words: String, passphrase: String },
    Random,
}

impl SeedSource {
    fn load(&self) -> Result<Seed> {
        Ok(match self {
            SeedSource::Hex(hex) => Seed::from_hex(hex)?,
            SeedSource::Mnemonic { words, passphrase } => Seed::from_mnemonic(words, passphrase)?,
            SeedSource::Random => Seed::random(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub address: String,
    pub threshold: usize,
    pub master_xpub: String,
    pub witness_script_hex: String,
    pub witness_script_base64: String,
    pub keys: Vec<PublicKeyRecord>,
}

/// Fill `n` template indices in order, stepping past degenerate children
fn derive_pairs<F>(
    n: usize,
    path_template: &str,
    mut derive_at: F,
    out: &mut String,
) -> Result<Vec<KeyPair>>
where
    F: FnMut(&DerivationPath) -> crate::error::Result<KeyPair>,
{
    let mut pairs: Vec<KeyPair> = Vec::with_capacity(n);
    let mut index: u32 = 0;
    while pairs.len() < n {
        let path = DerivationPath::from_template(path_template, index)?;
        match derive_at(&path) {
            Ok(pair) => {
                out.push_str(&format!("  [{}] {}  {}\n", pairs.len(), path, pair.public_key()));
                pairs.push(pair);
            }
            Err(e) if e.is_retryable() => {
                log::warn!("{}", e);
                out.push_str(&format!("  {} is degenerate, moving to the next index\n", path));
            }
            Err(e) => return Err(e.into()),
        }
        index = index
            .checked_add(1)
            .context("Ran out of child indices for the path template")?;
    }
    Ok(pairs)
}

/// Derive n keys from one seed and publish the m-of-n address
pub fn generate_core(
    n: usize,
    m: usize,
    source: &SeedSource,
    path_template: &str,
    params: &ProtocolParams,
    storage: &dyn Storage,
) -> Result<CommandResult> {
    let mut out = String::new();

    out.push_str(&format!("Key Generation ({}-of-{})\n\n", m, n));
    out.push_str(RULE);

    if n == 0 || n > MAX_MULTISIG_KEYS || m == 0 || m > n {
        return Err(ProofError::InvalidThreshold { m, n }.into());
    }
    if n > 1 && !path_template.split('/').any(|s| s.starts_with('i')) {
        anyhow::bail!(
            "Path template {:?} has no 'i' placeholder; all {} keys would be identical",
            path_template,
            n
        );
    }

    let seed = source.load()?;
    match source {
        SeedSource::Hex(_) => out.push_str("Seed: imported from hex\n"),
        SeedSource::Mnemonic { .. } => out.push_str("Seed: BIP-39 mnemonic\n"),
        SeedSource::Random => out.push_str("Seed: generated randomly (32 bytes)\n"),
    }
    out.push_str(&format!("Path template: {}\n\n", path_template));

    let network = params.network();
    let pairs = derive_pairs(
        n,
        path_template,
        |path| derive(seed.as_bytes(), path, network),
        &mut out,
    )?;

    let keys: Vec<PublicKey> = pairs.iter().map(|p| p.public_key()).collect();
    let script = build_script(&keys, m)?;
    let address = derive_address(&script, network);
    log::info!("Derived {}-of-{} address {}", m, n, address);

    let public_records: Vec<PublicKeyRecord> = pairs.iter().map(PublicKeyRecord::from_key_pair).collect();
    let private_records: Vec<PrivateKeyRecord> =
        pairs.iter().map(PrivateKeyRecord::from_key_pair).collect();

    storage.write(XPUBS_FILE, &to_json(&public_records)?)?;
    storage.write_secret(PRIVKEYS_FILE, &to_json(&private_records)?)?;

    let master_xpub = pairs[0].root().to_string();
    let script_bytes = script.to_bytes();

    out.push('\n');
    out.push_str(RULE);
    out.push_str(&format!("Master xpub: {}\n", master_xpub));
    out.push_str(&format!("P2WSH Address: {}\n", address));
    out.push_str(&format!("Witness Script (hex): {}\n", hex::encode(&script_bytes)));
    out.push_str(&format!(
        "Witness Script (base64): {}\n",
        STANDARD.encode(&script_bytes)
    ));
    out.push_str(&format!("→ Public metadata saved to: {}\n", XPUBS_FILE));
    out.push_str(&format!("→ Private keys saved to:    {} (keep secret)\n", PRIVKEYS_FILE));

    let result = serde_json::to_string(&GenerateOutput {
        address: address.to_string(),
        threshold: m,
        master_xpub,
        witness_script_hex: hex::encode(&script_bytes),
        witness_script_base64: STANDARD.encode(&script_bytes),
        keys: public_records,
    })?;

    Ok(CommandResult { output: out, result })
}

// ============================================================================
// create-unsigned
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUnsignedOutput {
    pub txid: String,
    pub prevout: String,
    pub unsigned_tx_hex: String,
    pub files: Vec<String>,
}

/// Bind a challenge into an unsigned proof transaction, one record per signer slot
pub fn create_unsigned_core(
    address: &str,
    challenge: &str,
    m: usize,
    xpubs_file: &str,
    params: &ProtocolParams,
    storage: &dyn Storage,
) -> Result<CommandResult> {
    let mut out = String::new();
    out.push_str("Create Unsigned Proof\n\n");
    out.push_str(RULE);

    let records: Vec<PublicKeyRecord> = read_json(storage, xpubs_file)
        .with_context(|| format!("Failed to load {}. Did you run gen?", xpubs_file))?;
    let slots = resolve_slots(&records)?;
    let keys: Vec<PublicKey> = slots.iter().map(|(_, key)| *key).collect();

    let script = build_script(&keys, m)?;
    let derived = derive_address(&script, params.network());
    let declared = WitnessProgramAddress::parse(address, params.network())?;
    if derived != declared {
        return Err(ProofError::AddressMismatch {
            derived: derived.to_string(),
            declared: declared.to_string(),
        }
        .into());
    }
    out.push_str(&format!("Address verified: {}\n", declared));

    let challenge = Challenge::from_hex(challenge)?;
    let reference = bind_challenge(params, &challenge);
    let tx = build_proof_transaction(&reference, &declared, params);
    log::info!("Built proof transaction {} for challenge {}", tx.txid(), challenge);

    out.push_str(&format!("Challenge: {}\n", challenge));
    out.push_str(&format!("Synthetic prevout: {}\n", reference));
    out.push_str(&format!("Unsigned TX (hex): {}\n", tx.to_hex()));
    out.push_str(&format!(
        "Witness Script (hex): {}\n\n",
        hex::encode(script.to_bytes())
    ));

    let mut files = Vec::with_capacity(slots.len());
    for (i, (path, _)) in slots.iter().enumerate() {
        let record = UnsignedProofRecord::new(path.clone(), &tx, &script, params.nominal_amount());
        let name = unsigned_file(i);
        storage.write(&name, &to_json(&record)?)?;
        out.push_str(&format!("→ {} for {}\n", name, path));
        files.push(name);
    }

    let result = serde_json::to_string(&CreateUnsignedOutput {
        txid: tx.txid().to_string(),
        prevout: reference.to_string(),
        unsigned_tx_hex: tx.to_hex(),
        files,
    })?;

    Ok(CommandResult { output: out, result })
}

// ============================================================================
// sign
// ============================================================================

/// Sign every unsigned record whose path has a private key
///
/// Refuses any transaction that is not the proof skeleton for the record's
/// own script. With `challenge`, the spent prevout must also be the one bound
/// to it.
pub fn sign_core(
    unsigned_files: &[String],
    privkeys_file: &str,
    out_file: &str,
    challenge: Option<&str>,
    params: &ProtocolParams,
    storage: &dyn Storage,
) -> Result<CommandResult> {
    let mut out = String::new();
    out.push_str("Sign Proof\n\n");
    out.push_str(RULE);

    if unsigned_files.is_empty() {
        anyhow::bail!("No unsigned records given");
    }

    let mut proofs = Vec::with_capacity(unsigned_files.len());
    for file in unsigned_files {
        let record: UnsignedProofRecord = read_json(storage, file)?;
        let proof = record
            .decode()
            .with_context(|| format!("Invalid unsigned record {}", file))?;
        proofs.push(proof);
    }

    let first = &proofs[0];
    if first.amount != params.nominal_amount() {
        return Err(ProofError::InvalidRecord(format!(
            "input value {} differs from the nominal amount {}",
            first.amount,
            params.nominal_amount()
        ))
        .into());
    }
    if let Some(other) = proofs
        .iter()
        .find(|p| p.tx != first.tx || p.script != first.script || p.amount != first.amount)
    {
        return Err(ProofError::InvalidRecord(format!(
            "record for {} disagrees with record for {} on transaction, script or amount",
            other.path, first.path
        ))
        .into());
    }

    let destination = first.script.address(params.network());
    first
        .tx
        .check_pays_to(&destination, params)
        .with_context(|| format!("Refusing to sign: not a proof transaction for {}", destination))?;
    match challenge {
        Some(challenge) => {
            let challenge = Challenge::from_hex(challenge)?;
            first.tx.check_binding(params, &challenge)?;
            out.push_str(&format!("Challenge binding checked: {}\n", challenge));
        }
        None => log::warn!("Signing without checking the challenge binding"),
    }

    let private_records: Vec<PrivateKeyRecord> = read_json(storage, privkeys_file)?;
    let private_by_path: BTreeMap<&DerivationPath, &PrivateKeyRecord> =
        private_records.iter().map(|r| (&r.path, r)).collect();

    out.push_str(&format!("Transaction: {}\n", first.tx.txid()));
    out.push_str(&format!(
        "Script: {}-of-{}\n\n",
        first.script.threshold(),
        first.script.len()
    ));

    let secp = bitcoin::secp256k1::Secp256k1::signing_only();
    let mut signed = Vec::new();
    for proof in &proofs {
        let Some(private) = private_by_path.get(&proof.path) else {
            out.push_str(&format!("  {}: no private key, skipped\n", proof.path));
            continue;
        };
        let secret_key = private.secret_key(params.network())?;
        let public_key = PublicKey::new(secret_key.public_key(&secp));

        let partial = sign_with_key(&proof.tx, &proof.script, &proof.path, &secret_key, params)?;
        partial.verify(&proof.tx, &proof.script, &public_key, params)?;

        out.push_str(&format!("  {}: signed with {}\n", proof.path, public_key));
        signed.push(PartialSignatureRecord::new(
            &partial,
            &public_key,
            proof.tx.txid(),
        ));
    }

    if signed.is_empty() {
        anyhow::bail!("None of the given records has a matching private key");
    }
    log::info!("Produced {} partial signature(s)", signed.len());

    storage.write(out_file, &to_json(&signed)?)?;
    out.push_str(&format!("\n→ Partial signatures saved to: {}\n", out_file));

    let result = serde_json::to_string(&signed)?;
    Ok(CommandResult { output: out, result })
}

// ============================================================================
// assemble
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AssembleOutput {
    pub txid: String,
    pub signed_tx_hex: String,
}

/// Combine partial signatures from independent holders into the signed proof
pub fn assemble_core(
    unsigned_file: &str,
    partial_files: &[String],
    xpubs_file: &str,
    out_file: &str,
    params: &ProtocolParams,
    storage: &dyn Storage,
) -> Result<CommandResult> {
    let mut out = String::new();
    out.push_str("Assemble Witness\n\n");
    out.push_str(RULE);

    let unsigned: UnsignedProofRecord = read_json(storage, unsigned_file)?;
    let proof = unsigned.decode()?;
    let (tx, script) = (proof.tx, proof.script);

    let records: Vec<PublicKeyRecord> = read_json(storage, xpubs_file)?;
    let slots = SignerSlots::new(&script, resolve_slots(&records)?)?;

    let mut partials: Vec<PartialSignature> = Vec::new();
    for file in partial_files {
        let batch: Vec<PartialSignatureRecord> = read_json(storage, file)?;
        for record in batch {
            if record.txid != tx.txid().to_string() {
                anyhow::bail!(
                    "Signature for {} in {} signs transaction {}, expected {}",
                    record.path,
                    file,
                    record.txid,
                    tx.txid()
                );
            }
            let partial = record.to_partial()?;
            let key = slots
                .key_for(partial.path())
                .ok_or_else(|| ProofError::UnresolvedSigner(partial.path().clone()))?;
            if record.public_key()? != *key {
                return Err(ProofError::InvalidKey(format!(
                    "signature at {} names key {}, slot holds {}",
                    partial.path(),
                    record.pubkey,
                    key
                ))
                .into());
            }
            partial.verify(&tx, &script, key, params)?;

            if !slots.designated().any(|path| path == partial.path()) {
                log::info!("Dropping valid signature from non-designated slot {}", partial.path());
                out.push_str(&format!("  {}: not a designated slot, dropped\n", partial.path()));
                continue;
            }
            if !partials.contains(&partial) {
                log::debug!("Collected signature for {}", partial.path());
                partials.push(partial);
            }
        }
    }
    out.push_str(&format!(
        "Collected {} signature(s) for a {}-of-{} script\n",
        partials.len(),
        script.threshold(),
        script.len()
    ));

    let witness = assemble_witness(&partials, &script, &slots)?;
    let signed = finalize(&tx, &witness);
    log::info!("Assembled witness for {}", signed.txid());

    for (i, element) in describe_witness(&signed).iter().enumerate() {
        out.push_str(&format!("  [{}] {} (len={})\n", i, element, element.len() / 2));
    }

    let signed_hex = signed.to_hex();
    storage.write(out_file, signed_hex.as_bytes())?;
    out.push_str(&format!("\n→ Signed transaction saved to: {}\n", out_file));

    let result = serde_json::to_string(&AssembleOutput {
        txid: signed.txid().to_string(),
        signed_tx_hex: signed_hex,
    })?;
    Ok(CommandResult { output: out, result })
}

// ============================================================================
// verify
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyOutput {
    pub valid: bool,
    pub txid: String,
    pub address: String,
    pub threshold: usize,
    pub keys: Vec<String>,
}

/// Explicit key set for verification: (xpubs record file, threshold)
pub struct ExplicitKeys<'a> {
    pub xpubs_file: &'a str,
    pub threshold: usize,
}

/// Verify a signed proof; `tx` is either a file in storage or raw hex
pub fn verify_core(
    tx: &str,
    challenge: &str,
    address: &str,
    explicit: Option<ExplicitKeys<'_>>,
    params: &ProtocolParams,
    storage: &dyn Storage,
) -> Result<CommandResult> {
    let mut out = String::new();
    out.push_str("Verify Proof\n\n");
    out.push_str(RULE);

    let tx_hex = if storage.exists(tx) {
        String::from_utf8(storage.read(tx)?).with_context(|| format!("{} is not text", tx))?
    } else {
        tx.to_string()
    };
    let tx = ProofTransaction::from_hex(&tx_hex)?;
    let declared = WitnessProgramAddress::parse(address, params.network())?;
    let challenge = Challenge::from_hex(challenge)?;

    let mut stack = String::new();
    for (i, element) in describe_witness(&tx).iter().enumerate() {
        stack.push_str(&format!("  [{}] {} (len={})\n", i, element, element.len() / 2));
    }
    out.push_str("Witness stack:\n");
    out.push_str(&stack);
    out.push('\n');

    let checked = match explicit {
        Some(ExplicitKeys {
            xpubs_file,
            threshold,
        }) => {
            let records: Vec<PublicKeyRecord> = read_json(storage, xpubs_file)?;
            let keys: Vec<PublicKey> = resolve_slots(&records)?
                .into_iter()
                .map(|(_, key)| key)
                .collect();
            verify(&tx, &declared, &keys, threshold, &challenge, params)
                .and_then(|()| build_script(&keys, threshold))
        }
        None => verify_embedded(&tx, &declared, &challenge, params),
    };
    let script = checked
        .with_context(|| format!("Witness verification failed\nWitness stack:\n{}", stack))?;

    out.push_str(&format!(
        "✅ Witness verification succeeded: {}-of-{} at {}\n",
        script.threshold(),
        script.len(),
        declared
    ));

    let result = serde_json::to_string(&VerifyOutput {
        valid: true,
        txid: tx.txid().to_string(),
        address: declared.to_string(),
        threshold: script.threshold(),
        keys: script.keys().iter().map(|k| k.to_string()).collect(),
    })?;
    Ok(CommandResult { output: out, result })
}
