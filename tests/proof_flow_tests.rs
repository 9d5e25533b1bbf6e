//! Integration tests for the proof protocol through the library API

use bitcoin::{Network, PublicKey, Witness};
use keyproof::btc::multisig::{build_script, derive_address, ThresholdScript, WitnessProgramAddress};
use keyproof::crypto::hd::{derive, derive_public, master_public_key, DerivationPath, KeyPair};
use keyproof::protocol::challenge::{bind_challenge, build_proof_transaction, Challenge, ProofTransaction};
use keyproof::protocol::signing::{
    assemble_witness, finalize, sign, PartialSignature, SignerSlots, WitnessStack,
};
use keyproof::protocol::verify::{verify, verify_embedded};
use keyproof::{ProofError, ProtocolParams};

const SEED: [u8; 32] = [0x01; 32];

struct Session {
    params: ProtocolParams,
    pairs: Vec<KeyPair>,
    keys: Vec<PublicKey>,
    script: ThresholdScript,
    address: WitnessProgramAddress,
    slots: SignerSlots,
    challenge: Challenge,
    tx: ProofTransaction,
}

fn incrementing_challenge() -> Challenge {
    let mut bytes = [0u8; 32];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = i as u8;
    }
    Challenge::new(bytes)
}

/// 2-of-3 over paths m/0, m/1, m/2 with challenge 0x00..1f
fn session() -> Session {
    let params = ProtocolParams::v1();
    let pairs: Vec<KeyPair> = (0..3)
        .map(|i| {
            let path = DerivationPath::from_indices(&[i]).unwrap();
            derive(&SEED, &path, params.network()).unwrap()
        })
        .collect();
    let keys: Vec<PublicKey> = pairs.iter().map(|p| p.public_key()).collect();
    let script = build_script(&keys, 2).unwrap();
    let address = derive_address(&script, params.network());
    let slots = SignerSlots::new(
        &script,
        pairs.iter().map(|p| (p.path().clone(), p.public_key())).collect(),
    )
    .unwrap();
    let challenge = incrementing_challenge();
    let tx = build_proof_transaction(&bind_challenge(&params, &challenge), &address, &params);

    Session {
        params,
        pairs,
        keys,
        script,
        address,
        slots,
        challenge,
        tx,
    }
}

fn signatures(s: &Session, signers: &[usize]) -> Vec<PartialSignature> {
    signers
        .iter()
        .map(|&i| sign(&s.tx, &s.script, &s.pairs[i], &s.params).unwrap())
        .collect()
}

fn signed_proof(s: &Session) -> ProofTransaction {
    let partials = signatures(s, &[0, 1]);
    let witness = assemble_witness(&partials, &s.script, &s.slots).unwrap();
    finalize(&s.tx, &witness)
}

/// Scenario A: sign with m/0 and m/1, verify succeeds
#[test]
fn test_two_of_three_proof_verifies() {
    let s = session();
    let signed = signed_proof(&s);

    verify(&signed, &s.address, &s.keys, 2, &s.challenge, &s.params).unwrap();

    // Survives a hex round trip, as exchanged between parties
    let reparsed = ProofTransaction::from_hex(&signed.to_hex()).unwrap();
    verify(&reparsed, &s.address, &s.keys, 2, &s.challenge, &s.params).unwrap();
}

/// Scenario B: one signature for a 2-of-3 never reaches the interpreter
#[test]
fn test_single_signature_rejected_at_assembly() {
    let s = session();
    let partials = signatures(&s, &[0]);

    let result = assemble_witness(&partials, &s.script, &s.slots);
    assert!(matches!(result, Err(ProofError::MalformedWitness(_))));

    // A hand-built short stack is rejected the same way
    let short = vec![Vec::new(), partials[0].to_bytes(), s.script.to_bytes()];
    assert!(matches!(
        WitnessStack::new(short, 2),
        Err(ProofError::MalformedWitness(_))
    ));
}

/// Scenario C: a different challenge fails the binding check
#[test]
fn test_different_challenge_rejected() {
    let s = session();
    let signed = signed_proof(&s);
    let other = Challenge::new([0xAA; 32]);

    match verify(&signed, &s.address, &s.keys, 2, &other, &s.params) {
        Err(ProofError::ChallengeMismatch { expected, found }) => {
            assert_eq!(found, signed.prior_reference());
            assert_eq!(expected, bind_challenge(&s.params, &other).outpoint());
        }
        other => panic!("expected ChallengeMismatch, got {:?}", other),
    }
}

/// Flipping one signature bit fails only at script execution
#[test]
fn test_tampered_signature_fails_execution() {
    let s = session();
    let signed = signed_proof(&s);

    let mut elements: Vec<Vec<u8>> = signed.witness().iter().map(|e| e.to_vec()).collect();
    elements[1][10] ^= 0x01;
    let tampered = signed.with_witness(Witness::from_slice(&elements));

    assert!(matches!(
        verify(&tampered, &s.address, &s.keys, 2, &s.challenge, &s.params),
        Err(ProofError::ScriptExecution(_))
    ));
}

/// Signatures arriving out of order land in script order
#[test]
fn test_out_of_order_collection() {
    let s = session();
    let mut partials = signatures(&s, &[0, 1]);
    partials.reverse();

    let witness = assemble_witness(&partials, &s.script, &s.slots).unwrap();
    let signed = finalize(&s.tx, &witness);
    verify(&signed, &s.address, &s.keys, 2, &s.challenge, &s.params).unwrap();
    assert_eq!(signed, signed_proof(&s));
}

/// Swapping signatures between slots breaks CHECKMULTISIG ordering
#[test]
fn test_swapped_signature_order_fails_execution() {
    let s = session();
    let signed = signed_proof(&s);

    let mut elements: Vec<Vec<u8>> = signed.witness().iter().map(|e| e.to_vec()).collect();
    elements.swap(1, 2);
    let swapped = signed.with_witness(Witness::from_slice(&elements));

    assert!(matches!(
        verify(&swapped, &s.address, &s.keys, 2, &s.challenge, &s.params),
        Err(ProofError::ScriptExecution(_))
    ));
}

/// Non-empty placeholder violates NULLDUMMY
#[test]
fn test_non_empty_placeholder_fails_execution() {
    let s = session();
    let signed = signed_proof(&s);

    let mut elements: Vec<Vec<u8>> = signed.witness().iter().map(|e| e.to_vec()).collect();
    elements[0] = vec![0x01];
    let dummy = signed.with_witness(Witness::from_slice(&elements));

    assert!(matches!(
        verify(&dummy, &s.address, &s.keys, 2, &s.challenge, &s.params),
        Err(ProofError::ScriptExecution(_))
    ));
}

/// Verifier rebuilds the address from the xpub alone
#[test]
fn test_address_agreement_from_public_data() {
    let s = session();
    let root = master_public_key(&SEED, s.params.network()).unwrap();

    let public_keys: Vec<PublicKey> = s
        .pairs
        .iter()
        .map(|p| derive_public(&root, p.path()).unwrap())
        .collect();
    assert_eq!(public_keys, s.keys);

    let verifier_address = derive_address(&build_script(&public_keys, 2).unwrap(), Network::Bitcoin);
    assert_eq!(verifier_address, s.address);
}

#[test]
fn test_derivation_is_deterministic() {
    let path: DerivationPath = "m/84'/0'/0'/0/7".parse().unwrap();
    let a = derive(&SEED, &path, Network::Bitcoin).unwrap();
    let b = derive(&SEED, &path, Network::Bitcoin).unwrap();
    assert_eq!(a.public_key(), b.public_key());
    assert_eq!(a.to_wif(), b.to_wif());
}

#[test]
fn test_non_designated_signer_unresolved() {
    let s = session();
    let partials = signatures(&s, &[0, 2]);

    match assemble_witness(&partials, &s.script, &s.slots) {
        Err(ProofError::UnresolvedSigner(path)) => assert_eq!(path.to_string(), "m/1"),
        other => panic!("expected UnresolvedSigner, got {:?}", other),
    }
}

#[test]
fn test_embedded_script_verification() {
    let s = session();
    let signed = signed_proof(&s);

    let script = verify_embedded(&signed, &s.address, &s.challenge, &s.params).unwrap();
    assert_eq!(script, s.script);

    // Another address cannot borrow this proof
    let other_keys = vec![s.keys[2], s.keys[1], s.keys[0]];
    let other = derive_address(&build_script(&other_keys, 2).unwrap(), Network::Bitcoin);
    assert!(matches!(
        verify_embedded(&signed, &other, &s.challenge, &s.params),
        Err(ProofError::AddressMismatch { .. })
    ));
}

#[test]
fn test_script_substitution_detected() {
    let s = session();
    let signed = signed_proof(&s);

    // Keep signatures, reveal a different (valid) script
    let mut elements: Vec<Vec<u8>> = signed.witness().iter().map(|e| e.to_vec()).collect();
    let last = elements.len() - 1;
    elements[last] = build_script(&s.keys, 1).unwrap().to_bytes();
    let substituted = signed.with_witness(Witness::from_slice(&elements));

    assert!(matches!(
        verify(&substituted, &s.address, &s.keys, 2, &s.challenge, &s.params),
        Err(ProofError::ScriptMismatch)
    ));
}

#[test]
fn test_testnet_params_produce_testnet_proof() {
    let params = ProtocolParams::v1_on(Network::Testnet);
    let pairs: Vec<KeyPair> = (0..2)
        .map(|i| derive(&SEED, &DerivationPath::from_indices(&[i]).unwrap(), Network::Testnet).unwrap())
        .collect();
    let keys: Vec<PublicKey> = pairs.iter().map(|p| p.public_key()).collect();
    let script = build_script(&keys, 1).unwrap();
    let address = derive_address(&script, params.network());
    assert!(address.to_string().starts_with("tb1q"));

    let slots = SignerSlots::new(
        &script,
        pairs.iter().map(|p| (p.path().clone(), p.public_key())).collect(),
    )
    .unwrap();
    let challenge = Challenge::new([7; 32]);
    let tx = build_proof_transaction(&bind_challenge(&params, &challenge), &address, &params);
    let partial = sign(&tx, &script, &pairs[0], &params).unwrap();
    let signed = finalize(&tx, &assemble_witness(&[partial], &script, &slots).unwrap());

    verify(&signed, &address, &keys, 1, &challenge, &params).unwrap();
}
