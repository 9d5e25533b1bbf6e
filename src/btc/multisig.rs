//! Threshold Script Building
//!
//! An m-of-n bare multisig locking condition wrapped in a P2WSH witness
//! program:
//!
//! ```text
//! <m> <pk_1> ... <pk_n> <n> OP_CHECKMULTISIG
//! ```
//!
//! Key order is part of the script encoding. Keys are never sorted or
//! deduplicated, so prover and verifier must agree on the ordered set.

use crate::error::{ProofError, Result};
use bitcoin::address::AddressType;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Address, Network, PublicKey, Script, ScriptBuf};
use std::fmt;
use std::str::FromStr;

/// Upper bound on keys accepted by OP_CHECKMULTISIG
pub const MAX_MULTISIG_KEYS: usize = 20;

const COMPRESSED_KEY_LEN: usize = 33;

/// Ordered m-of-n key set and its encoded script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThresholdScript {
    threshold: usize,
    keys: Vec<PublicKey>,
    script: ScriptBuf,
}

impl ThresholdScript {
    /// Build `<m> <keys...> <n> OP_CHECKMULTISIG` in the given key order
    pub fn new(keys: Vec<PublicKey>, threshold: usize) -> Result<Self> {
        let n = keys.len();
        if threshold == 0 || threshold > n || n > MAX_MULTISIG_KEYS {
            return Err(ProofError::InvalidThreshold { m: threshold, n });
        }
        if let Some(key) = keys.iter().find(|key| !key.compressed) {
            return Err(ProofError::InvalidKey(format!(
                "key {} is not compressed",
                key
            )));
        }

        let mut builder = Builder::new().push_int(threshold as i64);
        for key in &keys {
            builder = builder.push_key(key);
        }
        let script = builder
            .push_int(n as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();

        Ok(Self {
            threshold,
            keys,
            script,
        })
    }

    /// Build from raw compressed key encodings
    pub fn from_key_bytes(keys: &[Vec<u8>], threshold: usize) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|bytes| parse_compressed_key(bytes))
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys, threshold)
    }

    /// Recover the key set and threshold from an encoded script.
    ///
    /// Only the canonical encoding produced by [`ThresholdScript::new`] is
    /// accepted.
    pub fn parse(script: &Script) -> Result<Self> {
        let instructions = script
            .instructions()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProofError::InvalidScript(e.to_string()))?;

        if instructions.len() < 4 {
            return Err(ProofError::InvalidScript(format!(
                "too few instructions ({})",
                instructions.len()
            )));
        }

        let last = instructions.len() - 1;
        match instructions[last] {
            Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
            _ => {
                return Err(ProofError::InvalidScript(
                    "script does not end with OP_CHECKMULTISIG".into(),
                ))
            }
        }

        let threshold = small_int(&instructions[0])
            .ok_or_else(|| ProofError::InvalidScript("missing threshold".into()))?;
        let n = small_int(&instructions[last - 1])
            .ok_or_else(|| ProofError::InvalidScript("missing key count".into()))?;

        let key_pushes = &instructions[1..last - 1];
        if key_pushes.len() != n {
            return Err(ProofError::InvalidScript(format!(
                "declares {} keys but pushes {}",
                n,
                key_pushes.len()
            )));
        }

        let keys = key_pushes
            .iter()
            .map(|instruction| match instruction {
                Instruction::PushBytes(bytes) => parse_compressed_key(bytes.as_bytes()),
                Instruction::Op(op) => Err(ProofError::InvalidScript(format!(
                    "expected a key push, found {}",
                    op
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let rebuilt = Self::new(keys, threshold)?;
        if rebuilt.script.as_bytes() != script.as_bytes() {
            return Err(ProofError::InvalidScript(
                "non-canonical script encoding".into(),
            ));
        }
        Ok(rebuilt)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn keys(&self) -> &[PublicKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.script.to_bytes()
    }

    /// Position of `key` in the script, if present
    pub fn position(&self, key: &PublicKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    pub fn address(&self, network: Network) -> WitnessProgramAddress {
        WitnessProgramAddress::from_script(self, network)
    }
}

/// Minimal small-integer push: OP_1..OP_16 or a one-byte push for 17..20
fn small_int(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let code = op.to_u8();
            // OP_PUSHNUM_1 (0x51) ..= OP_PUSHNUM_16 (0x60)
            (0x51..=0x60)
                .contains(&code)
                .then(|| (code - 0x50) as usize)
        }
        Instruction::PushBytes(bytes) => match bytes.as_bytes() {
            [value] if *value > 16 && *value < 0x80 => Some(*value as usize),
            _ => None,
        },
    }
}

fn parse_compressed_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != COMPRESSED_KEY_LEN {
        return Err(ProofError::InvalidKey(format!(
            "expected {} byte compressed key, got {} bytes",
            COMPRESSED_KEY_LEN,
            bytes.len()
        )));
    }
    PublicKey::from_slice(bytes).map_err(|e| ProofError::InvalidKey(e.to_string()))
}

/// P2WSH address committing to a threshold script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WitnessProgramAddress(Address);

impl WitnessProgramAddress {
    pub fn from_script(script: &ThresholdScript, network: Network) -> Self {
        Self(Address::p2wsh(script.script(), network))
    }

    /// Parse and require a P2WSH address on `network`
    pub fn parse(s: &str, network: Network) -> Result<Self> {
        let address = Address::from_str(s.trim())
            .map_err(|e| ProofError::InvalidAddress(e.to_string()))?
            .require_network(network)
            .map_err(|e| ProofError::InvalidAddress(e.to_string()))?;

        if address.address_type() != Some(AddressType::P2wsh) {
            return Err(ProofError::InvalidAddress(format!(
                "{} is not a P2WSH address",
                address
            )));
        }
        Ok(Self(address))
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.0.script_pubkey()
    }

    pub fn as_address(&self) -> &Address {
        &self.0
    }
}

impl fmt::Display for WitnessProgramAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Build the threshold script for an ordered key set
pub fn build_script(keys: &[PublicKey], threshold: usize) -> Result<ThresholdScript> {
    ThresholdScript::new(keys.to_vec(), threshold)
}

/// Witness-program address of a threshold script
pub fn derive_address(script: &ThresholdScript, network: Network) -> WitnessProgramAddress {
    let address = WitnessProgramAddress::from_script(script, network);
    log::debug!(
        "{}-of-{} script {} -> {}",
        script.threshold(),
        script.len(),
        hex::encode(script.script().as_bytes()),
        address
    );
    address
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn keys(count: u8) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (1..=count)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).unwrap();
                PublicKey::new(sk.public_key(&secp))
            })
            .collect()
    }

    #[test]
    fn test_script_layout() {
        let keys = keys(3);
        let script = build_script(&keys, 2).unwrap();
        let bytes = script.to_bytes();

        // OP_2, three 33-byte pushes, OP_3, OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 3 * 34 + 1 + 1);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[1], 33);
        assert_eq!(&bytes[2..35], &keys[0].to_bytes()[..]);
        assert_eq!(bytes[bytes.len() - 2], 0x53);
        assert_eq!(bytes[bytes.len() - 1], 0xae);
    }

    #[test]
    fn test_key_order_changes_script() {
        let keys = keys(3);
        let mut reversed = keys.clone();
        reversed.reverse();

        let a = build_script(&keys, 2).unwrap();
        let b = build_script(&reversed, 2).unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert_ne!(
            derive_address(&a, Network::Bitcoin),
            derive_address(&b, Network::Bitcoin)
        );
    }

    #[test]
    fn test_duplicates_are_kept() {
        let key = keys(1)[0];
        let script = build_script(&[key, key], 1).unwrap();
        assert_eq!(script.len(), 2);
    }

    #[test]
    fn test_threshold_bounds() {
        let keys = keys(3);
        assert!(matches!(
            build_script(&keys, 0),
            Err(ProofError::InvalidThreshold { m: 0, n: 3 })
        ));
        assert!(matches!(
            build_script(&keys, 4),
            Err(ProofError::InvalidThreshold { m: 4, n: 3 })
        ));
        assert!(matches!(
            build_script(&[], 1),
            Err(ProofError::InvalidThreshold { .. })
        ));
        assert!(build_script(&keys, 3).is_ok());
    }

    #[test]
    fn test_too_many_keys() {
        let many = keys(21);
        assert!(matches!(
            build_script(&many, 2),
            Err(ProofError::InvalidThreshold { m: 2, n: 21 })
        ));
        assert!(build_script(&many[..20], 2).is_ok());
    }

    #[test]
    fn test_uncompressed_key_rejected() {
        let mut keys = keys(2);
        keys[1].compressed = false;
        assert!(matches!(build_script(&keys, 1), Err(ProofError::InvalidKey(_))));
    }

    #[test]
    fn test_from_key_bytes() {
        let keys = keys(2);
        let raw: Vec<Vec<u8>> = keys.iter().map(|k| k.to_bytes()).collect();
        assert_eq!(
            ThresholdScript::from_key_bytes(&raw, 2).unwrap(),
            build_script(&keys, 2).unwrap()
        );

        let short = vec![vec![0x02; 32]];
        assert!(matches!(
            ThresholdScript::from_key_bytes(&short, 1),
            Err(ProofError::InvalidKey(_))
        ));
        // Bad prefix byte is not a point encoding
        let mut bad_prefix = raw[0].clone();
        bad_prefix[0] = 0x05;
        assert!(matches!(
            ThresholdScript::from_key_bytes(&[bad_prefix], 1),
            Err(ProofError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_parse_recovers_script() {
        for (n, m) in [(3u8, 2usize), (1, 1), (17, 16), (20, 20)] {
            let built = build_script(&keys(n), m).unwrap();
            let parsed = ThresholdScript::parse(built.script()).unwrap();
            assert_eq!(parsed, built);
        }
    }

    #[test]
    fn test_parse_rejects_other_scripts() {
        let key = keys(1)[0];
        let p2pk = Builder::new()
            .push_key(&key)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKSIG)
            .into_script();
        assert!(matches!(
            ThresholdScript::parse(&p2pk),
            Err(ProofError::InvalidScript(_))
        ));

        // Declared n disagrees with the pushed keys
        let lying = Builder::new()
            .push_int(1)
            .push_key(&key)
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();
        assert!(matches!(
            ThresholdScript::parse(&lying),
            Err(ProofError::InvalidScript(_))
        ));
    }

    #[test]
    fn test_address_is_p2wsh() {
        let script = build_script(&keys(3), 2).unwrap();
        let address = derive_address(&script, Network::Bitcoin);
        assert!(address.to_string().starts_with("bc1q"));
        assert_eq!(address.script_pubkey(), ScriptBuf::new_p2wsh(&script.script().wscript_hash()));

        let parsed = WitnessProgramAddress::parse(&address.to_string(), Network::Bitcoin).unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn test_address_network_and_type_enforced() {
        let script = build_script(&keys(3), 2).unwrap();
        let testnet = derive_address(&script, Network::Testnet);
        assert!(WitnessProgramAddress::parse(&testnet.to_string(), Network::Bitcoin).is_err());

        let p2wpkh = Address::p2wpkh(&bitcoin::CompressedPublicKey(keys(1)[0].inner), Network::Bitcoin);
        assert!(matches!(
            WitnessProgramAddress::parse(&p2wpkh.to_string(), Network::Bitcoin),
            Err(ProofError::InvalidAddress(_))
        ));
        assert!(WitnessProgramAddress::parse("not an address", Network::Bitcoin).is_err());
    }
}
