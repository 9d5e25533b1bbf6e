//! Protocol parameters
//!
//! Prover and verifier must agree on every field here, or the verifier
//! reconstructs a different prior reference and rejects the proof. The
//! defaults form protocol version 1.

use crate::error::{ProofError, Result};
use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PROTOCOL_VERSION_V1: u32 = 1;
pub const DOMAIN_PREFIX_V1: &str = "txid random prefix";
pub const NOMINAL_AMOUNT_SATS_V1: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    version: u32,
    domain_prefix: String,
    nominal_amount_sats: u64,
    network: Network,
}

impl ProtocolParams {
    pub fn v1() -> Self {
        Self {
            version: PROTOCOL_VERSION_V1,
            domain_prefix: DOMAIN_PREFIX_V1.to_string(),
            nominal_amount_sats: NOMINAL_AMOUNT_SATS_V1,
            network: Network::Bitcoin,
        }
    }

    /// Version 1 on a different network
    pub fn v1_on(network: Network) -> Self {
        Self {
            network,
            ..Self::v1()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)
            .map_err(|e| ProofError::InvalidParams(format!("bad parameter JSON: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ProofError::InvalidParams(format!("cannot read {}: {}", path.display(), e))
        })?;
        let params = Self::from_json(&json)?;
        log::info!(
            "Loaded protocol parameters v{} from {}",
            params.version,
            path.display()
        );
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION_V1 {
            return Err(ProofError::InvalidParams(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }
        if self.domain_prefix.is_empty() {
            return Err(ProofError::InvalidParams("empty domain prefix".into()));
        }
        if self.nominal_amount_sats == 0 {
            return Err(ProofError::InvalidParams(
                "nominal amount must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn domain_prefix(&self) -> &[u8] {
        self.domain_prefix.as_bytes()
    }

    pub fn nominal_amount(&self) -> Amount {
        Amount::from_sat(self.nominal_amount_sats)
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self::v1()
    }
}
