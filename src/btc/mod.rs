//! Bitcoin Integration
//!
//! - **multisig**: m-of-n threshold scripts and their P2WSH addresses

pub mod multisig;
