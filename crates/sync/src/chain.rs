//! Chain presets.
//!
//! Selected by name at startup and threaded by value; there is no
//! process-wide chain state. Unknown names fail before any transaction is
//! opened.

use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::SyncError;
use crate::keys::BlockHash;

/// Supported chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainName {
    Mainnet,
    Ropsten,
    Goerli,
    Rinkeby,
    Calaveras,
    Sokol,
}

impl ChainName {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Ropsten => "ropsten",
            Self::Goerli => "goerli",
            Self::Rinkeby => "rinkeby",
            Self::Calaveras => "calaveras",
            Self::Sokol => "sokol",
        }
    }
}

impl FromStr for ChainName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // An empty name selects mainnet, matching the CLI default.
            "" | "mainnet" => Ok(Self::Mainnet),
            "ropsten" => Ok(Self::Ropsten),
            "goerli" => Ok(Self::Goerli),
            "rinkeby" => Ok(Self::Rinkeby),
            "calaveras" => Ok(Self::Calaveras),
            "sokol" => Ok(Self::Sokol),
            other => Err(SyncError::UnknownChain { name: other.to_string() }),
        }
    }
}

impl std::fmt::Display for ChainName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain configuration: identity plus the genesis hash stages anchor to.
#[derive(Debug, Clone)]
pub struct ChainSpec {
    pub name: ChainName,
    pub chain_id: u64,
    pub genesis_hash: BlockHash,
}

impl ChainSpec {
    /// Preset for a named chain.
    pub fn preset(name: ChainName) -> Self {
        let chain_id = match name {
            ChainName::Mainnet => 1,
            ChainName::Ropsten => 3,
            ChainName::Goerli => 5,
            ChainName::Rinkeby => 4,
            ChainName::Calaveras => 123,
            ChainName::Sokol => 77,
        };
        Self { name, chain_id, genesis_hash: genesis_hash(name) }
    }
}

/// Deterministic genesis hash per chain.
fn genesis_hash(name: ChainName) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(b"strata-genesis-");
    hasher.update(name.as_str().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_chains() {
        for name in ["mainnet", "ropsten", "goerli", "rinkeby", "calaveras", "sokol"] {
            let parsed: ChainName = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn test_empty_name_is_mainnet() {
        assert_eq!("".parse::<ChainName>().unwrap(), ChainName::Mainnet);
    }

    #[test]
    fn test_unknown_chain_fails() {
        let err = "testnet9".parse::<ChainName>().unwrap_err();
        assert!(matches!(err, SyncError::UnknownChain { .. }));
    }

    #[test]
    fn test_presets_have_distinct_genesis() {
        let mainnet = ChainSpec::preset(ChainName::Mainnet);
        let goerli = ChainSpec::preset(ChainName::Goerli);
        assert_ne!(mainnet.genesis_hash, goerli.genesis_hash);
        assert_eq!(mainnet.chain_id, 1);
    }
}
