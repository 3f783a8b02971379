//! Application configuration loaded from environment variables.

use std::num::NonZeroU64;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;

use crate::errors::{IndexerError, Result};
use crate::events::ContractSet;

/// Which parts of the indexer to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerMode {
    /// Backfill, then watch and serve the API.
    Full,
    /// Backfill once and exit.
    Backfill,
    /// Skip the backfill.
    Watch,
}

impl FromStr for IndexerMode {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "backfill" => Ok(Self::Backfill),
            "watch" => Ok(Self::Watch),
            other => Err(IndexerError::Config(format!(
                "Invalid INDEXER_MODE {other:?} (expected full, backfill or watch)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-RPC HTTP endpoint used for `eth_blockNumber` / `eth_getLogs`
    pub rpc_url: String,
    /// JSON-RPC WebSocket endpoint used for `eth_subscribe`
    pub ws_url: String,
    pub contracts: ContractSet,
    /// First block of the backfill
    pub start_block: u64,
    /// Maximum blocks per `eth_getLogs` request
    pub chunk_size: NonZeroU64,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    pub ipfs_gateway: String,
    /// Retries after the first failed RPC call
    pub rpc_max_retries: u32,
    pub rpc_timeout: Duration,
    pub mode: IndexerMode,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| IndexerError::Config(format!("{key} environment variable is required")))
        };
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let chunk_size: u64 = parse("CHUNK_SIZE", &optional("CHUNK_SIZE", "500"))?;
        Ok(Config {
            rpc_url: required("RPC_URL")?,
            ws_url: required("WS_URL")?,
            contracts: ContractSet {
                project_registry: parse("PROJECT_REGISTRY_ADDRESS", &required("PROJECT_REGISTRY_ADDRESS")?)?,
                dmrv_manager: parse("DMRV_MANAGER_ADDRESS", &required("DMRV_MANAGER_ADDRESS")?)?,
            },
            start_block: parse("START_BLOCK", &required("START_BLOCK")?)?,
            chunk_size: NonZeroU64::new(chunk_size)
                .ok_or_else(|| IndexerError::Config("CHUNK_SIZE must be at least 1".to_string()))?,
            database_url: optional("DATABASE_URL", "sqlite:./impact_index.db"),
            api_port: parse("API_PORT", &optional("API_PORT", "4000"))?,
            ipfs_gateway: optional("IPFS_GATEWAY", "https://ipfs.io/ipfs/"),
            rpc_max_retries: parse("RPC_MAX_RETRIES", &optional("RPC_MAX_RETRIES", "3"))?,
            rpc_timeout: Duration::from_secs(parse(
                "RPC_TIMEOUT_SECS",
                &optional("RPC_TIMEOUT_SECS", "30"),
            )?),
            mode: optional("INDEXER_MODE", "full").parse()?,
        })
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| IndexerError::Config(format!("Invalid {key}: {raw:?}")))
}
