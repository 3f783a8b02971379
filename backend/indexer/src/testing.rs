//! Log builders and stub collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{address, Address, B256, U256};
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::SqlitePool;

use crate::abi::EventSchema;
use crate::chunker::BlockRange;
use crate::errors::{IndexerError, Result};
use crate::events::{ContractSet, EventKind};
use crate::metadata::{MetadataResolver, ProjectMetadata};
use crate::projector::Projector;
use crate::rpc::{LogBatchStream, LogSource, RawLog};

pub const REGISTRY: Address = address!("1111111111111111111111111111111111111111");
pub const DMRV: Address = address!("2222222222222222222222222222222222222222");
pub const OWNER: Address = address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
pub const VERIFIER: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");

pub fn contracts() -> ContractSet {
    ContractSet {
        project_registry: REGISTRY,
        dmrv_manager: DMRV,
    }
}

pub fn id(n: u8) -> B256 {
    B256::with_last_byte(n)
}

fn log(kind: EventKind, topics: Vec<B256>, data: DynSolValue, block: u64) -> RawLog {
    let mut all = vec![kind.schema().topic0()];
    all.extend(topics);
    RawLog {
        address: contracts().address(kind.contract()),
        topics: all,
        data: data.abi_encode_params().into(),
        block_number: block,
        log_index: 0,
        transaction_hash: Some(B256::with_last_byte(0xee)),
        removed: false,
    }
}

pub fn registered(project: B256, meta_uri: &str, block: u64) -> RawLog {
    log(
        EventKind::ProjectRegistered,
        vec![project, OWNER.into_word()],
        DynSolValue::Tuple(vec![DynSolValue::String(meta_uri.to_string())]),
        block,
    )
}

pub fn status_changed(project: B256, old: u8, new: u8, block: u64) -> RawLog {
    log(
        EventKind::ProjectStatusChanged,
        vec![project],
        DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(old), 8),
            DynSolValue::Uint(U256::from(new), 8),
        ]),
        block,
    )
}

pub fn submitted(verification: B256, project: B256, block: u64) -> RawLog {
    log(
        EventKind::VerificationSubmitted,
        vec![verification, project, VERIFIER.into_word()],
        DynSolValue::Tuple(vec![DynSolValue::String("bafyclaim".to_string())]),
        block,
    )
}

pub fn outcome(verification: B256, success: bool, payload: Vec<u8>, block: u64) -> RawLog {
    log(
        EventKind::VerificationOutcome,
        vec![verification],
        DynSolValue::Tuple(vec![DynSolValue::Bool(success), DynSolValue::Bytes(payload)]),
        block,
    )
}

/// ABI encoding of `(uint256 amount)`.
pub fn amount_payload(amount: u64) -> Vec<u8> {
    DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(amount), 256)]).abi_encode_params()
}

/// Resolver that never touches the network.
pub struct StaticResolver;

#[async_trait]
impl MetadataResolver for StaticResolver {
    async fn resolve(&self, uri: &str) -> ProjectMetadata {
        ProjectMetadata {
            name: ProjectMetadata::placeholder_name(uri),
            description: None,
            image_url: None,
        }
    }
}

pub fn projector(pool: &SqlitePool) -> Projector {
    Projector::new(pool.clone(), Arc::new(StaticResolver))
}

/// Scripted subscription: the batches one `subscribe` call delivers before
/// its stream ends.
pub type Feed = Vec<Result<Vec<RawLog>>>;

/// In-memory log source.
///
/// `fetch_logs` serves `logs` filtered by address, selector and range, and
/// fails for any range listed in `failing`. Each `subscribe` call pops the
/// next scripted feed for the event; once they run out the stream stays
/// open and silent.
#[derive(Default)]
pub struct StubSource {
    pub head: u64,
    /// Makes `current_head` fail as an exhausted RPC call would.
    pub head_unavailable: bool,
    pub logs: Vec<RawLog>,
    pub failing: Vec<BlockRange>,
    pub fetched: Mutex<Vec<(&'static str, BlockRange)>>,
    pub subscribed: Mutex<Vec<&'static str>>,
    feeds: Mutex<HashMap<&'static str, VecDeque<Feed>>>,
}

impl StubSource {
    pub fn new(head: u64, logs: Vec<RawLog>) -> Self {
        Self {
            head,
            logs,
            ..Self::default()
        }
    }

    pub fn with_feed(self, kind: EventKind, feed: Feed) -> Self {
        self.feeds
            .lock()
            .unwrap()
            .entry(kind.name())
            .or_default()
            .push_back(feed);
        self
    }

    pub fn subscriptions(&self, kind: EventKind) -> usize {
        self.subscribed
            .lock()
            .unwrap()
            .iter()
            .filter(|name| **name == kind.name())
            .count()
    }
}

#[async_trait]
impl LogSource for StubSource {
    async fn current_head(&self) -> Result<u64> {
        if self.head_unavailable {
            return Err(IndexerError::TransientSource(
                "eth_blockNumber gave up after 4 attempts".to_string(),
            ));
        }
        Ok(self.head)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        schema: &EventSchema,
        range: BlockRange,
    ) -> Result<Vec<RawLog>> {
        self.fetched.lock().unwrap().push((schema.name, range));
        if self.failing.contains(&range) {
            return Err(IndexerError::TransientSource(format!("{range} unavailable")));
        }
        let topic0 = schema.topic0();
        Ok(self
            .logs
            .iter()
            .filter(|log| log.address == address && log.topics.first() == Some(&topic0))
            .filter(|log| (range.from..=range.to).contains(&log.block_number))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, _address: Address, schema: &EventSchema) -> Result<LogBatchStream> {
        self.subscribed.lock().unwrap().push(schema.name);
        let feed = self
            .feeds
            .lock()
            .unwrap()
            .get_mut(schema.name)
            .and_then(VecDeque::pop_front);
        Ok(match feed {
            Some(feed) => futures::stream::iter(feed).boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}
