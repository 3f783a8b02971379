//! Canonical event types emitted by the project registry and dMRV manager
//! contracts, and the rows they are projected into.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

use crate::abi::{self, EventSchema, Param};
use crate::errors::Result;
use crate::rpc::RawLog;

/// All event kinds the indexer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `ProjectRegistered` on the project registry.
    ProjectRegistered,
    /// `ProjectStatusChanged` on the project registry.
    ProjectStatusChanged,
    /// `VerificationSubmitted` on the dMRV manager.
    VerificationSubmitted,
    /// `VerificationOutcome` on the dMRV manager.
    VerificationOutcome,
}

impl EventKind {
    /// Kinds ordered so that every event's parent entity is projected first.
    pub const DEPENDENCY_ORDER: [EventKind; 4] = [
        Self::ProjectRegistered,
        Self::ProjectStatusChanged,
        Self::VerificationSubmitted,
        Self::VerificationOutcome,
    ];

    pub fn schema(&self) -> &'static EventSchema {
        match self {
            Self::ProjectRegistered => &PROJECT_REGISTERED,
            Self::ProjectStatusChanged => &PROJECT_STATUS_CHANGED,
            Self::VerificationSubmitted => &VERIFICATION_SUBMITTED,
            Self::VerificationOutcome => &VERIFICATION_OUTCOME,
        }
    }

    pub fn contract(&self) -> Contract {
        match self {
            Self::ProjectRegistered | Self::ProjectStatusChanged => Contract::ProjectRegistry,
            Self::VerificationSubmitted | Self::VerificationOutcome => Contract::DmrvManager,
        }
    }

    /// Solidity event name.
    pub fn name(&self) -> &'static str {
        self.schema().name
    }
}

/// The contracts whose logs are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contract {
    ProjectRegistry,
    DmrvManager,
}

/// Deployed addresses of the indexed contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractSet {
    pub project_registry: Address,
    pub dmrv_manager: Address,
}

impl ContractSet {
    pub fn address(&self, contract: Contract) -> Address {
        match contract {
            Contract::ProjectRegistry => self.project_registry,
            Contract::DmrvManager => self.dmrv_manager,
        }
    }
}

const PROJECT_REGISTERED: EventSchema = EventSchema {
    name: "ProjectRegistered",
    params: &[
        Param::indexed("projectId", "bytes32"),
        Param::indexed("owner", "address"),
        Param::data("metaURI", "string"),
    ],
};

const PROJECT_STATUS_CHANGED: EventSchema = EventSchema {
    name: "ProjectStatusChanged",
    params: &[
        Param::indexed("projectId", "bytes32"),
        Param::data("oldStatus", "uint8"),
        Param::data("newStatus", "uint8"),
    ],
};

const VERIFICATION_SUBMITTED: EventSchema = EventSchema {
    name: "VerificationSubmitted",
    params: &[
        Param::indexed("verificationId", "bytes32"),
        Param::indexed("projectId", "bytes32"),
        Param::indexed("verifier", "address"),
        Param::data("claimCID", "string"),
    ],
};

const VERIFICATION_OUTCOME: EventSchema = EventSchema {
    name: "VerificationOutcome",
    params: &[
        Param::indexed("verificationId", "bytes32"),
        Param::data("success", "bool"),
        Param::data("data", "bytes"),
    ],
};

/// A fully decoded contract event, ready to be projected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
    Registered {
        project_id: B256,
        owner: Address,
        meta_uri: String,
    },
    StatusChanged {
        project_id: B256,
        old_status: u8,
        new_status: u8,
    },
    VerificationSubmitted {
        verification_id: B256,
        project_id: B256,
        verifier: Address,
        claim_cid: String,
    },
    VerificationOutcome {
        verification_id: B256,
        success: bool,
        data: Bytes,
    },
}

impl ProjectEvent {
    /// Decode `log` against the schema of `kind`.
    pub fn decode(kind: EventKind, log: &RawLog) -> Result<Self> {
        let args = abi::decode_log(log, kind.schema())?;
        let event = match kind {
            EventKind::ProjectRegistered => Self::Registered {
                project_id: args.word("projectId")?,
                owner: args.address("owner")?,
                meta_uri: args.string("metaURI")?,
            },
            EventKind::ProjectStatusChanged => Self::StatusChanged {
                project_id: args.word("projectId")?,
                old_status: args.uint8("oldStatus")?,
                new_status: args.uint8("newStatus")?,
            },
            EventKind::VerificationSubmitted => Self::VerificationSubmitted {
                verification_id: args.word("verificationId")?,
                project_id: args.word("projectId")?,
                verifier: args.address("verifier")?,
                claim_cid: args.string("claimCID")?,
            },
            EventKind::VerificationOutcome => Self::VerificationOutcome {
                verification_id: args.word("verificationId")?,
                success: args.boolean("success")?,
                data: args.bytes("data")?,
            },
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Registered { .. } => EventKind::ProjectRegistered,
            Self::StatusChanged { .. } => EventKind::ProjectStatusChanged,
            Self::VerificationSubmitted { .. } => EventKind::VerificationSubmitted,
            Self::VerificationOutcome { .. } => EventKind::VerificationOutcome,
        }
    }
}

/// Where a log came from on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogMeta {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: Option<B256>,
}

impl From<&RawLog> for LogMeta {
    fn from(log: &RawLog) -> Self {
        Self {
            block_number: log.block_number,
            log_index: log.log_index,
            tx_hash: log.transaction_hash,
        }
    }
}

/// Storage form of a 32-byte identifier: lowercase, `0x`-prefixed hex.
pub fn hex_id(word: &B256) -> String {
    format!("{word:#x}")
}

// ─────────────────────────────────────────────────────────
// Stored rows
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectRecord {
    pub id: String,
    pub owner: String,
    pub meta_uri: String,
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub status: String,
    pub created_block: i64,
    pub created_tx: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VerificationRecord {
    pub id: String,
    pub project_id: String,
    pub verifier: String,
    pub claim_cid: String,
    pub status: String,
    pub outcome_data: Option<String>,
    pub submitted_block: i64,
    pub submitted_tx: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditRecord {
    pub verification_id: String,
    pub project_id: String,
    pub amount: String,
    pub tx_hash: Option<String>,
    pub block_number: i64,
    pub created_at: i64,
}
