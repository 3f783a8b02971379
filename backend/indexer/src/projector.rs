//! Applies decoded contract events to the projection tables.
//!
//! Every write is keyed by an on-chain identifier and is a no-op when
//! repeated, so backfill passes and live subscriptions may deliver the same
//! log any number of times. Parents must be projected before children; a
//! child whose parent is missing is reported and dropped, never retried.

use std::sync::Arc;

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, Bytes, B256};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::abi;
use crate::db::{self, NewCredit, NewProject, NewVerification};
use crate::errors::{IndexerError, Result};
use crate::events::{hex_id, EventKind, LogMeta, ProjectEvent};
use crate::metadata::MetadataResolver;
use crate::rpc::RawLog;
use crate::status::{ProjectStatus, VerificationStatus};

/// What applying one log did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Created,
    Updated,
    /// Replay of something already applied; nothing written.
    Unchanged,
    /// Log was flagged `removed` by the source.
    Ignored,
    /// Rejected by an event-level error, which has been logged.
    Dropped,
}

pub struct Projector {
    pool: SqlitePool,
    resolver: Arc<dyn MetadataResolver>,
}

impl Projector {
    pub fn new(pool: SqlitePool, resolver: Arc<dyn MetadataResolver>) -> Self {
        Self { pool, resolver }
    }

    /// Decode and apply one log, isolating and reporting any failure.
    pub async fn handle_log(&self, kind: EventKind, log: &RawLog) -> Projection {
        match self.project_log(kind, log).await {
            Ok(projection) => projection,
            Err(e) => {
                report(kind, log, &e);
                Projection::Dropped
            }
        }
    }

    pub async fn project_log(&self, kind: EventKind, log: &RawLog) -> Result<Projection> {
        if log.removed {
            debug!(event = kind.name(), block = log.block_number, "Skipping removed log");
            return Ok(Projection::Ignored);
        }
        let event = ProjectEvent::decode(kind, log)?;
        self.apply(&event, &LogMeta::from(log)).await
    }

    pub async fn apply(&self, event: &ProjectEvent, meta: &LogMeta) -> Result<Projection> {
        debug!(
            event = event.kind().name(),
            block = meta.block_number,
            log_index = meta.log_index,
            "Applying event"
        );
        match event {
            ProjectEvent::Registered {
                project_id,
                owner,
                meta_uri,
            } => self.register_project(project_id, owner, meta_uri, meta).await,
            ProjectEvent::StatusChanged {
                project_id,
                old_status,
                new_status,
            } => self.change_status(project_id, *old_status, *new_status).await,
            ProjectEvent::VerificationSubmitted {
                verification_id,
                project_id,
                verifier,
                claim_cid,
            } => {
                self.submit_verification(verification_id, project_id, verifier, claim_cid, meta)
                    .await
            }
            ProjectEvent::VerificationOutcome {
                verification_id,
                success,
                data,
            } => {
                self.resolve_verification(verification_id, *success, data, meta)
                    .await
            }
        }
    }

    async fn register_project(
        &self,
        project_id: &B256,
        owner: &Address,
        meta_uri: &str,
        meta: &LogMeta,
    ) -> Result<Projection> {
        let id = hex_id(project_id);
        if db::project_exists(&self.pool, &id).await? {
            debug!(project = %id, "Project already indexed");
            return Ok(Projection::Unchanged);
        }

        let metadata = self.resolver.resolve(meta_uri).await;
        let owner = owner.to_checksum(None);
        let tx_hash = meta.tx_hash.as_ref().map(hex_id);
        let created = db::insert_project(
            &self.pool,
            &NewProject {
                id: &id,
                owner: &owner,
                meta_uri,
                name: &metadata.name,
                description: metadata.description.as_deref(),
                image_url: metadata.image_url.as_deref(),
                block_number: block_i64(meta.block_number),
                tx_hash: tx_hash.as_deref(),
            },
        )
        .await?;

        if !created {
            return Ok(Projection::Unchanged);
        }
        info!(project = %id, name = %metadata.name, "Indexed project");
        Ok(Projection::Created)
    }

    async fn change_status(&self, project_id: &B256, old_code: u8, code: u8) -> Result<Projection> {
        let status = ProjectStatus::from_code(code).ok_or(IndexerError::UnmappedStatusCode(code))?;
        let id = hex_id(project_id);

        if db::update_project_status(&self.pool, &id, status).await? {
            info!(project = %id, from = old_code, status = status.as_str(), "Project status changed");
            return Ok(Projection::Updated);
        }
        if db::project_exists(&self.pool, &id).await? {
            return Ok(Projection::Unchanged);
        }
        Err(IndexerError::DanglingReference {
            entity: "Project",
            id,
        })
    }

    async fn submit_verification(
        &self,
        verification_id: &B256,
        project_id: &B256,
        verifier: &Address,
        claim_cid: &str,
        meta: &LogMeta,
    ) -> Result<Projection> {
        let id = hex_id(verification_id);
        let project = hex_id(project_id);
        if !db::project_exists(&self.pool, &project).await? {
            return Err(IndexerError::DanglingReference {
                entity: "Project",
                id: project,
            });
        }

        let verifier = verifier.to_checksum(None);
        let tx_hash = meta.tx_hash.as_ref().map(hex_id);
        let created = db::insert_verification(
            &self.pool,
            &NewVerification {
                id: &id,
                project_id: &project,
                verifier: &verifier,
                claim_cid,
                block_number: block_i64(meta.block_number),
                tx_hash: tx_hash.as_deref(),
            },
        )
        .await?;

        if !created {
            return Ok(Projection::Unchanged);
        }
        info!(verification = %id, project = %project, "Indexed verification");
        Ok(Projection::Created)
    }

    /// Status change and credit mint commit together or not at all.
    async fn resolve_verification(
        &self,
        verification_id: &B256,
        success: bool,
        data: &Bytes,
        meta: &LogMeta,
    ) -> Result<Projection> {
        let id = hex_id(verification_id);
        let incoming = VerificationStatus::from_outcome(success);
        let amount = if success && !data.is_empty() {
            Some(decode_amount(data)?)
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;

        // The conditional update is the only gate: it moves a verification
        // out of `Submitted` at most once.
        let outcome_data = format!("0x{}", hex::encode(data));
        let resolved = db::resolve_verification(&mut *tx, &id, incoming, &outcome_data).await?;
        let current = db::find_verification(&mut *tx, &id)
            .await?
            .ok_or_else(|| IndexerError::DanglingReference {
                entity: "Verification",
                id: id.clone(),
            })?;
        if !resolved {
            return already_resolved(id, current.status, incoming);
        }

        if let Some(amount) = &amount {
            let tx_hash = meta.tx_hash.as_ref().map(hex_id);
            db::insert_credit(
                &mut *tx,
                &NewCredit {
                    verification_id: &id,
                    project_id: &current.project_id,
                    amount,
                    block_number: block_i64(meta.block_number),
                    tx_hash: tx_hash.as_deref(),
                },
            )
            .await?;
        }

        tx.commit().await?;
        info!(
            verification = %id,
            status = incoming.as_str(),
            credit = amount.as_deref().unwrap_or("-"),
            "Verification resolved"
        );
        Ok(Projection::Updated)
    }
}

/// Outcome for a verification that has left `Submitted`. Dropping the open
/// transaction discards nothing, since no row was changed.
fn already_resolved(id: String, stored: String, incoming: VerificationStatus) -> Result<Projection> {
    if stored == incoming.as_str() {
        debug!(verification = %id, "Outcome already applied");
        return Ok(Projection::Unchanged);
    }
    Err(IndexerError::ConflictingOutcome {
        id,
        stored,
        incoming: incoming.as_str().to_string(),
    })
}

/// The outcome payload carries `(uint256 amount)`.
fn decode_amount(data: &[u8]) -> Result<String> {
    let values = abi::decode_params(data, &[DynSolType::Uint(256)])
        .map_err(|e| IndexerError::malformed("VerificationOutcome", format!("payload: {e}")))?;
    match values.first() {
        Some(DynSolValue::Uint(amount, _)) => Ok(amount.to_string()),
        _ => Err(IndexerError::malformed(
            "VerificationOutcome",
            "payload carries no amount",
        )),
    }
}

fn block_i64(block: u64) -> i64 {
    i64::try_from(block).unwrap_or(i64::MAX)
}

fn report(kind: EventKind, log: &RawLog, err: &IndexerError) {
    let event = kind.name();
    let block = log.block_number;
    let log_index = log.log_index;
    let tx = log.transaction_hash.as_ref().map(hex_id).unwrap_or_default();
    match err {
        IndexerError::UnmappedStatusCode(code) => {
            debug!(event, block, code, "Ignoring unmapped status code");
        }
        e if e.is_event_scoped() => {
            warn!(event, block, log_index, %tx, "Dropped event: {e}");
        }
        e => {
            error!(event, block, log_index, %tx, "Failed to project event: {e}");
        }
    }
}
