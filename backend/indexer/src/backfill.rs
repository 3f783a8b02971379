//! Historical backfill, one full pass per event kind.
//!
//! Each pass walks the whole `[start_block, head]` range in chunks, buffers
//! every log of its kind, then projects them in chain order. Passes run in
//! the plan's kind order, so a parent entity from anywhere in history is in
//! the store before any child event referencing it is applied.

use std::num::NonZeroU64;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{BlockRange, ChunkPlan};
use crate::errors::Result;
use crate::events::{ContractSet, EventKind};
use crate::projector::{Projection, Projector};
use crate::rpc::{LogSource, RawLog};

/// What to backfill and in which order.
#[derive(Debug, Clone)]
pub struct BackfillPlan {
    pub start_block: u64,
    pub chunk_width: NonZeroU64,
    /// Kinds in the order their passes run. Parents must precede children.
    pub order: Vec<EventKind>,
    pub contracts: ContractSet,
}

impl BackfillPlan {
    pub fn new(start_block: u64, chunk_width: NonZeroU64, contracts: ContractSet) -> Self {
        Self {
            start_block,
            chunk_width,
            order: EventKind::DEPENDENCY_ORDER.to_vec(),
            contracts,
        }
    }
}

/// Outcome of one event-kind pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub kind: EventKind,
    pub fetched: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub dropped: usize,
    /// Chunks whose fetch failed; their logs were never seen.
    pub gaps: Vec<BlockRange>,
}

impl PassReport {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            fetched: 0,
            applied: 0,
            unchanged: 0,
            dropped: 0,
            gaps: Vec::new(),
        }
    }

    fn record(&mut self, projection: Projection) {
        match projection {
            Projection::Created | Projection::Updated => self.applied += 1,
            Projection::Unchanged | Projection::Ignored => self.unchanged += 1,
            Projection::Dropped => self.dropped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub head: u64,
    pub passes: Vec<PassReport>,
    /// Set when shutdown interrupted the run; later passes did not run.
    pub cancelled: bool,
}

impl BackfillReport {
    pub fn gaps(&self) -> impl Iterator<Item = (EventKind, BlockRange)> + '_ {
        self.passes
            .iter()
            .flat_map(|pass| pass.gaps.iter().map(move |gap| (pass.kind, *gap)))
    }
}

pub struct Backfill {
    source: Arc<dyn LogSource>,
    projector: Arc<Projector>,
    plan: BackfillPlan,
    cancel: CancellationToken,
}

impl Backfill {
    pub fn new(
        source: Arc<dyn LogSource>,
        projector: Arc<Projector>,
        plan: BackfillPlan,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            projector,
            plan,
            cancel,
        }
    }

    /// Run every pass against the head observed at the start.
    ///
    /// Only failing to read the head is an error; chunk fetch failures are
    /// recorded as gaps and event failures are counted as drops.
    pub async fn run(&self) -> Result<BackfillReport> {
        let head = self.source.current_head().await?;
        let chunks = ChunkPlan::new(self.plan.start_block, head, self.plan.chunk_width);
        let mut report = BackfillReport {
            head,
            passes: Vec::new(),
            cancelled: false,
        };

        if chunks.is_empty() {
            info!(
                start = self.plan.start_block,
                head, "Start block is past the chain head, nothing to backfill"
            );
            return Ok(report);
        }
        info!(
            from = self.plan.start_block,
            to = head,
            width = self.plan.chunk_width.get(),
            "Backfill starting"
        );

        for kind in &self.plan.order {
            match self.run_pass(*kind, &chunks).await {
                Some(pass) => report.passes.push(pass),
                None => {
                    info!(event = kind.name(), "Backfill cancelled");
                    report.cancelled = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    /// `None` if cancelled before the pass finished.
    async fn run_pass(&self, kind: EventKind, chunks: &ChunkPlan) -> Option<PassReport> {
        let event = kind.name();
        let address = self.plan.contracts.address(kind.contract());
        let mut pass = PassReport::new(kind);
        let mut logs: Vec<RawLog> = Vec::new();

        for range in chunks {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.source.fetch_logs(address, kind.schema(), range).await {
                Ok(batch) => {
                    debug!(
                        event,
                        %range,
                        blocks = range.width(),
                        count = batch.len(),
                        "Fetched chunk"
                    );
                    logs.extend(batch);
                }
                Err(e) => {
                    warn!(event, %range, "Skipping chunk after fetch failure: {e}");
                    pass.gaps.push(range);
                }
            }
        }

        logs.sort_by_key(|log| (log.block_number, log.log_index));
        pass.fetched = logs.len();
        for log in &logs {
            if self.cancel.is_cancelled() {
                return None;
            }
            pass.record(self.projector.handle_log(kind, log).await);
        }

        info!(
            event,
            fetched = pass.fetched,
            applied = pass.applied,
            unchanged = pass.unchanged,
            dropped = pass.dropped,
            "Backfill pass complete"
        );
        if !pass.gaps.is_empty() {
            let gaps: Vec<String> = pass.gaps.iter().map(ToString::to_string).collect();
            warn!(event, gaps = %gaps.join(", "), "Backfill pass left gaps");
        }
        Some(pass)
    }
}
