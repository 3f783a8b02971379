//! Live log subscriptions, one independent task per event kind.
//!
//! Subscriptions do not coordinate with each other. A child event that
//! arrives before its parent is dropped by the projector and not retried;
//! the store's idempotent writes are the only shared-state guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{ContractSet, EventKind};
use crate::projector::Projector;
use crate::rpc::{LogSource, INITIAL_BACKOFF_SECS, MAX_BACKOFF_SECS};

pub struct Watcher {
    source: Arc<dyn LogSource>,
    projector: Arc<Projector>,
    contracts: ContractSet,
    kinds: Vec<EventKind>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
}

impl Watcher {
    pub fn new(
        source: Arc<dyn LogSource>,
        projector: Arc<Projector>,
        contracts: ContractSet,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            projector,
            contracts,
            kinds: EventKind::DEPENDENCY_ORDER.to_vec(),
            cancel,
            reconnect_delay: Duration::from_secs(INITIAL_BACKOFF_SECS),
        }
    }

    /// First re-subscribe delay; doubles on each consecutive failure.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run until the cancellation token fires. Returns how many logs each
    /// subscription delivered.
    pub async fn run(self) -> HashMap<EventKind, u64> {
        let mut tasks = JoinSet::new();
        for kind in &self.kinds {
            let subscription = Subscription {
                kind: *kind,
                address: self.contracts.address(kind.contract()),
                source: self.source.clone(),
                projector: self.projector.clone(),
                cancel: self.cancel.clone(),
                reconnect_delay: self.reconnect_delay,
            };
            tasks.spawn(subscription.run());
        }
        info!(subscriptions = self.kinds.len(), "Watcher started");

        let mut delivered = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, count)) => {
                    delivered.insert(kind, count);
                }
                Err(e) => error!("Subscription task failed: {e}"),
            }
        }
        info!("Watcher stopped");
        delivered
    }
}

struct Subscription {
    kind: EventKind,
    address: Address,
    source: Arc<dyn LogSource>,
    projector: Arc<Projector>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
}

impl Subscription {
    async fn run(self) -> (EventKind, u64) {
        let event = self.kind.name();
        let max_delay = Duration::from_secs(MAX_BACKOFF_SECS);
        let mut delay = self.reconnect_delay;
        let mut delivered = 0u64;

        loop {
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                subscribed = self.source.subscribe(self.address, self.kind.schema()) => subscribed,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!(event, address = %self.address, "Subscribed");
                    delay = self.reconnect_delay;
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => return (self.kind, delivered),
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(batch)) => {
                                for log in &batch {
                                    self.projector.handle_log(self.kind, log).await;
                                }
                                delivered += batch.len() as u64;
                            }
                            Some(Err(e)) => {
                                warn!(event, "Subscription failed: {e}");
                                break;
                            }
                            None => {
                                warn!(event, "Subscription ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(event, "Subscribe failed: {e}"),
            }

            info!(event, "Re-subscribing in {}ms", delay.as_millis());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
        }
        (self.kind, delivered)
    }
}
