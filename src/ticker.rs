//! Background relay ticker.
//!
//! Runs [`NodeFacade::tick`] on a fixed interval until cancelled. Each pass
//! runs on the blocking pool since every store call is synchronous SQLite.

use std::{sync::Arc, time::Duration};

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::NodeFacade;

pub struct RelayTicker {
    node: Arc<NodeFacade>,
    every: Duration,
    shutdown: CancellationToken,
}

impl RelayTicker {
    pub fn new(node: Arc<NodeFacade>, every: Duration, shutdown: CancellationToken) -> Self {
        Self { node, every, shutdown }
    }

    /// Drive relay passes until `shutdown` is cancelled. The first pass runs
    /// immediately.
    pub async fn run(self) {
        info!(every_secs = self.every.as_secs(), "relay ticker running");
        let mut interval = time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("relay ticker shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let node = self.node.clone();
                    match tokio::task::spawn_blocking(move || node.tick()).await {
                        Ok(Ok(report)) => debug!(?report, "background relay pass"),
                        Ok(Err(e)) => warn!(error = %e, "background relay pass failed"),
                        Err(e) => warn!(error = %e, "relay pass task panicked"),
                    }
                }
            }
        }
    }
}
