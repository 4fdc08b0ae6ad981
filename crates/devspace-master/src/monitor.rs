// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker detecting runtimes that died on their own.
//!
//! Containers or pods can disappear without a stop request: the engine restarts, a node
//! is drained, someone deletes them by hand. The monitor polls the runtimes this node
//! holds and hands the dead ones to [`WorkspaceRuntimes::check_local_runtimes`], which
//! cleans them up and publishes a stopped status carrying the reason.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::runtimes::WorkspaceRuntimes;

/// Configuration for the runtime monitor.
#[derive(Debug, Clone)]
pub struct RuntimeMonitorConfig {
    /// How often runtimes are checked.
    pub poll_interval: Duration,
}

impl Default for RuntimeMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Background worker checking local runtimes.
pub struct RuntimeMonitor {
    config: RuntimeMonitorConfig,
    runtimes: WorkspaceRuntimes,
    shutdown: Arc<Notify>,
}

impl RuntimeMonitor {
    /// Create a monitor over `runtimes`.
    pub fn new(config: RuntimeMonitorConfig, runtimes: WorkspaceRuntimes) -> Self {
        Self {
            config,
            runtimes,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Runtime monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Runtime monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let dead = self.runtimes.check_local_runtimes().await;
                    if dead.is_empty() {
                        debug!("All local runtimes alive");
                    } else {
                        warn!(workspaces = ?dead, "Cleaned up dead runtimes");
                    }
                }
            }
        }

        info!("Runtime monitor stopped");
    }
}
