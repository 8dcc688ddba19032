//! Background reaper for exited hypervisors.
//!
//! Runs on a fixed tick: VMs whose hypervisor went away without a stop are
//! marked failed and their network is released, then oversized log files are
//! rotated.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::NodeService;

/// Interval between checks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic reaper task.
pub struct Reaper {
    node: Arc<NodeService>,
    shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
}

impl Reaper {
    /// Create a reaper with the default interval.
    pub fn new(node: Arc<NodeService>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            node,
            shutdown_rx,
            interval: CHECK_INTERVAL,
        }
    }

    /// Override the check interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        // Don't catch up on missed ticks
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval = ?self.interval, "reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let reaped = self.node.reap_exited().await;
        if !reaped.is_empty() {
            tracing::info!(vms = ?reaped, "reaped exited vms");
        }
        self.node.rotate_logs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{harness, identity};
    use crate::vm::VmState;

    #[tokio::test]
    async fn test_reaper_marks_crashed_vm_failed() {
        let h = harness();
        h.node.start_vm(identity("vm-1")).await.unwrap();
        h.node.start_vm(identity("vm-2")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = Reaper::new(h.node.clone(), shutdown_rx).with_interval(Duration::from_millis(10));
        let task = tokio::spawn(reaper.run());

        h.launcher.crash("vm-2", 137);
        let mut state = VmState::Running;
        for _ in 0..200 {
            state = h.node.vm("vm-2").unwrap().state();
            if state != VmState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(state, VmState::Failed { .. }));
        assert_eq!(h.node.vm("vm-1").unwrap().state(), VmState::Running);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reaper_stops_when_sender_dropped() {
        let h = harness();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Reaper::new(h.node.clone(), shutdown_rx).run());
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
