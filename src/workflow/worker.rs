//! Long-lived worker: N concurrent slots claiming tasks from the durable
//! queue and driving them through the engine. Slots coordinate through the
//! store's claim leases; the in-process held-set only stops one process from
//! re-claiming its own long-running task after the lease expires.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashSet;
use log::{error, info};
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::common::errors::handle_error;
use crate::workflow::engine::WorkflowEngine;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    engine: Arc<WorkflowEngine>,
    concurrency: usize,
    held: Arc<DashSet<u64>>,
}

/// Marks a task sequence as held by this process for the duration of its
/// processing, released on drop even when processing panics.
struct HeldGuard {
    held: Arc<DashSet<u64>>,
    seq: u64,
}

impl HeldGuard {
    fn acquire(held: &Arc<DashSet<u64>>, seq: u64) -> Self {
        held.insert(seq);
        Self {
            held: held.clone(),
            seq,
        }
    }
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        self.held.remove(&self.seq);
    }
}

impl Worker {
    pub fn new(engine: Arc<WorkflowEngine>, concurrency: usize) -> Self {
        Self {
            engine,
            concurrency: concurrency.max(1),
            held: Arc::new(DashSet::new()),
        }
    }

    /// Run until the shutdown channel fires. In-flight activities finish
    /// their current attempt; anything unfinished stays leased in the store
    /// and is re-claimed by the next worker instance.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) {
        info!("Pipeline worker starting with {} slots", self.concurrency);
        let mut slots = Vec::with_capacity(self.concurrency);
        for slot in 0..self.concurrency {
            let engine = self.engine.clone();
            let held = self.held.clone();
            let shutdown = shutdown.resubscribe();
            slots.push(tokio::spawn(async move {
                slot_loop(slot, engine, held, shutdown).await;
            }));
        }
        for slot in slots {
            if let Err(err) = slot.await {
                error!("Worker slot panicked: {err}");
            }
        }
        info!("Pipeline worker stopped");
    }

    /// Drain the queue single-threadedly until no task is due. Test harness;
    /// production uses `run`.
    pub async fn run_until_idle(&self) -> Result<()> {
        loop {
            let held: Vec<u64> = self.held.iter().map(|seq| *seq).collect();
            match self.engine.claim(held).await? {
                Some((seq, task)) => {
                    let _guard = HeldGuard::acquire(&self.held, seq);
                    self.engine.process(seq, task).await?;
                }
                None => return Ok(()),
            }
        }
    }
}

async fn slot_loop(
    slot: usize,
    engine: Arc<WorkflowEngine>,
    held: Arc<DashSet<u64>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    use tokio::sync::broadcast::error::TryRecvError;

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => break,
            Err(_) => {}
        }

        let held_snapshot: Vec<u64> = held.iter().map(|seq| *seq).collect();
        match engine.claim(held_snapshot).await {
            Ok(Some((seq, task))) => {
                let _guard = HeldGuard::acquire(&held, seq);
                if let Err(err) = engine.process(seq, task).await {
                    handle_error(err.context(format!("Worker slot {slot} failed to process task")));
                    sleep(ERROR_BACKOFF).await;
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = engine.notified() => {}
                    _ = sleep(IDLE_POLL_INTERVAL) => {}
                }
            }
            Err(err) => {
                handle_error(err.context(format!("Worker slot {slot} failed to claim a task")));
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
}
