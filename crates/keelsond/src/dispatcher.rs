//! Dispatcher: claims pending evaluations from the store and feeds them to
//! the worker pool.

use std::time::Duration;

use keelson_state::{Evaluation, StateStore};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Dispatcher {
    store: StateStore,
    tx: mpsc::Sender<Evaluation>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(store: StateStore, tx: mpsc::Sender<Evaluation>, poll_interval: Duration) -> Self {
        Self {
            store,
            tx,
            poll_interval,
        }
    }

    /// Poll until `shutdown` flips to true. Dropping the sender on return
    /// lets workers drain the queue and exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.dispatch_pending().await {
                Ok(0) => {}
                Ok(sent) => {
                    debug!(sent, "evaluations dispatched");
                    continue;
                }
                Err(e) => warn!(error = %e, "dispatch failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Hand back claims left in progress by an earlier process. Nothing can
    /// be working on them before this dispatcher starts.
    pub fn recover_claims(&self) -> anyhow::Result<usize> {
        let requeued = self
            .store
            .requeue_in_progress_evaluations("requeued at startup")?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), evals = ?requeued, "requeued stranded evaluations");
        }
        Ok(requeued.len())
    }

    /// Claim as many pending evaluations as the queue has room for and send
    /// them. Returns the number sent.
    pub async fn dispatch_pending(&self) -> anyhow::Result<usize> {
        let room = self.tx.capacity();
        if room == 0 {
            return Ok(0);
        }
        let claimed = self.store.claim_pending_evaluations(room)?;
        let mut sent = 0;
        let mut claimed = claimed.into_iter();
        while let Some(eval) = claimed.next() {
            let id = eval.id.clone();
            if self.tx.send(eval).await.is_err() {
                // Workers are gone; hand the claims back.
                self.store.requeue_evaluation(&id, "dispatcher stopped")?;
                for rest in claimed {
                    self.store.requeue_evaluation(&rest.id, "dispatcher stopped")?;
                }
                anyhow::bail!("evaluation queue closed");
            }
            sent += 1;
        }
        Ok(sent)
    }
}
