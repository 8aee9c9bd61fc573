//! Small concurrency utilities.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single-slot work trigger that collapses bursts.
///
/// Any number of `enqueue` calls while the worker is busy fold into at most
/// one follow-up run, so a stampede of triggers (e.g. many dial-info
/// advertisements at once) costs one extra pass, not one pass each.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    work_tx: mpsc::Sender<()>,
}

impl WorkQueue {
    /// Spawn the worker loop. It runs `work` once per (coalesced) trigger
    /// and stops when `cancel` fires.
    pub fn new<F, Fut>(cancel: CancellationToken, mut work: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (work_tx, mut work_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    slot = work_rx.recv() => {
                        if slot.is_none() {
                            return;
                        }
                        work().await;
                    }
                }
            }
        });
        Self { work_tx }
    }

    /// Request a run. A no-op if a run is already pending.
    pub fn enqueue(&self) {
        let _ = self.work_tx.try_send(());
    }
}
