//! One-shot prebuild barrier.
//!
//! The first worker boot must first produce the gold base image: wipe the
//! per-instance directory, refresh the base kernel and disk, and run the
//! prebuild VM to completion. Exactly one caller does this work; everyone
//! else queues behind the guard and proceeds once it has succeeded.
//!
//! The barrier is a state machine `Idle → InProgress → Done | Failed`, where
//! `InProgress` is holding the guard. A failed run stays retryable: the next
//! caller runs preparation again instead of inheriting a permanently
//! poisoned pool.

use std::future::Future;

use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierState {
    Idle,
    Done,
    Failed,
}

/// At-most-once guard for base-image preparation.
#[derive(Debug)]
pub(crate) struct PrebuildBarrier {
    state: Mutex<BarrierState>,
}

impl PrebuildBarrier {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::Idle),
        }
    }

    /// Runs `prepare` unless a previous run already succeeded.
    ///
    /// Concurrent callers serialize on the guard; each failed run is
    /// surfaced to the caller that performed it, and the next caller
    /// retries.
    pub(crate) async fn ensure<F, Fut>(&self, prepare: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = self.state.lock().await;
        if *state == BarrierState::Done {
            return Ok(());
        }

        match prepare().await {
            Ok(()) => {
                *state = BarrierState::Done;
                Ok(())
            }
            Err(e) => {
                *state = BarrierState::Failed;
                Err(e)
            }
        }
    }

    /// Marks preparation complete without running it.
    pub(crate) async fn mark_done(&self) {
        *self.state.lock().await = BarrierState::Done;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::CoreError;

    #[tokio::test]
    async fn runs_at_most_once_across_concurrent_callers() {
        let barrier = Arc::new(PrebuildBarrier::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let barrier = Arc::clone(&barrier);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                barrier
                    .ensure(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_permits_retry() {
        let barrier = PrebuildBarrier::new();
        let runs = AtomicUsize::new(0);

        let err = barrier
            .ensure(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Boot("download failed".into()))
            })
            .await;
        assert!(err.is_err());

        barrier
            .ensure(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        // Done now; further callers skip the closure.
        barrier
            .ensure(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mark_done_skips_preparation() {
        let barrier = PrebuildBarrier::new();
        barrier.mark_done().await;

        let runs = AtomicUsize::new(0);
        barrier
            .ensure(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
