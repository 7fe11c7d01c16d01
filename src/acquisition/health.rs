//! Connection health guard.
//!
//! Every status query the engine makes goes through [`HealthGuard`]. A status
//! word other than ready is fatal for the whole run: a disconnect in the middle
//! of a trial invalidates the trigger-to-sample alignment of everything that
//! follows.
//!
//! The guard can be configured to re-poll a few times with exponential backoff
//! before giving up. The default budget is zero re-polls.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::acquisition::reader::Readback;
use crate::error::{AppResult, Checkpoint, DaqError};
use crate::hardware::Processor;

/// Re-poll budget for non-ready status words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra status queries after the first non-ready answer.
    pub retries: u32,
    /// Wait before the first re-poll; doubles on each further attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// No re-polls.
    pub const STRICT: RetryPolicy = RetryPolicy {
        retries: 0,
        backoff: Duration::ZERO,
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STRICT
    }
}

/// Status gate consulted at fixed checkpoints of every trial.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthGuard {
    policy: RetryPolicy,
}

impl HealthGuard {
    /// Guard with no re-polls.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Guard with a custom re-poll budget.
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Configured re-poll budget.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fail with `HardwareDisconnected` unless the processor reports ready.
    pub async fn check<P: Processor + ?Sized>(
        &self,
        processor: &P,
        checkpoint: Checkpoint,
    ) -> AppResult<()> {
        let mut backoff = self.policy.backoff;
        let mut attempt = 0;
        loop {
            let detail = match processor.status().await {
                Ok(status) if status.is_ready() => {
                    debug!(%checkpoint, attempt, "processor ready");
                    return Ok(());
                }
                Ok(status) => status.to_string(),
                Err(err) => format!("status query failed: {err}"),
            };

            if attempt >= self.policy.retries {
                error!(%checkpoint, %detail, "hardware connection lost");
                return Err(DaqError::HardwareDisconnected { checkpoint, detail });
            }

            attempt += 1;
            warn!(%checkpoint, %detail, attempt, "processor not ready, re-polling");
            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    /// Post-readback gate: short reads count as a lost connection, then the
    /// status word is checked as usual.
    pub async fn check_readback<P: Processor + ?Sized>(
        &self,
        processor: &P,
        readback: &Readback,
    ) -> AppResult<()> {
        if let Some(fault) = readback.faults.first() {
            error!(%fault, faults = readback.faults.len(), "readback incomplete");
            return Err(DaqError::HardwareDisconnected {
                checkpoint: Checkpoint::AfterReadback,
                detail: fault.to_string(),
            });
        }
        self.check(processor, Checkpoint::AfterReadback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockProcessor;
    use crate::hardware::ProcessorStatus;
    use ndarray::Array2;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::time::Instant;

    async fn ready_processor() -> MockProcessor {
        let processor = MockProcessor::new(1000.0);
        processor
            .load_circuit(Path::new("unused.rcx"), false, true)
            .await
            .unwrap();
        processor
    }

    #[tokio::test]
    async fn passes_when_ready() {
        let processor = ready_processor().await;
        HealthGuard::strict()
            .check(&processor, Checkpoint::BeforeTrial)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn any_other_status_is_fatal() {
        let processor = ready_processor().await;
        processor.set_status(ProcessorStatus(3)).await;

        let err = HealthGuard::strict()
            .check(&processor, Checkpoint::AfterPersist)
            .await
            .unwrap_err();
        match err {
            DaqError::HardwareDisconnected { checkpoint, detail } => {
                assert_eq!(checkpoint, Checkpoint::AfterPersist);
                assert!(detail.contains("status 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_doubling_backoff_then_fails() {
        let processor = ready_processor().await;
        processor.set_status(ProcessorStatus(0)).await;
        let guard = HealthGuard::with_policy(RetryPolicy {
            retries: 3,
            backoff: Duration::from_millis(10),
        });

        let start = Instant::now();
        let result = guard.check(&processor, Checkpoint::BeforeTrial).await;
        assert!(result.is_err());
        assert_eq!(start.elapsed(), Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_mismatch_recovers_within_budget() {
        let processor = Arc::new(ready_processor().await);
        processor.set_status(ProcessorStatus(1)).await;
        let guard = HealthGuard::with_policy(RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(20),
        });

        let healer = {
            let processor = processor.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                processor.set_status(ProcessorStatus::READY).await;
            })
        };

        guard
            .check(processor.as_ref(), Checkpoint::BeforeTrial)
            .await
            .unwrap();
        healer.await.unwrap();
    }

    #[tokio::test]
    async fn short_read_escalates_to_disconnect() {
        let processor = ready_processor().await;
        let readback = Readback {
            buffer: Array2::zeros((3, 10)),
            order: vec![3, 1],
            faults: vec![DaqError::ReadFault {
                channel: 3,
                expected: 10,
                received: 0,
            }],
        };

        let err = HealthGuard::strict()
            .check_readback(&processor, &readback)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::HardwareDisconnected {
                checkpoint: Checkpoint::AfterReadback,
                ..
            }
        ));
    }
}
