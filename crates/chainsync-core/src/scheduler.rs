//! Batch scheduler — splits an open block range into bounded sub-ranges and
//! drives them through the applier, honoring stop requests between sub-ranges.

use std::sync::Arc;

use crate::applier::EventApplier;
use crate::config::TrackedEntity;
use crate::error::SyncError;
use crate::retry::RetryPolicy;
use crate::store::ProgressStore;

/// Split `[from, to]` into consecutive sub-ranges of at most `batch_size`
/// blocks: ascending, non-overlapping, covering the range exactly once.
pub fn split_range(from: u64, to: u64, batch_size: u64) -> Vec<(u64, u64)> {
    if to < from || batch_size == 0 {
        return vec![];
    }
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = (start + batch_size - 1).min(to);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Result of driving one round of sub-ranges.
#[derive(Debug, Clone, Copy)]
pub struct RoundOutcome {
    /// Sub-ranges that ran to completion.
    pub completed: usize,
    /// A stop request was observed before the round finished.
    pub stopped: bool,
}

/// Drives the sub-ranges of one catch-up round, strictly in ascending order.
///
/// The durable `is_syncing` flag is re-read before each sub-range, so a stop
/// is honored at sub-range granularity: at most the in-flight sub-range
/// completes after a stop request. Each sub-range is one unit of work under
/// the bounded retry policy; retry exhaustion fails the whole round.
pub struct BatchScheduler {
    progress: Arc<dyn ProgressStore>,
    applier: Arc<EventApplier>,
    policy: RetryPolicy,
    batch_size: u64,
}

impl BatchScheduler {
    pub fn new(
        progress: Arc<dyn ProgressStore>,
        applier: Arc<EventApplier>,
        policy: RetryPolicy,
        batch_size: u64,
    ) -> Self {
        Self {
            progress,
            applier,
            policy,
            batch_size,
        }
    }

    /// Process `[from, to]` for `entity`, one sub-range at a time.
    pub async fn run_range(
        &self,
        entity: &TrackedEntity,
        from: u64,
        to: u64,
    ) -> Result<RoundOutcome, SyncError> {
        let mut completed = 0;
        for (sub_from, sub_to) in split_range(from, to, self.batch_size) {
            if !self.still_syncing(entity).await? {
                tracing::info!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    completed,
                    "stop observed; ending round early"
                );
                return Ok(RoundOutcome {
                    completed,
                    stopped: true,
                });
            }
            self.apply_with_retry(entity, sub_from, sub_to).await?;
            completed += 1;
        }
        Ok(RoundOutcome {
            completed,
            stopped: false,
        })
    }

    async fn still_syncing(&self, entity: &TrackedEntity) -> Result<bool, SyncError> {
        Ok(self
            .progress
            .load(&entity.address, entity.chain_id)
            .await?
            .map(|row| row.is_syncing)
            .unwrap_or(false))
    }

    /// One sub-range as a unit of work: retried with backoff on transient
    /// errors, failed through on anything else.
    async fn apply_with_retry(
        &self,
        entity: &TrackedEntity,
        from: u64,
        to: u64,
    ) -> Result<u64, SyncError> {
        let mut failures = 0u32;
        loop {
            match self.applier.apply_range(entity, from, to).await {
                Ok(applied) => {
                    tracing::debug!(
                        address = %entity.address,
                        from,
                        to,
                        applied,
                        "sub-range complete"
                    );
                    return Ok(applied);
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    match self.policy.next_delay(failures) {
                        Some(delay) => {
                            tracing::warn!(
                                address = %entity.address,
                                from,
                                to,
                                attempt = failures,
                                delay_ms = delay.as_millis(),
                                error = %err,
                                "sub-range failed; retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(
                                address = %entity.address,
                                from,
                                to,
                                attempts = failures,
                                error = %err,
                                "sub-range retries exhausted"
                            );
                            return Err(err);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_exact_cover() {
        assert_eq!(
            split_range(100, 349, 100),
            vec![(100, 199), (200, 299), (300, 349)]
        );
    }

    #[test]
    fn single_block_range() {
        assert_eq!(split_range(42, 42, 100), vec![(42, 42)]);
    }

    #[test]
    fn range_smaller_than_batch() {
        assert_eq!(split_range(10, 15, 100), vec![(10, 15)]);
    }

    #[test]
    fn exact_multiple_of_batch() {
        assert_eq!(split_range(0, 199, 100), vec![(0, 99), (100, 199)]);
    }

    #[test]
    fn empty_and_degenerate_ranges() {
        assert!(split_range(100, 99, 10).is_empty());
        assert!(split_range(100, 200, 0).is_empty());
    }

    #[test]
    fn sub_ranges_are_ascending_and_contiguous() {
        let ranges = split_range(1_000, 9_999, 777);
        assert_eq!(ranges[0].0, 1_000);
        assert_eq!(ranges.last().unwrap().1, 9_999);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        for (from, to) in &ranges {
            assert!(to - from < 777);
        }
    }
}
