//! Tether batch: run many independent operations in slow-start waves.
//!
//! The first wave is small; each fully successful wave doubles the next one,
//! capped at what remains. The first wave with any failure ends the batch
//! once all of its calls have completed.
//!
//! Waves cannot be cancelled once dispatched. Pick a conservative initial
//! size when individual operations are expensive.

#![forbid(unsafe_code)]

use std::future::Future;

use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Wave size planner. Yields `min(total, initial)`, then doubles, capped at
/// the remaining count, until nothing remains.
#[derive(Debug, Clone)]
pub struct SlowStart {
    next: usize,
    remaining: usize,
}

impl SlowStart {
    pub fn new(total: usize, initial: usize) -> Self {
        Self { next: initial.min(total), remaining: total }
    }

    pub fn remaining(&self) -> usize { self.remaining }
}

impl Iterator for SlowStart {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let size = self.next.min(self.remaining);
        if size == 0 {
            return None;
        }
        self.remaining -= size;
        self.next = size.saturating_mul(2);
        Some(size)
    }
}

/// A batch stopped early. `succeeded` counts every successful call, including
/// those in the failing wave; `error` is one of that wave's failures.
#[derive(Debug, thiserror::Error)]
#[error("batch stopped after {succeeded} successful calls: {error}")]
pub struct BatchFailure<E> {
    pub succeeded: usize,
    pub error: E,
}

/// Call `op` up to `total` times in slow-start waves starting at `initial`.
///
/// Returns the number of successful calls when all `total` succeed, or a
/// [`BatchFailure`] after the first wave containing a failure. Which failure
/// is reported when several calls in that wave fail is unspecified.
pub async fn run_batch<F, Fut, E>(total: usize, initial: usize, op: F) -> Result<usize, BatchFailure<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let started = std::time::Instant::now();
    let mut plan = SlowStart::new(total, initial);
    let mut succeeded = 0usize;
    while let Some(size) = plan.next() {
        debug!(wave = size, "slow start wave dispatched");
        let results = join_all((0..size).map(|_| op())).await;
        counter!("batch_waves_total", 1u64);

        let mut failure: Option<E> = None;
        let mut failed = 0usize;
        for res in results {
            match res {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(error) = failure {
            counter!("batch_failures_total", 1u64);
            warn!(wave = size, failed, successes = succeeded, skipped = plan.remaining(), "slow start wave failed; stopping");
            return Err(BatchFailure { succeeded, error });
        }
        info!(wave = size, successes = succeeded, remaining = plan.remaining(), "slow start wave complete");
    }
    histogram!("batch_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    Ok(succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_twenty_from_five() {
        let waves: Vec<_> = SlowStart::new(20, 5).collect();
        assert_eq!(waves, [5, 10, 5]);
    }

    #[test]
    fn initial_at_least_total_is_one_wave() {
        assert_eq!(SlowStart::new(7, 7).collect::<Vec<_>>(), [7]);
        assert_eq!(SlowStart::new(7, 100).collect::<Vec<_>>(), [7]);
    }

    #[test]
    fn zero_sizes_plan_nothing() {
        assert_eq!(SlowStart::new(0, 5).count(), 0);
        assert_eq!(SlowStart::new(10, 0).count(), 0);
    }

    #[test]
    fn waves_always_sum_to_total() {
        for total in 0..200 {
            for initial in 1..9 {
                let sum: usize = SlowStart::new(total, initial).sum();
                assert_eq!(sum, total, "total={total} initial={initial}");
            }
        }
    }
}
