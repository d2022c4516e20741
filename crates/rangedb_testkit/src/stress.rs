//! Stress tests for RangeDB.
//!
//! These helpers drive concurrent transactional workloads and report how
//! many transactions committed and how many gave up after lock conflicts.

use rangedb_core::{CoreResult, Db, Environment, IsolationLevel, TxnId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions attempted.
    pub total_ops: usize,
    /// Transactions committed.
    pub successful_ops: usize,
    /// Transactions that failed after every retry.
    pub failed_ops: usize,
    /// Retries caused by lock errors.
    pub retries: usize,
    /// Total duration.
    pub duration: Duration,
    /// Transactions per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, retries: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            retries,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total transactions: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Lock retries: {}", self.retries);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} txn/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct keys touched.
    pub key_count: usize,
    /// Attempts per transaction before it counts as failed.
    pub max_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            key_count: 16,
            max_attempts: 50,
        }
    }
}

/// Runs `body` in a fresh transaction, retrying after lock errors.
///
/// Returns the body's value and the number of retries.
///
/// # Errors
///
/// The last error once `max_attempts` is used up, or the first error that
/// is not a lock error.
pub fn retry_txn<T>(
    env: &Environment,
    isolation: IsolationLevel,
    max_attempts: usize,
    mut body: impl FnMut(TxnId) -> CoreResult<T>,
) -> CoreResult<(T, usize)> {
    let mut retries = 0;
    loop {
        match env.transaction(isolation, &mut body) {
            Ok(value) => return Ok((value, retries)),
            Err(err) if err.is_lock_error() && retries + 1 < max_attempts => {
                retries += 1;
                thread::yield_now();
            }
            Err(err) => return Err(err),
        }
    }
}

fn counter_key(n: usize) -> Vec<u8> {
    format!("counter{n:04}").into_bytes()
}

/// Reads a little-endian counter, treating a missing key as zero.
///
/// # Errors
///
/// Read errors.
pub fn read_counter(db: &Db, txn: TxnId, key: &[u8]) -> CoreResult<u64> {
    Ok(db
        .get(txn, key)?
        .and_then(|raw| raw.try_into().ok())
        .map_or(0, u64::from_le_bytes))
}

/// Concurrent read-modify-write increments over `key_count` counters.
///
/// Under `Serializable` every committed increment must be reflected in
/// [`sum_counters`] afterwards; lost updates show up as a smaller sum.
pub fn stress_concurrent_increments(
    env: Arc<Environment>,
    db: &Db,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let retries = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let env = Arc::clone(&env);
            let db = db.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let retries = Arc::clone(&retries);
            let config = config.clone();

            thread::spawn(move || {
                for i in 0..config.operations {
                    let key = counter_key((t * 7 + i) % config.key_count);
                    let outcome = retry_txn(
                        &env,
                        IsolationLevel::Serializable,
                        config.max_attempts,
                        |txn| {
                            let current = read_counter(&db, txn, &key)?;
                            db.put(txn, &key, &(current + 1).to_le_bytes())
                        },
                    );
                    match outcome {
                        Ok(((), n)) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                            retries.fetch_add(n, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        retries.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Sums every counter written by [`stress_concurrent_increments`].
///
/// # Errors
///
/// Read errors.
pub fn sum_counters(env: &Environment, db: &Db, key_count: usize) -> CoreResult<u64> {
    env.transaction(IsolationLevel::SnapshotRepeatableRead, |txn| {
        (0..key_count).try_fold(0u64, |sum, n| {
            Ok(sum + read_counter(db, txn, &counter_key(n))?)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::fast_config;
    use rangedb_core::{DeadlockDetection, EnvConfig};

    #[test]
    fn increments_are_not_lost() {
        let env = Arc::new(
            Environment::open_in_memory(
                fast_config().deadlock_detection(DeadlockDetection::OnAcquire),
            )
            .unwrap(),
        );
        let db = env.open_db("counters").unwrap();
        let config = StressConfig {
            operations: 50,
            threads: 4,
            key_count: 3,
            max_attempts: 200,
        };
        let result = stress_concurrent_increments(Arc::clone(&env), &db, &config);
        assert_eq!(result.failed_ops, 0, "{result:?}");
        assert_eq!(
            sum_counters(&env, &db, config.key_count).unwrap(),
            result.successful_ops as u64
        );
    }

    #[test]
    fn retry_gives_up_on_logical_errors() {
        let env = Environment::open_in_memory(EnvConfig::default()).unwrap();
        let db = env.open_db("t").unwrap();
        let mut calls = 0;
        let result = retry_txn(&env, IsolationLevel::Serializable, 5, |txn| {
            calls += 1;
            db.delete(txn, b"missing")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
