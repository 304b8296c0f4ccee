use std::env;
use std::sync::OnceLock;

/// A wrapper around the Rayon thread pool used to process the entries of
/// ragged tensors.
///
/// If the pool could not be created, work runs on the calling thread.
#[derive(Debug)]
pub struct ThreadPool {
    /// The wrapped thread pool, or None if we failed to construct one.
    pool: Option<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Run a function in the thread pool.
    ///
    /// This corresponds to [`rayon::ThreadPool::install`]. Parallel iterators
    /// used inside `op` run on this pool's threads.
    pub fn run<R: Send, Op: FnOnce() -> R + Send>(&self, op: Op) -> R {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(op)
        } else {
            op()
        }
    }

    /// Create a thread pool with a given number of threads.
    pub fn with_num_threads(num_threads: usize) -> ThreadPool {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("rten-ragged-{}", index))
            .build();

        if let Err(err) = &pool {
            tracing::warn!(%err, "failed to create thread pool, running on calling thread");
        }

        ThreadPool { pool: pool.ok() }
    }

    /// Return the number of worker threads, or 1 if work runs on the calling
    /// thread.
    pub fn num_threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }
}

/// Parse a thread count override, clamping it to `[1, max_threads]`.
fn parse_num_threads(value: &str, max_threads: usize) -> Option<usize> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .map(|n| n.clamp(1, max_threads))
}

/// Return the [Rayon][rayon] thread pool which is used to process entries
/// by default.
///
/// The pool is sized by the number of physical cores, since per-entry work
/// is CPU-bound. The thread count can be overridden at the process level by
/// setting the `RTEN_NUM_THREADS` environment variable, whose value must be a
/// number between 1 and the logical core count.
///
/// The pool can be overridden per call via
/// [`RunOptions`](crate::RunOptions).
///
/// [rayon]: https://github.com/rayon-rs/rayon
pub fn thread_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| {
        let physical_cpus = num_cpus::get_physical().max(1);

        let num_threads = match env::var("RTEN_NUM_THREADS") {
            Ok(value) => parse_num_threads(&value, num_cpus::get()).unwrap_or_else(|| {
                tracing::warn!(value = %value, "ignoring invalid RTEN_NUM_THREADS");
                physical_cpus
            }),
            Err(_) => physical_cpus,
        };

        tracing::debug!(num_threads, "creating thread pool");
        ThreadPool::with_num_threads(num_threads)
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_num_threads, ThreadPool};

    #[test]
    fn test_parse_num_threads() {
        assert_eq!(parse_num_threads("4", 8), Some(4));
        assert_eq!(parse_num_threads("0", 8), Some(1));
        assert_eq!(parse_num_threads("64", 8), Some(8));
        assert_eq!(parse_num_threads("many", 8), None);
    }

    #[test]
    fn test_thread_pool_run() {
        let pool = ThreadPool::with_num_threads(2);
        assert_eq!(pool.num_threads(), 2);
        let sum: i32 = pool.run(|| {
            use rayon::prelude::*;
            (1..=10).into_par_iter().sum()
        });
        assert_eq!(sum, 55);
    }
}
