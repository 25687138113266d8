//! Bounded-concurrency fan-out fetch pool with cancellation and per-fetch
//! error isolation (C3).

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, unbounded};
use tracing::warn;

use crate::model::CancelToken;

/// Runs `loader` over every id in `ids` with at most `max_in_flight`
/// concurrent workers. Failed loads are counted but do not appear in the
/// output map and do not cancel peers. Returns `(results, failed_count)`.
pub fn fetch_all<T, F>(
    ids: &[String],
    max_in_flight: usize,
    cancel: &CancelToken,
    loader: F,
) -> (Vec<(String, T)>, usize)
where
    T: Send + 'static,
    F: Fn(&str) -> Result<T, String> + Send + Sync + 'static,
{
    if ids.is_empty() {
        return (Vec::new(), 0);
    }
    let worker_count = max_in_flight.max(1).min(ids.len());
    let (job_tx, job_rx) = unbounded::<String>();
    let (result_tx, result_rx) = bounded::<(String, Result<T, String>)>(ids.len());

    for id in ids {
        job_tx.send(id.clone()).expect("job channel send");
    }
    drop(job_tx);

    let loader = Arc::new(loader);
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        let loader = loader.clone();
        handles.push(thread::spawn(move || {
            while let Ok(id) = job_rx.recv() {
                if cancel.is_cancelled() {
                    break;
                }
                let outcome = loader(&id);
                if result_tx.send((id, outcome)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    let mut results = Vec::new();
    let mut failed = 0usize;
    while let Ok((id, outcome)) = result_rx.recv() {
        match outcome {
            Ok(value) => results.push((id, value)),
            Err(message) => {
                warn!(id, message, "fetch failed, omitting from results");
                failed += 1;
            }
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    (results, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_ids_short_circuits() {
        let cancel = CancelToken::new();
        let (results, failed) = fetch_all::<i32, _>(&[], 4, &cancel, |_| Ok(1));
        assert!(results.is_empty());
        assert_eq!(failed, 0);
    }

    #[test]
    fn all_succeed() {
        let ids: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let cancel = CancelToken::new();
        let (results, failed) = fetch_all(&ids, 4, &cancel, |id| Ok::<_, String>(id.to_string()));
        assert_eq!(results.len(), 20);
        assert_eq!(failed, 0);
    }

    #[test]
    fn failures_are_isolated_and_counted() {
        let ids: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let cancel = CancelToken::new();
        let (results, failed) = fetch_all(&ids, 3, &cancel, |id| {
            let n: i32 = id.parse().unwrap();
            if n % 2 == 0 {
                Ok(n)
            } else {
                Err("odd".to_string())
            }
        });
        assert_eq!(results.len(), 5);
        assert_eq!(failed, 5);
    }

    #[test]
    fn cancellation_stops_new_loaders() {
        let ids: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let (results, _) = fetch_all(&ids, 4, &cancel, move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(1)
        });
        // Every worker checks cancellation before taking its first job, so
        // no new loader should run once the token is already set.
        assert_eq!(results.len(), 0);
    }
}
