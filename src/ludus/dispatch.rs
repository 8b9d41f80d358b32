// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Bounded fan-out of per-user requests

use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use super::{DispatchError, DispatchRequest, Executor, Outcome};

/// Parallelism used when the caller passes a limit of 0
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Run every request through `executor` with at most `limit` calls in flight.
///
/// Returns one outcome per request in completion order. A failing request
/// never cancels its siblings and nothing is retried.
pub async fn dispatch(
    executor: Arc<dyn Executor>,
    requests: Vec<DispatchRequest>,
    api_key: &str,
    limit: usize,
) -> Vec<Outcome> {
    let total = requests.len();
    if total == 0 {
        return Vec::new();
    }
    let limit = if limit == 0 { DEFAULT_CONCURRENCY } else { limit };
    let workers = limit.min(total);
    debug!("Dispatching {} requests over {} workers", total, workers);

    let queue = Arc::new(Mutex::new(VecDeque::from(requests)));
    let (tx, mut rx) = mpsc::channel::<Outcome>(total);
    let api_key: Arc<str> = Arc::from(api_key);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let tx = tx.clone();
        let executor = executor.clone();
        let api_key = api_key.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let next = queue.lock().await.pop_front();
                let Some(request) = next else { break };
                let executed = AssertUnwindSafe(executor.execute(&request, &api_key)).catch_unwind().await;
                let outcome = match executed {
                    Ok(executed) => Outcome::classify(request.user_id, executed),
                    Err(_) => {
                        error!("Executor panicked for {}", request.user_id);
                        Outcome::failure(request.user_id, DispatchError::Transport("worker panicked".to_string()))
                    }
                };
                if tx.send(outcome).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Dispatch worker failed: {}", e);
        }
    }
    if outcomes.len() != total {
        warn!("Dispatch produced {} outcomes for {} requests", outcomes.len(), total);
    }
    outcomes
}
