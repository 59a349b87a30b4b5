//! Run independent experiment pipelines in parallel.
//!
//! Each experiment stays sequential; parallelism only spans experiments, and the
//! store's compare-and-set keeps concurrent writers from clobbering each other.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::status::ExperimentStatus;
use crate::lifecycle::{CancelToken, Controller};

/// Per-experiment result of a batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub id: String,
    pub outcome: Result<ExperimentStatus, String>,
}

/// Validate and create every draft.
#[instrument(skip_all, fields(max_parallel = max_parallel))]
pub fn create_all(
    controller: &Controller<'_>,
    max_parallel: usize,
    cancel: &CancelToken,
) -> Result<Vec<BatchItem>> {
    let ids = ids_with_status(controller, ExperimentStatus::Draft, None)?;
    run_parallel(&ids, max_parallel, |id| {
        controller
            .create(id, cancel)
            .map(|record| record.status)
            .map_err(|err| err.to_string())
    })
}

/// Start up to `top` created experiments (id order); with `wait`, poll each.
#[instrument(skip_all, fields(max_parallel = max_parallel, top = top, wait = wait))]
pub fn execute_top(
    controller: &Controller<'_>,
    top: usize,
    wait: bool,
    max_parallel: usize,
    cancel: &CancelToken,
) -> Result<Vec<BatchItem>> {
    let ids = ids_with_status(controller, ExperimentStatus::Created, Some(top))?;
    run_parallel(&ids, max_parallel, |id| {
        controller
            .execute(id, wait, cancel)
            .map(|record| record.status)
            .map_err(|err| err.to_string())
    })
}

fn ids_with_status(
    controller: &Controller<'_>,
    status: ExperimentStatus,
    limit: Option<usize>,
) -> Result<Vec<String>> {
    let records = controller
        .list(Some(status))
        .map_err(|err| anyhow!("list {status} experiments: {err}"))?;
    let ids = records.into_iter().map(|record| record.id);
    Ok(match limit {
        Some(limit) => ids.take(limit).collect(),
        None => ids.collect(),
    })
}

/// Work-queue over scoped threads; results come back in id order.
fn run_parallel<F>(ids: &[String], max_parallel: usize, job: F) -> Result<Vec<BatchItem>>
where
    F: Fn(&str) -> Result<ExperimentStatus, String> + Sync,
{
    let workers = max_parallel.max(1).min(ids.len());
    let next = AtomicUsize::new(0);
    let results = Mutex::new(Vec::with_capacity(ids.len()));
    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let (next, results, job) = (&next, &results, &job);
                scope.spawn(move || -> Result<()> {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(id) = ids.get(idx) else {
                            return Ok(());
                        };
                        debug!(worker, %id, "pipeline started");
                        let outcome = job(id);
                        results
                            .lock()
                            .map_err(|_| anyhow!("batch results mutex poisoned"))?
                            .push(BatchItem {
                                id: id.clone(),
                                outcome,
                            });
                    }
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(anyhow!("batch worker thread panicked")),
            }
        }
        Ok(())
    })?;
    let mut items = results
        .into_inner()
        .map_err(|_| anyhow!("batch results mutex poisoned"))?;
    items.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(items)
}
