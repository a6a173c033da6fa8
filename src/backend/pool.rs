//! Bounded fan-out over work units.
//!
//! At most `parallel_jobs` units execute at the same time. The first fatal
//! error stops units that have not started yet; units already running are
//! allowed to finish.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error};

use crate::benchmark::WorkUnit;
use crate::error::BackendError;

/// Failure of a single unit.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// The unit failed; siblings are unaffected.
    #[error("{0}")]
    Failed(String),

    /// The backend became unusable; remaining units are aborted.
    #[error(transparent)]
    Fatal(#[from] BackendError),
}

impl UnitError {
    pub fn failed(message: impl Into<String>) -> Self {
        UnitError::Failed(message.into())
    }
}

/// Runs `run_unit` over every unit with at most `parallel_jobs` in flight.
///
/// Returns the outputs of all units, in completion-independent input order,
/// or the first fatal error.
pub async fn run_bounded<T, F, Fut>(
    units: Vec<WorkUnit>,
    parallel_jobs: usize,
    run_unit: F,
) -> Result<Vec<T>, BackendError>
where
    F: Fn(WorkUnit) -> Fut + Sync,
    Fut: Future<Output = Result<T, BackendError>> + Send,
    T: Send,
{
    let parallel_jobs = parallel_jobs.clamp(1, Semaphore::MAX_PERMITS);
    let permits = Semaphore::new(parallel_jobs);
    let aborted = AtomicBool::new(false);
    let fatal: Mutex<Option<BackendError>> = Mutex::new(None);

    debug!(
        units = units.len(),
        parallel_jobs,
        "Dispatching work units"
    );

    let futures = units.into_iter().map(|unit| {
        let permits = &permits;
        let aborted = &aborted;
        let fatal = &fatal;
        let run_unit = &run_unit;
        async move {
            let _permit = permits.acquire().await.ok()?;
            if aborted.load(Ordering::SeqCst) {
                debug!(unit = %unit, "Skipping unit after fatal backend error");
                return None;
            }
            let label = unit.to_string();
            match run_unit(unit).await {
                Ok(output) => Some(output),
                Err(e) => {
                    error!(unit = %label, error = %e, "Fatal backend error, aborting remaining units");
                    aborted.store(true, Ordering::SeqCst);
                    let mut slot = fatal.lock().await;
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    None
                }
            }
        }
    });

    let outputs = join_all(futures).await;

    if let Some(e) = fatal.into_inner() {
        return Err(e);
    }
    Ok(outputs.into_iter().flatten().collect())
}
