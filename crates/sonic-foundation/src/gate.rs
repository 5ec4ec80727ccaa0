//! GPU execution gate
//!
//! Admits at most one job onto the accelerator at a time. Waiters are served
//! in arrival order (tokio's semaphore is fair), a wait longer than the
//! admission timeout is rejected with [`GateError::Timeout`], and a full
//! waiting queue rejects immediately with [`GateError::Busy`].
//!
//! Admission yields an [`ExecutionTicket`]; dropping it releases the
//! accelerator, so every exit path releases.

use serde::{Deserialize, Serialize};
use sonic_kernel::config::GateConfig;
use sonic_kernel::error::GateError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time gate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub admissions: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub busy_rejections: u64,
    pub releases: u64,
    /// Jobs currently holding the accelerator (0 or 1).
    pub active: usize,
    /// Jobs currently waiting for admission.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    admissions: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    busy_rejections: AtomicU64,
    releases: AtomicU64,
    active: AtomicUsize,
    queued: AtomicUsize,
}

/// Decrements the queued count however the wait ends.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ExecutionGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    max_queue_depth: usize,
    default_timeout: Duration,
}

impl ExecutionGate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            counters: Arc::new(Counters::default()),
            max_queue_depth: config.max_queue_depth,
            default_timeout: Duration::from_millis(config.admission_timeout_ms),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Wait for exclusive use of the accelerator for at most `timeout`.
    pub async fn admit(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<ExecutionTicket, GateError> {
        self.admit_inner(job_id, timeout, None).await
    }

    /// Like [`ExecutionGate::admit`], but the wait ends with
    /// [`GateError::Cancelled`] once `cancel` fires. A job already admitted
    /// is not affected.
    pub async fn admit_cancellable(
        &self,
        job_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionTicket, GateError> {
        self.admit_inner(job_id, timeout, Some(cancel)).await
    }

    async fn admit_inner(
        &self,
        job_id: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionTicket, GateError> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
            return Err(GateError::Cancelled);
        }

        let start = Instant::now();
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(self.ticket(job_id, permit, start)),
            Err(TryAcquireError::Closed) => return Err(GateError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let queued = self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(&self.counters.queued);
        if queued >= self.max_queue_depth {
            self.counters.busy_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(job_id, queued, max = self.max_queue_depth, "Execution queue full");
            return Err(GateError::Busy { queued });
        }
        debug!(job_id, position = queued + 1, "Waiting for accelerator");

        let acquire = tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned());
        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                res = acquire => Some(res),
            },
            None => Some(acquire.await),
        };

        match outcome {
            None => {
                self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
                let waited_ms = start.elapsed().as_millis() as u64;
                info!(job_id, waited_ms, "Queued job withdrawn");
                Err(GateError::Cancelled)
            }
            Some(Err(_elapsed)) => {
                let waited_ms = start.elapsed().as_millis() as u64;
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(job_id, waited_ms, "Admission timed out");
                Err(GateError::Timeout { waited_ms })
            }
            Some(Ok(Err(_closed))) => Err(GateError::Closed),
            Some(Ok(Ok(permit))) => Ok(self.ticket(job_id, permit, start)),
        }
    }

    fn ticket(
        &self,
        job_id: &str,
        permit: OwnedSemaphorePermit,
        queued_at: Instant,
    ) -> ExecutionTicket {
        self.counters.admissions.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        let waited = queued_at.elapsed();
        info!(job_id, waited_ms = waited.as_millis() as u64, "Admitted to accelerator");
        ExecutionTicket {
            job_id: job_id.to_string(),
            permit: Some(permit),
            counters: Arc::clone(&self.counters),
            admitted_at: Instant::now(),
            waited,
        }
    }

    /// Release the accelerator held by `ticket`.
    pub fn release(&self, ticket: ExecutionTicket) {
        drop(ticket);
    }

    /// Refuse all future admissions and fail current waiters.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn stats(&self) -> GateStats {
        let c = &self.counters;
        GateStats {
            admissions: c.admissions.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            cancellations: c.cancellations.load(Ordering::Relaxed),
            busy_rejections: c.busy_rejections.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            active: c.active.load(Ordering::SeqCst),
            queued: c.queued.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for ExecutionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGate")
            .field("stats", &self.stats())
            .field("max_queue_depth", &self.max_queue_depth)
            .finish()
    }
}

/// Exclusive right to run one job on the accelerator.
pub struct ExecutionTicket {
    job_id: String,
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
    admitted_at: Instant,
    waited: Duration,
}

impl ExecutionTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Time spent queued before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn held(&self) -> Duration {
        self.admitted_at.elapsed()
    }
}

impl Drop for ExecutionTicket {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
            self.counters.releases.fetch_add(1, Ordering::Relaxed);
            drop(permit);
            info!(
                job_id = %self.job_id,
                held_ms = self.held().as_millis() as u64,
                "Accelerator released"
            );
        }
    }
}

impl std::fmt::Debug for ExecutionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTicket")
            .field("job_id", &self.job_id)
            .field("waited", &self.waited)
            .field("held", &self.held())
            .finish()
    }
}
