//! Bounded admission queue for transcode jobs.
//!
//! At most `limit` engine runs are in flight; everything else waits in FIFO
//! order. A slot is released exactly once per job, whether the engine
//! succeeds, fails or panics, and the caller's [`JobHandle`] receives exactly
//! one result.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::TransformPlan;
use crate::engine::TranscodeEngine;
use crate::error::EngineError;
use crate::store;

/// Finished jobs kept for `GET /api/jobs`.
pub const JOB_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    /// Position in overall submission order, starting at 1.
    pub sequence: u64,
    pub operation: &'static str,
    pub status: JobStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub waiting: usize,
    pub completed: u64,
    pub failed: u64,
}

struct PendingJob {
    id: Uuid,
    plan: TransformPlan,
    output: PathBuf,
    reply: oneshot::Sender<Result<(), EngineError>>,
}

#[derive(Default)]
struct Admission {
    running: usize,
    waiting: VecDeque<PendingJob>,
}

struct QueueInner {
    engine: Arc<dyn TranscodeEngine>,
    limit: usize,
    admission: Mutex<Admission>,
    jobs: DashMap<Uuid, JobSnapshot>,
    finished: Mutex<VecDeque<Uuid>>,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

/// Await the outcome of one submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    reply: oneshot::Receiver<Result<(), EngineError>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> Result<(), EngineError> {
        self.reply.await.unwrap_or_else(|_| {
            Err(EngineError::Aborted(
                "job finished without reporting a result".to_string(),
            ))
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AdmissionQueue {
    /// `limit` is clamped to at least one concurrent job.
    pub fn new(engine: Arc<dyn TranscodeEngine>, limit: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                engine,
                limit: limit.max(1),
                admission: Mutex::new(Admission::default()),
                jobs: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Enqueue a plan. Must be called from within a Tokio runtime.
    pub fn submit(&self, plan: TransformPlan, output: PathBuf) -> JobHandle {
        let id = Uuid::new_v4();
        let (reply, receiver) = oneshot::channel();
        let sequence = self.inner.submitted.fetch_add(1, Ordering::Relaxed) + 1;

        self.inner.jobs.insert(
            id,
            JobSnapshot {
                id,
                sequence,
                operation: plan.operation,
                status: JobStatus::Queued,
                output: output
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                error: None,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );

        let job = PendingJob {
            id,
            plan,
            output,
            reply,
        };
        let ready = {
            let mut admission = lock(&self.inner.admission);
            if admission.running < self.inner.limit {
                admission.running += 1;
                Some(job)
            } else {
                admission.waiting.push_back(job);
                debug!(job_id = %id, position = admission.waiting.len(), "Job queued");
                None
            }
        };
        if let Some(job) = ready {
            self.launch(job);
        }

        JobHandle {
            id,
            reply: receiver,
        }
    }

    fn launch(&self, job: PendingJob) {
        let PendingJob {
            id,
            plan,
            output,
            reply,
        } = job;
        self.update(id, |snapshot| {
            snapshot.status = JobStatus::Running;
            snapshot.started_at = Some(Utc::now());
        });
        info!(job_id = %id, operation = plan.operation, "Job started");

        let queue = self.clone();
        tokio::spawn(async move {
            let engine = Arc::clone(&queue.inner.engine);
            let target = output.clone();
            let run = tokio::spawn(async move { engine.run(&plan, &target).await });
            let result = match run.await {
                Ok(result) => result,
                Err(join_error) => {
                    store::discard(&output).await;
                    Err(EngineError::Aborted(join_error.to_string()))
                }
            };

            queue.finish(id, &result);
            queue.release();
            // The submitter may have gone away; the output stays for the sweeper.
            let _ = reply.send(result);
        });
    }

    fn finish(&self, id: Uuid, result: &Result<(), EngineError>) {
        match result {
            Ok(()) => {
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %id, "Job finished");
            }
            Err(err) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %id, error = %err, "Job failed");
            }
        }
        self.update(id, |snapshot| {
            snapshot.finished_at = Some(Utc::now());
            match result {
                Ok(()) => snapshot.status = JobStatus::Done,
                Err(err) => {
                    snapshot.status = JobStatus::Failed;
                    snapshot.error = Some(err.to_string());
                }
            }
        });

        let mut finished = lock(&self.inner.finished);
        finished.push_back(id);
        while finished.len() > JOB_HISTORY_LIMIT {
            if let Some(evicted) = finished.pop_front() {
                self.inner.jobs.remove(&evicted);
            }
        }
    }

    /// Free one slot and start as many waiting jobs as now fit.
    fn release(&self) {
        let ready = {
            let mut admission = lock(&self.inner.admission);
            admission.running = admission.running.saturating_sub(1);
            let mut ready = Vec::new();
            while admission.running < self.inner.limit {
                let Some(job) = admission.waiting.pop_front() else {
                    break;
                };
                admission.running += 1;
                ready.push(job);
            }
            ready
        };
        for job in ready {
            self.launch(job);
        }
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut JobSnapshot)) {
        if let Some(mut snapshot) = self.inner.jobs.get_mut(&id) {
            apply(&mut snapshot);
        }
    }

    pub fn job(&self, id: Uuid) -> Option<JobSnapshot> {
        self.inner.jobs.get(&id).map(|entry| entry.value().clone())
    }

    /// Known jobs, newest first.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        jobs
    }

    pub fn stats(&self) -> QueueStats {
        let (running, waiting) = {
            let admission = lock(&self.inner.admission);
            (admission.running, admission.waiting.len())
        };
        QueueStats {
            max_concurrent: self.inner.limit,
            running,
            waiting,
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::{NamedFilter, Operation, SourceMedia, TransformCatalog};
    use crate::config::OutputConfig;

    /// Records concurrency and start order; fails or panics on request by
    /// output file name.
    #[derive(Default)]
    struct FakeEngine {
        current: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeEngine {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl TranscodeEngine for FakeEngine {
        async fn run(&self, _plan: &TransformPlan, output: &Path) -> Result<(), EngineError> {
            let name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            lock(&self.started).push(name.clone());

            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if name.starts_with("panic") {
                panic!("engine exploded");
            }
            if name.starts_with("fail") {
                return Err(EngineError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr_tail: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    fn plan() -> TransformPlan {
        TransformCatalog::new(OutputConfig::default())
            .build(
                &Operation::Filter(NamedFilter::Negative),
                &[SourceMedia {
                    path: PathBuf::from("/in/a.mp4"),
                    info: None,
                }],
            )
            .expect("plan")
    }

    #[tokio::test]
    async fn running_jobs_never_exceed_limit() {
        let engine = FakeEngine::with_delay(Duration::from_millis(30));
        let queue = AdmissionQueue::new(engine.clone(), 2);

        let handles: Vec<JobHandle> = (0..8)
            .map(|index| queue.submit(plan(), PathBuf::from(format!("job{index}.mp4"))))
            .collect();
        assert!(queue.stats().running <= 2);

        for handle in handles {
            handle.wait().await.expect("job succeeds");
        }
        assert_eq!(engine.peak.load(Ordering::SeqCst), 2);

        let stats = queue.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.completed, 8);
        assert!(queue.jobs().iter().all(|job| job.status == JobStatus::Done));
        assert!(queue.jobs().iter().all(|job| job.status.is_terminal()));
    }

    #[tokio::test]
    async fn single_slot_runs_in_submission_order() {
        let engine = FakeEngine::with_delay(Duration::from_millis(5));
        let queue = AdmissionQueue::new(engine.clone(), 1);

        let names: Vec<String> = (0..5).map(|index| format!("ordered{index}.mp4")).collect();
        let handles: Vec<JobHandle> = names
            .iter()
            .map(|name| queue.submit(plan(), PathBuf::from(name)))
            .collect();
        for handle in handles {
            handle.wait().await.expect("job succeeds");
        }

        assert_eq!(*lock(&engine.started), names);
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_job_releases_its_slot() {
        let engine = FakeEngine::with_delay(Duration::from_millis(5));
        let queue = AdmissionQueue::new(engine, 1);

        let failing = queue.submit(plan(), PathBuf::from("fail.mp4"));
        let next = queue.submit(plan(), PathBuf::from("after.mp4"));
        let failing_id = failing.id();

        assert!(matches!(
            failing.wait().await,
            Err(EngineError::Failed { .. })
        ));
        next.wait().await.expect("next job runs");

        let snapshot = queue.job(failing_id).expect("snapshot");
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.error.as_deref().unwrap_or_default().contains("boom"));
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.stats().running, 0);
    }

    #[tokio::test]
    async fn panicking_engine_releases_its_slot() {
        let engine = FakeEngine::with_delay(Duration::from_millis(1));
        let queue = AdmissionQueue::new(engine, 1);

        let exploding = queue.submit(plan(), PathBuf::from("panic.mp4"));
        let next = queue.submit(plan(), PathBuf::from("survivor.mp4"));

        assert!(matches!(
            exploding.wait().await,
            Err(EngineError::Aborted(_))
        ));
        next.wait().await.expect("queue keeps draining");
        assert_eq!(queue.stats().running, 0);
    }

    #[tokio::test]
    async fn zero_limit_is_clamped_to_one() {
        let queue = AdmissionQueue::new(FakeEngine::with_delay(Duration::ZERO), 0);
        assert_eq!(queue.limit(), 1);
        queue
            .submit(plan(), PathBuf::from("only.mp4"))
            .wait()
            .await
            .expect("job runs");
    }

    #[tokio::test]
    async fn finished_history_is_bounded() {
        let queue = AdmissionQueue::new(FakeEngine::with_delay(Duration::ZERO), 4);
        let handles: Vec<JobHandle> = (0..JOB_HISTORY_LIMIT + 5)
            .map(|index| queue.submit(plan(), PathBuf::from(format!("h{index}.mp4"))))
            .collect();
        for handle in handles {
            handle.wait().await.expect("job succeeds");
        }
        let jobs = queue.jobs();
        assert_eq!(jobs.len(), JOB_HISTORY_LIMIT);
        assert_eq!(jobs[0].sequence, (JOB_HISTORY_LIMIT + 5) as u64);
        assert_eq!(queue.stats().completed, (JOB_HISTORY_LIMIT + 5) as u64);
    }
}
