//! named concurrency governors. every parallel section of the installer runs
//! under one of these: a counting semaphore bounds simultaneous tasks, and an
//! optional throughput budget paces byte-sized progress reports.

use {
    anyhow::{Context, Result},
    parking_lot::{Mutex, RwLock},
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace},
};

pub const UNBOUNDED_THROUGHPUT: u64 = 0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, derivative::Derivative)]
#[derivative(Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceSettings {
    /// 0 falls back to the machine's cpu count
    #[derivative(Default(value = "0"))]
    #[serde(default)]
    pub max_tasks: usize,
    /// bytes per second; 0 means unbounded
    #[derivative(Default(value = "UNBOUNDED_THROUGHPUT"))]
    #[serde(default)]
    pub max_throughput_bytes_per_second: u64,
}

impl ResourceSettings {
    fn effective_max_tasks(&self) -> usize {
        match self.max_tasks {
            0 => num_cpus::get(),
            tasks => tasks,
        }
    }
}

/// a slot ticket handed out by [`Resource::begin`]. progress mutates `current`
/// monotonically; the slot is held until [`Resource::finish`] consumes the job.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub description: String,
    pub size: u64,
    pub started: bool,
    current: Arc<AtomicU64>,
    _permit: OwnedSemaphorePermit,
}

impl Job {
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub running: usize,
    pub waiting: usize,
    pub total_bytes: u64,
}

struct ThroughputTicket {
    bytes: u64,
    ack: oneshot::Sender<()>,
}

#[derive(Debug)]
struct JobInfo {
    #[allow(dead_code)]
    description: String,
    #[allow(dead_code)]
    size: u64,
    current: Arc<AtomicU64>,
}

struct ResourceState {
    semaphore: RwLock<Arc<Semaphore>>,
    throughput: AtomicU64,
    waiting: AtomicUsize,
    running: AtomicUsize,
    total_bytes: AtomicU64,
    next_job_id: AtomicU64,
    jobs: Mutex<BTreeMap<u64, JobInfo>>,
}

/// a named, tagged concurrency governor. cheap to clone (all state is shared).
#[derive(Clone)]
pub struct Resource {
    name: &'static str,
    state: Arc<ResourceState>,
    governor_tx: mpsc::Sender<ThroughputTicket>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("status", &self.status_report())
            .finish()
    }
}

const GOVERNOR_QUEUE_DEPTH: usize = 128;

impl Resource {
    /// spawns the throughput governor; it lives until `cancellation` fires and
    /// drains in-flight acks on the way out
    pub fn new(name: &'static str, settings: ResourceSettings, cancellation: CancellationToken) -> Self {
        let state = Arc::new(ResourceState {
            semaphore: RwLock::new(Arc::new(Semaphore::new(settings.effective_max_tasks()))),
            throughput: AtomicU64::new(settings.max_throughput_bytes_per_second),
            waiting: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            next_job_id: AtomicU64::new(0),
            jobs: Mutex::new(BTreeMap::new()),
        });
        let (governor_tx, governor_rx) = mpsc::channel(GOVERNOR_QUEUE_DEPTH);
        tokio::spawn(governor(name, state.clone(), governor_rx, cancellation.clone()));
        Self {
            name,
            state,
            governor_tx,
            cancellation,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// waits for a task slot. cancellation while still waiting leaves every
    /// counter the way it was.
    pub async fn begin(&self, title: impl Into<String>, size: u64) -> Result<Job> {
        let semaphore = self.state.semaphore.read().clone();
        self.state.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit,
            _ = self.cancellation.cancelled() => {
                self.state.waiting.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("[{}] begin was cancelled while waiting for a slot", self.name);
            }
        };
        self.state.waiting.fetch_sub(1, Ordering::SeqCst);
        let permit = permit.with_context(|| format!("[{}] semaphore was closed", self.name))?;
        self.state.running.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_job_id.fetch_add(1, Ordering::SeqCst);
        let description = title.into();
        let current = Arc::new(AtomicU64::new(0));
        self.state.jobs.lock().insert(
            id,
            JobInfo {
                description: description.clone(),
                size,
                current: current.clone(),
            },
        );
        trace!(resource = self.name, id, %description, size, "job started");
        Ok(Job {
            id,
            description,
            size,
            started: true,
            current,
            _permit: permit,
        })
    }

    /// returns once `bytes` have been paid for at the throughput budget.
    /// credit consumed by a cancelled report is not refunded.
    pub async fn report(&self, job: &Job, bytes: u64) -> Result<()> {
        if self.unbounded() {
            self.account(job, bytes);
            return Ok(());
        }
        let (ack, acked) = oneshot::channel();
        self.governor_tx
            .send(ThroughputTicket { bytes, ack })
            .await
            .with_context(|| format!("[{}] governor is gone", self.name))?;
        acked
            .await
            .with_context(|| format!("[{}] governor dropped the ack", self.name))?;
        self.account(job, bytes);
        Ok(())
    }

    /// counter-only update for monitoring signals that must not suspend
    pub fn report_no_wait(&self, job: &Job, bytes: u64) {
        self.account(job, bytes);
    }

    fn account(&self, job: &Job, bytes: u64) {
        job.current.fetch_add(bytes, Ordering::Relaxed);
        self.state.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn unbounded(&self) -> bool {
        matches!(self.state.throughput.load(Ordering::Relaxed), UNBOUNDED_THROUGHPUT | u64::MAX)
    }

    pub fn finish(&self, job: Job) {
        self.state.jobs.lock().remove(&job.id);
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        trace!(resource = self.name, id = job.id, "job finished");
        drop(job);
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            running: self.state.running.load(Ordering::SeqCst),
            waiting: self.state.waiting.load(Ordering::SeqCst),
            total_bytes: self.state.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// swaps in new limits. the previous semaphore keeps serving jobs that
    /// already hold permits; new `begin` calls see the new one.
    pub fn reload(&self, settings: ResourceSettings) {
        debug!(resource = self.name, ?settings, "reloading resource limits");
        self.state
            .throughput
            .store(settings.max_throughput_bytes_per_second, Ordering::Relaxed);
        *self.state.semaphore.write() = Arc::new(Semaphore::new(settings.effective_max_tasks()));
    }
}

/// single consumer of throughput tickets: reports are paid for strictly in
/// arrival order, one at a time
async fn governor(name: &'static str, state: Arc<ResourceState>, mut rx: mpsc::Receiver<ThroughputTicket>, cancellation: CancellationToken) {
    loop {
        let ticket = tokio::select! {
            ticket = rx.recv() => match ticket {
                Some(ticket) => ticket,
                None => break,
            },
            _ = cancellation.cancelled() => break,
        };
        let throughput = state.throughput.load(Ordering::Relaxed);
        if !matches!(throughput, UNBOUNDED_THROUGHPUT | u64::MAX) {
            tokio::time::sleep(Duration::from_secs_f64(ticket.bytes as f64 / throughput as f64)).await;
        }
        let _ = ticket.ack.send(());
    }
    // shutdown: whoever is already queued gets acked so nothing hangs
    while let Ok(ticket) = rx.try_recv() {
        let _ = ticket.ack.send(());
    }
    debug!(resource = name, "governor drained and stopped");
}

/// the fixed set of resource classes the installer schedules under
#[derive(Clone, Debug)]
pub struct Resources {
    pub downloads: Resource,
    pub web_requests: Resource,
    pub vfs: Resource,
    pub file_hashing: Resource,
    pub file_extractor: Resource,
    pub installer: Resource,
    pub user_intervention: Resource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourcesSettings {
    #[serde(default)]
    pub downloads: ResourceSettings,
    #[serde(default)]
    pub web_requests: ResourceSettings,
    #[serde(default)]
    pub vfs: ResourceSettings,
    #[serde(default)]
    pub file_hashing: ResourceSettings,
    #[serde(default)]
    pub file_extractor: ResourceSettings,
    #[serde(default)]
    pub installer: ResourceSettings,
}

impl Resources {
    pub fn new(settings: ResourcesSettings, cancellation: &CancellationToken) -> Self {
        Self {
            downloads: Resource::new("Downloads", settings.downloads, cancellation.clone()),
            web_requests: Resource::new("Web Requests", settings.web_requests, cancellation.clone()),
            vfs: Resource::new("VFS", settings.vfs, cancellation.clone()),
            file_hashing: Resource::new("File Hashing", settings.file_hashing, cancellation.clone()),
            file_extractor: Resource::new("File Extractor", settings.file_extractor, cancellation.clone()),
            installer: Resource::new("Installer", settings.installer, cancellation.clone()),
            user_intervention: Resource::new(
                "User Intervention",
                ResourceSettings {
                    max_tasks: 1,
                    max_throughput_bytes_per_second: UNBOUNDED_THROUGHPUT,
                },
                cancellation.clone(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn limited(max_tasks: usize, throughput: u64) -> (Resource, CancellationToken) {
        let token = CancellationToken::new();
        (
            Resource::new(
                "Test",
                ResourceSettings {
                    max_tasks,
                    max_throughput_bytes_per_second: throughput,
                },
                token.clone(),
            ),
            token,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_pacing() {
        let (resource, _token) = limited(1, 1000);
        let job = resource.begin("paced", 3000).await.unwrap();
        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            resource.report(&job, 1000).await.unwrap();
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2990), "elapsed was {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3200), "elapsed was {elapsed:?}");
        assert_eq!(job.current(), 3000);
        resource.finish(job);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_throughput_returns_immediately() {
        let (resource, _token) = limited(1, UNBOUNDED_THROUGHPUT);
        let job = resource.begin("free", 100).await.unwrap();
        let started = tokio::time::Instant::now();
        resource.report(&job, 1_000_000_000).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        resource.finish(job);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_a_hard_bound() {
        let (resource, _token) = limited(1, UNBOUNDED_THROUGHPUT);
        let first = resource.begin("first", 0).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), resource.begin("second", 0))
                .await
                .is_err(),
            "second begin should still be waiting"
        );
        resource.finish(first);
        let second = resource.begin("second", 0).await.unwrap();
        assert_eq!(resource.status_report().running, 1);
        resource.finish(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_begin_leaves_counters_unchanged() {
        let (resource, token) = limited(1, UNBOUNDED_THROUGHPUT);
        let held = resource.begin("holder", 0).await.unwrap();
        let before = resource.status_report();
        let waiting = tokio::spawn({
            let resource = resource.clone();
            async move { resource.begin("starved", 0).await }
        });
        tokio::task::yield_now().await;
        token.cancel();
        assert!(waiting.await.unwrap().is_err());
        assert_eq!(resource.status_report(), before);
        resource.finish(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_affects_new_jobs_only() {
        let (resource, _token) = limited(1, UNBOUNDED_THROUGHPUT);
        let old = resource.begin("under old limits", 0).await.unwrap();
        resource.reload(ResourceSettings {
            max_tasks: 2,
            max_throughput_bytes_per_second: UNBOUNDED_THROUGHPUT,
        });
        // the old job still holds its permit while two new ones fit in the new semaphore
        let a = resource.begin("a", 0).await.unwrap();
        let b = resource.begin("b", 0).await.unwrap();
        assert_eq!(resource.status_report().running, 3);
        [old, a, b].map(|job| resource.finish(job));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_report_total_bytes() {
        let (resource, _token) = limited(2, UNBOUNDED_THROUGHPUT);
        let job = resource.begin("bytes", 10).await.unwrap();
        resource.report(&job, 7).await.unwrap();
        resource.report_no_wait(&job, 3);
        assert_eq!(resource.status_report().total_bytes, 10);
        resource.finish(job);
    }
}
