//! Job Scheduler
//!
//! Runs named jobs on cron schedules inside the background context. Each
//! job gets its own timer task; a job can be paused (by itself, through its
//! `JobContext`, or from outside) and resumed by name. A paused job misses
//! its ticks rather than catching up on them later.
//!
//! Schedules accept standard five-field cron expressions as well as the
//! six- and seven-field forms with seconds (and years).

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chroma_core::{RegistrationError, SchedulerError, SharedClock, SystemClock};
use cron::Schedule;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for a running job before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Job Trait
// ----------------------------------------------------------------------------

/// Work run on every tick of a schedule
#[async_trait]
pub trait Job: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Job backed by an async closure
pub struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap a service method as a job
pub fn service_job<S, F, Fut>(service: Arc<S>, method: F) -> Arc<dyn Job>
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnJob(move |ctx| method(Arc::clone(&service), ctx)))
}

// ----------------------------------------------------------------------------
// Schedules
// ----------------------------------------------------------------------------

/// Parse a cron expression, accepting the five-field form without seconds
pub fn parse_schedule(expr: &str) -> Result<Schedule, SchedulerError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// The next `count` fire times strictly after `after`
pub fn upcoming(schedule: &Schedule, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    schedule.after(&after).take(count).collect()
}

/// A named job and its schedule
pub struct JobDescriptor {
    name: String,
    expression: String,
    schedule: Schedule,
    job: Arc<dyn Job>,
}

impl JobDescriptor {
    pub fn new(
        name: impl Into<String>,
        expression: &str,
        job: Arc<dyn Job>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            name: name.into(),
            expression: expression.to_string(),
            schedule: parse_schedule(expression)?,
            job,
        })
    }

    /// Describe a job backed by an async closure
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        expression: &str,
        f: F,
    ) -> Result<Self, SchedulerError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, expression, Arc::new(FnJob(f)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl core::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Job State
// ----------------------------------------------------------------------------

struct JobEntry {
    descriptor: JobDescriptor,
    paused: watch::Sender<bool>,
    ticks: AtomicU64,
}

impl JobEntry {
    fn new(descriptor: JobDescriptor) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            descriptor,
            paused,
            ticks: AtomicU64::new(0),
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Returns whether the state changed
    fn set_paused(&self, paused: bool) -> bool {
        self.paused.send_if_modified(|current| {
            let changed = *current != paused;
            *current = paused;
            changed
        })
    }
}

/// What a job sees while it runs
#[derive(Clone)]
pub struct JobContext {
    entry: Arc<JobEntry>,
    fired_at: DateTime<Utc>,
}

impl JobContext {
    pub fn name(&self) -> &str {
        &self.entry.descriptor.name
    }

    /// Scheduled time of the tick being run
    pub fn fired_at(&self) -> DateTime<Utc> {
        self.fired_at
    }

    /// Number of ticks run so far, this one included
    pub fn tick(&self) -> u64 {
        self.entry.ticks.load(Ordering::SeqCst)
    }

    /// Stop further ticks until the job is resumed by name
    pub fn pause(&self) {
        if self.entry.set_paused(true) {
            info!("Job '{}' paused itself", self.name());
        }
    }
}

impl core::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobContext")
            .field("name", &self.name())
            .field("fired_at", &self.fired_at)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

struct SchedulerInner {
    clock: SharedClock,
    jobs: RwLock<BTreeMap<String, Arc<JobEntry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Cron job runner of one background context
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                jobs: RwLock::new(BTreeMap::new()),
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Register a job; once started, the job is timed immediately
    pub fn register(&self, descriptor: JobDescriptor) -> Result<(), RegistrationError> {
        let name = descriptor.name.clone();
        let entry = {
            let mut jobs = self.jobs_mut();
            if jobs.contains_key(&name) {
                return Err(RegistrationError::DuplicateJob { name });
            }
            let entry = Arc::new(JobEntry::new(descriptor));
            jobs.insert(name.clone(), Arc::clone(&entry));
            entry
        };
        debug!(
            "Registered job '{}' ({})",
            name, entry.descriptor.expression
        );

        if self.is_running() {
            self.spawn(entry);
        }
        Ok(())
    }

    /// Start timing every registered job
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(false);
        let entries: Vec<Arc<JobEntry>> = self.jobs().values().cloned().collect();
        info!("Starting scheduler with {} jobs", entries.len());
        for entry in entries {
            self.spawn(entry);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop the job's ticks until it is resumed
    pub fn pause(&self, name: &str) -> Result<(), SchedulerError> {
        if self.entry(name)?.set_paused(true) {
            info!("Job '{}' paused", name);
        }
        Ok(())
    }

    /// Let a paused job tick again, from its next scheduled time on
    pub fn resume(&self, name: &str) -> Result<(), SchedulerError> {
        if self.entry(name)?.set_paused(false) {
            info!("Job '{}' resumed", name);
        }
        Ok(())
    }

    pub fn is_paused(&self, name: &str) -> Option<bool> {
        self.jobs().get(name).map(|entry| entry.is_paused())
    }

    /// Number of ticks the job has run
    pub fn tick_count(&self, name: &str) -> Option<u64> {
        self.jobs()
            .get(name)
            .map(|entry| entry.ticks.load(Ordering::SeqCst))
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs().keys().cloned().collect()
    }

    /// Next fire time of the job, `None` for a paused or unknown job
    pub fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        let entry = self.jobs().get(name).cloned()?;
        if entry.is_paused() {
            return None;
        }
        entry.descriptor.schedule.after(&self.inner.clock.now()).next()
    }

    /// Stop every job timer, waiting briefly for running jobs to finish
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Job did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                abort.abort();
            }
        }
        info!("Scheduler stopped");
    }

    fn spawn(&self, entry: Arc<JobEntry>) {
        let clock = Arc::clone(&self.inner.clock);
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(run_job(entry, clock, shutdown));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    fn entry(&self, name: &str) -> Result<Arc<JobEntry>, SchedulerError> {
        self.jobs()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob {
                name: name.to_string(),
            })
    }

    fn jobs(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<JobEntry>>> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn jobs_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<JobEntry>>> {
        self.inner
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.job_names())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Timer loop of one job
async fn run_job(entry: Arc<JobEntry>, clock: SharedClock, mut shutdown: watch::Receiver<bool>) {
    let name = entry.descriptor.name.clone();
    let mut paused = entry.paused.subscribe();
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if *paused.borrow_and_update() {
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = shutdown.changed() => break,
            }
        }

        let now = clock.now();
        let from = last_fired.map_or(now, |last| last.max(now));
        let Some(next) = entry.descriptor.schedule.after(&from).next() else {
            info!("Job '{}' has no further fire times", name);
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        last_fired = Some(next);

        // Paused while waiting: this tick is skipped
        if entry.is_paused() {
            continue;
        }

        let tick = entry.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Running job '{}' (tick {})", name, tick);
        let ctx = JobContext {
            entry: Arc::clone(&entry),
            fired_at: next,
        };
        match AssertUnwindSafe(entry.descriptor.job.handle(ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Job '{}' failed: {:#}", name, e),
            Err(_) => error!("Job '{}' panicked", name),
        }
    }
    debug!("Job '{}' timer stopped", name);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chroma_core::VirtualClock;
    use std::sync::atomic::AtomicUsize;

    fn clock_at_half_minute() -> SharedClock {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        Arc::new(VirtualClock::starting_at(anchor))
    }

    fn counting_job(name: &str, expr: &str, runs: &Arc<AtomicUsize>) -> JobDescriptor {
        let runs = Arc::clone(runs);
        JobDescriptor::from_fn(name, expr, move |_ctx| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap()
    }

    #[test]
    fn test_five_field_expressions_are_accepted() {
        let schedule = parse_schedule("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap();
        let times = upcoming(&schedule, from, 3);
        assert_eq!(
            times,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 45, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = parse_schedule("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[test]
    fn test_duplicate_job_is_rejected() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler
            .register(counting_job("sync", "* * * * *", &runs))
            .unwrap();
        assert_eq!(
            scheduler
                .register(counting_job("sync", "0 * * * *", &runs))
                .unwrap_err(),
            RegistrationError::DuplicateJob {
                name: "sync".into()
            }
        );
    }

    #[test]
    fn test_unknown_job_cannot_be_resumed() {
        let scheduler = Scheduler::new();
        assert_eq!(
            scheduler.resume("missing").unwrap_err(),
            SchedulerError::UnknownJob {
                name: "missing".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_ticks_every_minute() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::with_clock(clock_at_half_minute());
        scheduler
            .register(counting_job("sync", "* * * * *", &runs))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.tick_count("sync"), Some(5));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_can_pause_itself() {
        let scheduler = Scheduler::with_clock(clock_at_half_minute());
        scheduler
            .register(
                JobDescriptor::from_fn("once", "* * * * *", |ctx: JobContext| async move {
                    ctx.pause();
                    Ok(())
                })
                .unwrap(),
            )
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(scheduler.tick_count("once"), Some(1));
        assert_eq!(scheduler.is_paused("once"), Some(true));
        assert_eq!(scheduler.next_fire("once"), None);

        scheduler.resume("once").unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scheduler.tick_count("once"), Some(2));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_ticking() {
        let scheduler = Scheduler::with_clock(clock_at_half_minute());
        scheduler
            .register(
                JobDescriptor::from_fn("flaky", "* * * * *", |_ctx| async move {
                    Err::<(), _>(anyhow::anyhow!("remote unavailable"))
                })
                .unwrap(),
            )
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        assert_eq!(scheduler.tick_count("flaky"), Some(3));
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }
}
