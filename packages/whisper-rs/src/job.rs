//! Background services: deciding before a service runs whether to defer it.
//!
//! This module provides:
//! - [`BackgroundJob`] - A service body that can be rebuilt from worker attributes
//! - [`Background`] - The [`Service`] wrapper deciding inline vs deferred
//! - [`Job`] - The serializable record handed to a [`Worker`]
//! - [`JobRegistry`] - Maps job types back to constructors on the worker side
//! - [`TokioWorker`] - Defers jobs on a tokio runtime
//!
//! # Flow
//!
//! ```text
//! runtime.run(Background::new(job, options, worker))
//!   ├─ invalid      → emit("fail")                          → Invalid
//!   ├─ background   → worker.perform_in(delay, Job{attrs})  → Scheduled(id)
//!   └─ otherwise    → job.perform(ctx)                      → Performed
//!
//! worker, after delay:
//!   registry.perform(&runtime, job)
//!     → J::from_worker_attributes(attrs)
//!     → runtime.run(Background::inline(j))   same dispatch as a direct call
//! ```
//!
//! Global listeners for a background service are declared on
//! `Background<J>`; they fire whether the job runs inline or on a worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::args;
use crate::core::{Args, Fields, ServiceKey, Value};
use crate::error::WhisperError;
use crate::runtime::Runtime;
use crate::service::{Context, Service};

// =============================================================================
// Options and Outcome
// =============================================================================

/// Whether and when to defer a background service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackgroundOptions {
    /// Hand the service to the worker instead of performing it inline.
    pub background: bool,
    /// Delay before the worker performs it. Falls back to
    /// [`Config::default_delay`](crate::Config::default_delay).
    pub perform_in: Option<Duration>,
}

impl BackgroundOptions {
    /// Perform inline.
    pub fn inline() -> Self {
        Self::default()
    }

    /// Defer to the worker, after `delay` when given.
    pub fn deferred(delay: Option<Duration>) -> Self {
        Self {
            background: true,
            perform_in: delay,
        }
    }
}

/// What a background service did when run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundOutcome {
    /// `is_valid` returned false; `fail` was emitted.
    Invalid,
    /// Handed to the worker as the job with this id.
    Scheduled(Uuid),
    /// Performed inline.
    Performed,
}

// =============================================================================
// Job
// =============================================================================

/// A deferred service, as handed to a [`Worker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Stable identifier used to rebuild the service ([`BackgroundJob::JOB_TYPE`]).
    pub job_type: String,
    /// Worker attribute values, in declaration order.
    pub attributes: Vec<Value>,
    pub delay_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, attributes: Vec<Value>, delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            attributes,
            delay_secs: delay.as_secs(),
            enqueued_at: Utc::now(),
        }
    }

    /// When the job becomes due.
    pub fn run_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.delay_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        self.enqueued_at
            .checked_add_signed(chrono::Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Defers jobs. Implementations decide where and how they run.
pub trait Worker: Send + Sync {
    /// Arrange for `job` to be performed after `delay`.
    fn perform_in(&self, delay: Duration, job: Job) -> Result<()>;
}

/// A worker that rejects every job.
///
/// Used for services that only ever run inline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpWorker;

impl Worker for NoOpWorker {
    fn perform_in(&self, _delay: Duration, job: Job) -> Result<()> {
        Err(anyhow!(
            "background services not supported: no worker configured for {}",
            job.job_type
        ))
    }
}

// =============================================================================
// Background Job
// =============================================================================

/// The body of a service that may be deferred to a worker.
///
/// # Example
///
/// ```ignore
/// struct SendDigest {
///     user_id: String,
///     period: String,
/// }
///
/// impl BackgroundJob for SendDigest {
///     const JOB_TYPE: &'static str = "digest:send";
///
///     fn worker_attributes() -> &'static [&'static str] {
///         &["user_id", "period"]
///     }
///
///     fn from_worker_attributes(attributes: Args) -> Result<Self> {
///         let [user_id, period]: [Value; 2] = attributes.try_into().map_err(|_| anyhow!("expected 2 attributes"))?;
///         Ok(Self { user_id: serde_json::from_value(user_id)?, period: serde_json::from_value(period)? })
///     }
///
///     fn fields(&self) -> Fields {
///         Fields::new().with("user_id", self.user_id.clone()).with("period", self.period.clone())
///     }
///
///     fn perform(&mut self, ctx: &mut Context<'_>) -> Result<()> {
///         digest::send(&self.user_id, &self.period)?;
///         ctx.emit("sent", args![self.user_id])?;
///         Ok(())
///     }
/// }
/// ```
pub trait BackgroundJob: Sized + 'static {
    /// Stable identifier stored in [`Job::job_type`].
    const JOB_TYPE: &'static str;

    /// Field names captured into the job, in order.
    fn worker_attributes() -> &'static [&'static str] {
        &[]
    }

    /// Rebuild the job from its captured attributes.
    fn from_worker_attributes(attributes: Args) -> Result<Self>;

    fn fields(&self) -> Fields {
        Fields::new()
    }

    fn is_valid(&self) -> bool {
        true
    }

    /// The work itself.
    fn perform(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Err(WhisperError::not_implemented::<Self>("perform").into())
    }
}

/// A [`Service`] running a [`BackgroundJob`] inline or on a [`Worker`].
pub struct Background<J> {
    job: J,
    options: BackgroundOptions,
    worker: Arc<dyn Worker>,
}

impl<J: BackgroundJob> Background<J> {
    pub fn new(job: J, options: BackgroundOptions, worker: Arc<dyn Worker>) -> Self {
        Self {
            job,
            options,
            worker,
        }
    }

    /// Always perform inline.
    pub fn inline(job: J) -> Self {
        Self::new(job, BackgroundOptions::inline(), Arc::new(NoOpWorker))
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn options(&self) -> BackgroundOptions {
        self.options
    }

    fn capture_attributes(ctx: &Context<'_>) -> Result<Args> {
        J::worker_attributes()
            .iter()
            .map(|name| {
                ctx.field(name).cloned().ok_or_else(|| {
                    WhisperError::MissingField {
                        service: std::any::type_name::<J>(),
                        field: (*name).to_string(),
                    }
                    .into()
                })
            })
            .collect()
    }
}

impl<J: BackgroundJob> Service for Background<J> {
    type Output = BackgroundOutcome;

    fn key() -> ServiceKey {
        ServiceKey::of::<J>()
    }

    fn fields(&self) -> Fields {
        self.job.fields()
    }

    fn run(&mut self, ctx: &mut Context<'_>) -> Result<BackgroundOutcome> {
        if !self.job.is_valid() {
            ctx.emit("fail", args![])?;
            return Ok(BackgroundOutcome::Invalid);
        }

        if !self.options.background {
            self.job.perform(ctx)?;
            return Ok(BackgroundOutcome::Performed);
        }

        let attributes = Self::capture_attributes(ctx)?;
        let delay = self.options.perform_in.unwrap_or(ctx.config().default_delay);
        let job = Job::new(J::JOB_TYPE, attributes, delay);
        let id = job.id;

        info!(
            job_id = %id,
            job_type = J::JOB_TYPE,
            delay_secs = delay.as_secs(),
            "scheduling background service"
        );
        self.worker.perform_in(delay, job)?;

        Ok(BackgroundOutcome::Scheduled(id))
    }
}

// =============================================================================
// Job Registry
// =============================================================================

type PerformFn = Box<dyn Fn(&Runtime, Args) -> Result<BackgroundOutcome> + Send + Sync>;

/// Registry rebuilding background services from job records.
#[derive(Default)]
pub struct JobRegistry {
    performers: HashMap<&'static str, PerformFn>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register job type `J`.
    ///
    /// # Panics
    ///
    /// Panics if a job with the same `JOB_TYPE` is already registered.
    pub fn register<J: BackgroundJob>(&mut self) -> &mut Self {
        if self.performers.contains_key(J::JOB_TYPE) {
            panic!("job already registered for type: {}", J::JOB_TYPE);
        }

        let perform: PerformFn = Box::new(|runtime: &Runtime, attributes: Args| {
            let job = J::from_worker_attributes(attributes)
                .with_context(|| format!("rebuilding {} from worker attributes", J::JOB_TYPE))?;
            runtime.run(Background::inline(job))
        });
        self.performers.insert(J::JOB_TYPE, perform);
        self
    }

    /// Rebuild and perform `job` inline through `runtime`.
    pub fn perform(&self, runtime: &Runtime, job: Job) -> Result<BackgroundOutcome> {
        let perform = self
            .performers
            .get(job.job_type.as_str())
            .ok_or_else(|| WhisperError::UnknownJobType(job.job_type.clone()))?;

        perform(runtime, job.attributes)
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.performers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.performers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.performers.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("registered_types", &self.performers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Tokio Worker
// =============================================================================

/// Worker that sleeps out the delay on a tokio runtime, then performs the
/// job through the same [`Runtime`] a direct call would use.
///
/// Failures are logged; nobody is left to return them to.
#[derive(Debug, Clone)]
pub struct TokioWorker {
    runtime: Runtime,
    jobs: Arc<JobRegistry>,
    handle: Handle,
}

impl TokioWorker {
    /// Create a worker on the current tokio runtime.
    pub fn new(runtime: Runtime, jobs: Arc<JobRegistry>) -> Result<Self> {
        let handle = Handle::try_current().context("TokioWorker requires a tokio runtime")?;
        Ok(Self::with_handle(runtime, jobs, handle))
    }

    pub fn with_handle(runtime: Runtime, jobs: Arc<JobRegistry>, handle: Handle) -> Self {
        Self {
            runtime,
            jobs,
            handle,
        }
    }
}

impl Worker for TokioWorker {
    fn perform_in(&self, delay: Duration, job: Job) -> Result<()> {
        if !self.jobs.has(&job.job_type) {
            return Err(WhisperError::UnknownJobType(job.job_type).into());
        }

        let runtime = self.runtime.clone();
        let jobs = self.jobs.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;

            let job_id = job.id;
            let job_type = job.job_type.clone();
            if let Err(e) = jobs.perform(&runtime, job) {
                warn!(%job_id, job_type, error = %e, "background service failed");
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::binding::{Listener, ListenerOptions};
    use crate::runtime::RuntimeBuilder;
    use crate::testing::SpyWorker;

    thread_local! {
        static EVENTS: RefCell<Vec<(&'static str, Args)>> = const { RefCell::new(Vec::new()) };
    }

    struct Digest {
        user: String,
        period: String,
    }

    impl BackgroundJob for Digest {
        const JOB_TYPE: &'static str = "digest:send";

        fn worker_attributes() -> &'static [&'static str] {
            &["user", "period"]
        }

        fn from_worker_attributes(attributes: Args) -> Result<Self> {
            let [user, period]: [Value; 2] = attributes
                .try_into()
                .map_err(|_| anyhow!("expected two attributes"))?;
            Ok(Self {
                user: serde_json::from_value(user)?,
                period: serde_json::from_value(period)?,
            })
        }

        fn fields(&self) -> Fields {
            Fields::new()
                .with("user", self.user.clone())
                .with("period", self.period.clone())
        }

        fn is_valid(&self) -> bool {
            !self.user.is_empty()
        }

        fn perform(&mut self, ctx: &mut Context<'_>) -> Result<()> {
            ctx.emit("sent", args![self.user])?;
            Ok(())
        }
    }

    struct Recorder(Args);

    impl Recorder {
        fn on_fail(&mut self) -> Result<()> {
            EVENTS.with(|e| e.borrow_mut().push(("fail", self.0.clone())));
            Ok(())
        }
    }

    impl Listener for Recorder {
        fn construct(args: Args) -> Result<Self> {
            Ok(Self(args))
        }

        fn run(&mut self) -> Result<()> {
            EVENTS.with(|e| e.borrow_mut().push(("sent", self.0.clone())));
            Ok(())
        }
    }

    fn digest(user: &str) -> Digest {
        Digest {
            user: user.to_string(),
            period: "weekly".to_string(),
        }
    }

    fn runtime() -> Runtime {
        RuntimeBuilder::new()
            .declare::<Background<Digest>>(|t| {
                t.listen::<Recorder>("sent", ListenerOptions::new())
                    .listen::<Recorder>("fail", ListenerOptions::new().method("on_fail", Recorder::on_fail));
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_inline_performs_and_dispatches() {
        let outcome = runtime().run(Background::inline(digest("ada"))).unwrap();

        assert_eq!(outcome, BackgroundOutcome::Performed);
        EVENTS.with(|e| assert_eq!(*e.borrow(), vec![("sent", vec![json!("ada")])]));
    }

    #[test]
    fn test_invalid_emits_fail_without_performing() {
        let spy = SpyWorker::new();
        let service = Background::new(digest(""), BackgroundOptions::deferred(None), Arc::new(spy.clone()));

        let outcome = runtime().run(service).unwrap();

        assert_eq!(outcome, BackgroundOutcome::Invalid);
        assert_eq!(spy.job_count(), 0);
        EVENTS.with(|e| assert_eq!(*e.borrow(), vec![("fail", Args::new())]));
    }

    #[test]
    fn test_deferred_hands_attributes_to_worker() {
        let spy = SpyWorker::new();
        let service = Background::new(
            digest("ada"),
            BackgroundOptions::deferred(Some(Duration::from_secs(15))),
            Arc::new(spy.clone()),
        );

        let outcome = runtime().run(service).unwrap();

        let jobs = spy.jobs_of_type("digest:send");
        assert_eq!(jobs.len(), 1);
        assert_eq!(outcome, BackgroundOutcome::Scheduled(jobs[0].job.id));
        assert_eq!(jobs[0].delay, Duration::from_secs(15));
        assert_eq!(jobs[0].job.attributes, vec![json!("ada"), json!("weekly")]);
        EVENTS.with(|e| assert!(e.borrow().is_empty()));
    }

    #[test]
    fn test_deferred_uses_configured_default_delay() {
        let spy = SpyWorker::new();
        let service = Background::new(digest("ada"), BackgroundOptions::deferred(None), Arc::new(spy.clone()));

        runtime().run(service).unwrap();

        let job = spy.last_job_of_type("digest:send").unwrap();
        assert_eq!(job.delay, crate::config::DEFAULT_BACKGROUND_DELAY);
        assert_eq!(job.job.delay_secs, 300);
        assert_eq!(job.job.run_at(), job.job.enqueued_at + chrono::Duration::seconds(300));
    }

    #[test]
    fn test_no_worker_rejects_deferred() {
        let service = Background::new(digest("ada"), BackgroundOptions::deferred(None), Arc::new(NoOpWorker));
        let err = runtime().run(service).unwrap_err();
        assert!(err.to_string().contains("no worker configured"));
    }

    #[test]
    fn test_job_registry_rebuilds_and_performs() {
        let mut jobs = JobRegistry::new();
        jobs.register::<Digest>();
        assert!(jobs.has("digest:send"));

        let job = Job::new("digest:send", vec![json!("grace"), json!("daily")], Duration::ZERO);
        let outcome = jobs.perform(&runtime(), job).unwrap();

        assert_eq!(outcome, BackgroundOutcome::Performed);
        EVENTS.with(|e| assert_eq!(*e.borrow(), vec![("sent", vec![json!("grace")])]));
    }

    #[test]
    fn test_job_registry_unknown_type() {
        let jobs = JobRegistry::new();
        let job = Job::new("nope", vec![], Duration::ZERO);

        let err = jobs.perform(&runtime(), job).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WhisperError>(),
            Some(WhisperError::UnknownJobType(t)) if t == "nope"
        ));
    }

    #[test]
    #[should_panic(expected = "job already registered")]
    fn test_job_registry_duplicate_panics() {
        let mut jobs = JobRegistry::new();
        jobs.register::<Digest>().register::<Digest>();
    }

    #[test]
    fn test_job_serializes() {
        let job = Job::new("digest:send", vec![json!("ada")], Duration::from_secs(5));
        let encoded = serde_json::to_value(&job).unwrap();

        assert_eq!(encoded["job_type"], json!("digest:send"));
        assert_eq!(encoded["delay_secs"], json!(5));
        let decoded: Job = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, job);
    }

    static PERFORMED: AtomicUsize = AtomicUsize::new(0);

    struct Tick;

    impl BackgroundJob for Tick {
        const JOB_TYPE: &'static str = "tick";

        fn from_worker_attributes(_attributes: Args) -> Result<Self> {
            Ok(Tick)
        }

        fn perform(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
            PERFORMED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_worker_performs_after_delay() {
        let runtime = RuntimeBuilder::new().build().unwrap();
        let mut jobs = JobRegistry::new();
        jobs.register::<Tick>();
        let worker = TokioWorker::new(runtime.clone(), Arc::new(jobs)).unwrap();

        let service = Background::new(
            Tick,
            BackgroundOptions::deferred(Some(Duration::from_secs(30))),
            Arc::new(worker),
        );
        let outcome = runtime.run(service).unwrap();
        assert!(matches!(outcome, BackgroundOutcome::Scheduled(_)));

        // The spawned task must register its timer before the clock moves.
        settle().await;
        assert_eq!(PERFORMED.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(PERFORMED.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(PERFORMED.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_worker_rejects_unknown_jobs() {
        let runtime = RuntimeBuilder::new().build().unwrap();
        let worker = TokioWorker::new(runtime, Arc::new(JobRegistry::new())).unwrap();

        let err = worker
            .perform_in(Duration::ZERO, Job::new("tick", vec![], Duration::ZERO))
            .unwrap_err();
        assert!(err.to_string().contains("unknown job type"));
    }
}
