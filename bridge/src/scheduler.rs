use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bevy_tasks::{TaskPool, TaskPoolBuilder};
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use glam::DVec3;
use tracing::{debug, info, warn};

use crate::attributes::AttributeSet;
use crate::cache::{CacheKey, ResultCache};
use crate::config::BridgeConfig;
use crate::encoder::{GeneratedMeshDescriptor, GeometryEncoder, GeometryEvent};
use crate::error::{ConfigError, EncodingError, GenerationError, InvalidShapeError};
use crate::evaluator::{CancellationToken, EventFlow, GeometrySink, RuleEvaluator};
use crate::metadata::RuleAttributes;
use crate::request::{GenerationRequest, RequestHandle, RequestId, RequestState, SlotKey};
use crate::shape::{InitialShape, RulePackageRef};

/// Fixed-size pool running rule evaluations off the host thread.
pub struct GenerationThreadPool {
    pool: Arc<TaskPool>,
    thread_count: usize,
}

impl GenerationThreadPool {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        info!("Creating generation thread pool with {} threads", thread_count);

        let pool = TaskPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name("procgen_worker".to_string())
            .build();
        Self {
            pool: Arc::new(pool),
            thread_count,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn run(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(async move { job() }).detach();
    }
}

/// Terminal result delivered to the host. Cancelled requests never produce one.
#[derive(Debug, Clone)]
pub enum GenerationResult {
    Completed {
        descriptor: Arc<GeneratedMeshDescriptor>,
        from_cache: bool,
    },
    Failed(GenerationError),
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub request: RequestId,
    pub slot: SlotKey,
    pub result: GenerationResult,
}

/// Pending answer of [`GenerationScheduler::load_default_attributes_async`].
pub struct DefaultAttributesHandle {
    result: Receiver<Result<RuleAttributes, GenerationError>>,
}

impl DefaultAttributesHandle {
    /// The answer if it has arrived. Returns `None` again after it was taken.
    pub fn try_get(&self) -> Option<Result<RuleAttributes, GenerationError>> {
        self.result.try_recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<RuleAttributes, GenerationError>> {
        self.result.recv_timeout(timeout).ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub rejected: u64,
    pub cache_hits: u64,
    pub superseded: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    cache_hits: AtomicU64,
    superseded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Shared {
    evaluator: Arc<dyn RuleEvaluator>,
    config: BridgeConfig,
    cache: ResultCache,
    /// At most one active request per slot.
    slots: DashMap<SlotKey, GenerationRequest>,
    completed: Sender<GenerationOutcome>,
    counters: Counters,
}

struct Job {
    request: GenerationRequest,
    shape: InitialShape,
    attributes: AttributeSet,
}

/// Streams evaluator output into an encoder and turns cancellation and broken
/// streams into `Stop`.
struct EncoderSink<'a> {
    encoder: GeometryEncoder,
    token: &'a CancellationToken,
    error: Option<EncodingError>,
}

impl GeometrySink for EncoderSink<'_> {
    fn emit(&mut self, event: GeometryEvent) -> EventFlow {
        if self.token.is_cancelled() || self.error.is_some() {
            return EventFlow::Stop;
        }
        match self.encoder.push(event) {
            Ok(()) => EventFlow::Continue,
            Err(err) => {
                self.error = Some(err);
                EventFlow::Stop
            }
        }
    }
}

/// Runs generations with per-slot supersession, a shared result cache and a
/// handoff queue that the host drains on its own thread.
pub struct GenerationScheduler {
    shared: Arc<Shared>,
    pool: GenerationThreadPool,
    outcomes: Receiver<GenerationOutcome>,
    next_id: AtomicU64,
}

impl GenerationScheduler {
    /// Fails when `config` does not validate; no worker is started then.
    pub fn new(evaluator: Arc<dyn RuleEvaluator>, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (completed, outcomes) = channel::unbounded();
        let pool = GenerationThreadPool::new(config.worker_threads);
        let shared = Arc::new(Shared {
            evaluator,
            cache: ResultCache::new(config.cache.clone()),
            config,
            slots: DashMap::new(),
            completed,
            counters: Counters::default(),
        });
        Ok(Self {
            shared,
            pool,
            outcomes,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.shared.cache
    }

    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }

    /// Validates `shape` and schedules it with `attributes` layered over the
    /// shape's own overrides. Returns without waiting for evaluation. An invalid
    /// shape is rejected here and no request exists for it.
    pub fn submit(&self, shape: InitialShape, attributes: AttributeSet) -> Result<RequestHandle, InvalidShapeError> {
        if let Err(err) = shape.validate(self.shared.config.min_shape_area) {
            bump(&self.shared.counters.rejected);
            debug!("rejected shape: {}", err);
            return Err(err);
        }

        let shape = shape.normalized();
        let attributes = shape.attributes().overlay(&attributes);
        let shape_fp = shape.fingerprint();
        let cache_key = CacheKey {
            shape: shape_fp,
            attributes: attributes.fingerprint(),
            package: shape.rule_package().id_fingerprint(),
            rule_version: shape.rule_package().version,
        };
        let slot = shape.key().map_or(SlotKey::Shape(shape_fp), SlotKey::Host);
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = GenerationRequest::new(id, slot, cache_key);
        let handle = request.handle();
        bump(&self.shared.counters.submitted);

        if let Some(descriptor) = self.shared.cache.lookup(&cache_key) {
            if let Some((_, previous)) = self.shared.slots.remove(&slot) {
                self.supersede(&previous);
            }
            bump(&self.shared.counters.cache_hits);
            debug!("request {} for {} served from cache", id, slot);
            request.cell.complete(Arc::clone(&descriptor), true);
            self.shared.deliver(id, slot, GenerationResult::Completed { descriptor, from_cache: true });
            return Ok(handle);
        }

        match self.shared.slots.entry(slot) {
            Entry::Occupied(mut entry) => {
                self.supersede(entry.get());
                entry.insert(request.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(request.clone());
            }
        }
        debug!("request {} queued for {}", id, slot);

        let shared = Arc::clone(&self.shared);
        let job = Job { request, shape, attributes };
        self.pool.run(move || shared.run(job));
        Ok(handle)
    }

    fn supersede(&self, previous: &GenerationRequest) {
        if previous.supersede() {
            bump(&self.shared.counters.superseded);
            debug!("request {} for {} superseded", previous.id, previous.slot);
        }
    }

    /// Cancels the active request of `slot`, if any.
    pub fn cancel(&self, slot: &SlotKey) -> bool {
        match self.shared.slots.remove(slot) {
            Some((_, request)) => {
                self.supersede(&request);
                true
            }
            None => false,
        }
    }

    /// Cancels everything in flight. Queued outcomes stay drainable.
    pub fn shutdown(&self) {
        let slots: Vec<SlotKey> = self.shared.slots.iter().map(|e| *e.key()).collect();
        let cancelled = slots.iter().filter(|slot| self.cancel(slot)).count();
        if cancelled > 0 {
            info!("generation scheduler shut down, {} requests cancelled", cancelled);
        }
    }

    pub fn is_generating(&self) -> bool {
        !self.shared.slots.is_empty()
    }

    pub fn is_generating_slot(&self, slot: &SlotKey) -> bool {
        self.shared.slots.contains_key(slot)
    }

    /// Hands up to `max_completions_per_drain` outcomes to `on_outcome` on the
    /// calling thread. Returns how many were handed over.
    pub fn drain_completed(&self, mut on_outcome: impl FnMut(GenerationOutcome)) -> usize {
        let budget = self.shared.config.max_completions_per_drain;
        let mut drained = 0;
        while drained < budget {
            match self.outcomes.try_recv() {
                Ok(outcome) => {
                    on_outcome(outcome);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Blocks for the next outcome. For tests and batch tools.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<GenerationOutcome> {
        self.outcomes.recv_timeout(timeout).ok()
    }

    /// Rule defaults and their metadata for `shape`, asked of the evaluator on
    /// the calling thread.
    pub fn load_default_attributes(&self, shape: &InitialShape) -> Result<RuleAttributes, GenerationError> {
        self.shared.default_attributes(shape)
    }

    /// Like [`GenerationScheduler::load_default_attributes`], but on a worker so
    /// the host thread never blocks on rule loading.
    pub fn load_default_attributes_async(&self, shape: InitialShape) -> DefaultAttributesHandle {
        let (sender, result) = channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        self.pool.run(move || {
            // the host may have dropped the handle already
            let _ = sender.send(shared.default_attributes(&shape));
        });
        DefaultAttributesHandle { result }
    }

    /// Every rule package moved to at least `rule_version`: older cached results
    /// are dropped and late ones are not cached.
    pub fn invalidate_rule_version(&self, rule_version: u64) -> usize {
        self.shared.cache.invalidate_all(rule_version)
    }

    /// `package` was reloaded: its older cached results are dropped. Other
    /// packages keep theirs.
    pub fn invalidate_rule_package(&self, package: &RulePackageRef) -> usize {
        self.shared.cache.invalidate_package(package.id_fingerprint(), package.version)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight: self.shared.slots.len(),
        }
    }
}

impl Drop for GenerationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn engine_shape(&self, shape: &InitialShape) -> InitialShape {
        shape.normalized().to_engine(&self.config.coordinates).oriented_up(DVec3::Y)
    }

    fn default_attributes(&self, shape: &InitialShape) -> Result<RuleAttributes, GenerationError> {
        let engine_shape = self.engine_shape(shape);
        match panic::catch_unwind(AssertUnwindSafe(|| self.evaluator.default_attributes(&engine_shape))) {
            Ok(result) => Ok(result?),
            Err(payload) => Err(GenerationError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    fn deliver(&self, request: RequestId, slot: SlotKey, result: GenerationResult) {
        // the receiver lives in the scheduler; after it is gone nobody is listening
        let _ = self.completed.send(GenerationOutcome { request, slot, result });
    }

    fn evaluate(&self, job: &Job) -> Option<Result<GeneratedMeshDescriptor, GenerationError>> {
        let request = &job.request;
        let shape = self.engine_shape(&job.shape);
        let mut sink = EncoderSink {
            encoder: GeometryEncoder::new(self.config.encoder.clone(), self.config.coordinates),
            token: &request.token,
            error: None,
        };

        let evaluated = panic::catch_unwind(AssertUnwindSafe(|| {
            self.evaluator.evaluate(&shape, &job.attributes, &mut sink)
        }));
        if request.token.is_cancelled() {
            return None;
        }
        let result = match evaluated {
            Err(payload) => Err(GenerationError::Panicked(panic_message(payload.as_ref()))),
            Ok(Err(fault)) => Err(fault.into()),
            Ok(Ok(())) => match sink.error {
                Some(err) => Err(err.into()),
                None => sink.encoder.finalize().map_err(Into::into),
            },
        };
        Some(result)
    }

    fn run(&self, job: Job) {
        let request = &job.request;
        if !request.cell.transition(RequestState::Queued, RequestState::Running) {
            debug!("request {} cancelled before it started", request.id);
            return;
        }

        let Some(result) = self.evaluate(&job) else {
            debug!("request {} cancelled, partial output discarded", request.id);
            return;
        };

        // Completion and supersession serialize on the slot entry, so only the
        // slot's current request can finish. Its outcome is queued before the
        // entry is released, ahead of any newer request's outcome.
        let Entry::Occupied(entry) = self.slots.entry(request.slot) else {
            request.cell.cancel();
            return;
        };
        if entry.get().id != request.id {
            request.cell.cancel();
            return;
        }

        match result {
            Ok(descriptor) => {
                let descriptor = Arc::new(descriptor);
                self.cache.insert(request.cache_key, Arc::clone(&descriptor));
                bump(&self.counters.completed);
                info!(
                    "request {} for {} completed: {} triangles, {} instances",
                    request.id,
                    request.slot,
                    descriptor.triangle_count(),
                    descriptor.instances.len()
                );
                self.deliver(
                    request.id,
                    request.slot,
                    GenerationResult::Completed {
                        descriptor: Arc::clone(&descriptor),
                        from_cache: false,
                    },
                );
                entry.remove();
                request.cell.complete(descriptor, false);
            }
            Err(err) => {
                bump(&self.counters.failed);
                warn!("request {} for {} failed: {}", request.id, request.slot, err);
                self.deliver(request.id, request.slot, GenerationResult::Failed(err.clone()));
                entry.remove();
                request.cell.fail(err);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
