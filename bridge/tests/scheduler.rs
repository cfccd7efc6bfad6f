use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use glam::DVec3;
use procgen_bridge::{
    AttributeAnnotation, AttributeSet, BridgeConfig, CacheConfig, ConfigError, CoordinateRemap, EncodingError, EvaluatorFault, ExtrusionEvaluator,
    GenerationError, GenerationOutcome, GenerationResult, GenerationScheduler, GeometryEvent, GeometrySink,
    InitialShape, InvalidShapeError, MaterialTag, ReplayEvaluator, RequestState, RuleEvaluator, RulePackageRef,
    ShapeKey, SlotKey,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks every evaluation until the test drops the gate sender.
struct GatedEvaluator {
    inner: ExtrusionEvaluator,
    started: Sender<()>,
    gate: Receiver<()>,
}

impl RuleEvaluator for GatedEvaluator {
    fn evaluate(
        &self,
        shape: &InitialShape,
        attributes: &AttributeSet,
        sink: &mut dyn GeometrySink,
    ) -> Result<(), EvaluatorFault> {
        let _ = self.started.send(());
        let _ = self.gate.recv_timeout(TIMEOUT);
        self.inner.evaluate(shape, attributes, sink)
    }
}

/// Returns the scheduler, a receiver of evaluation starts, and the gate.
fn gated(config: BridgeConfig) -> (GenerationScheduler, Receiver<()>, Sender<()>) {
    let (started_tx, started_rx) = channel::unbounded();
    let (gate_tx, gate_rx) = channel::unbounded();
    let evaluator = GatedEvaluator {
        inner: ExtrusionEvaluator::default(),
        started: started_tx,
        gate: gate_rx,
    };
    (GenerationScheduler::new(Arc::new(evaluator), config).unwrap(), started_rx, gate_tx)
}

struct Panicking;

impl RuleEvaluator for Panicking {
    fn evaluate(&self, _: &InitialShape, _: &AttributeSet, _: &mut dyn GeometrySink) -> Result<(), EvaluatorFault> {
        panic!("rule crashed");
    }
}

fn config() -> BridgeConfig {
    BridgeConfig { worker_threads: 2, ..BridgeConfig::default() }
}

fn triangle() -> InitialShape {
    InitialShape::new(
        vec![DVec3::new(0.0, 0.0, 0.0), DVec3::new(4.0, 0.0, 0.0), DVec3::new(0.0, 0.0, -4.0)],
        RulePackageRef::new("extrude", 1),
        "Lot",
    )
}

fn square(offset: f64) -> InitialShape {
    InitialShape::new(
        vec![
            DVec3::new(offset, 0.0, 0.0),
            DVec3::new(offset + 3.0, 0.0, 0.0),
            DVec3::new(offset + 3.0, 0.0, -3.0),
            DVec3::new(offset, 0.0, -3.0),
        ],
        RulePackageRef::new("extrude", 1),
        "Lot",
    )
}

fn attributes(height: f64) -> AttributeSet {
    AttributeSet::new()
        .with("height", height)
        .and_then(|s| s.with("windows", true))
        .and_then(|s| s.with("wallColor", "#aa8866"))
        .unwrap()
}

fn drain_all(scheduler: &GenerationScheduler) -> Vec<GenerationOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = scheduler.recv_timeout(Duration::from_millis(200)) {
        outcomes.push(outcome);
    }
    outcomes
}

fn failure(outcome: &GenerationOutcome) -> &GenerationError {
    match &outcome.result {
        GenerationResult::Failed(err) => err,
        GenerationResult::Completed { .. } => panic!("expected a failure, got a completion"),
    }
}

#[test]
fn resubmission_supersedes_running_request() {
    let (scheduler, started, gate) = gated(config());

    let first = scheduler.submit(triangle(), attributes(10.0)).unwrap();
    started.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.state(), RequestState::Running);

    let second = scheduler.submit(triangle(), attributes(12.0)).unwrap();
    assert_eq!(first.state(), RequestState::Cancelled);
    assert_eq!(first.slot(), second.slot());
    drop(gate);

    assert_eq!(second.wait_timeout(TIMEOUT), RequestState::Completed);
    assert_eq!(first.state(), RequestState::Cancelled);

    let outcomes = drain_all(&scheduler);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].request, second.id());

    let cache = scheduler.cache();
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&second.cache_key()));
    assert!(!cache.contains(&first.cache_key()));
    assert_eq!(second.cache_key().attributes, attributes(12.0).fingerprint());
}

#[test]
fn only_the_latest_of_many_submissions_completes() {
    let (scheduler, started, gate) = gated(config());

    let handles: Vec<_> = (0..5)
        .map(|i| scheduler.submit(square(0.0), attributes(10.0 + i as f64)).unwrap())
        .collect();
    started.recv_timeout(TIMEOUT).unwrap();
    drop(gate);

    let (last, earlier) = handles.split_last().unwrap();
    assert_eq!(last.wait_timeout(TIMEOUT), RequestState::Completed);
    for handle in earlier {
        assert_eq!(handle.state(), RequestState::Cancelled);
    }

    let outcomes = drain_all(&scheduler);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].request, last.id());
    assert_eq!(scheduler.stats().superseded, 4);
    assert!(!scheduler.is_generating());
}

#[test]
fn cache_hit_completes_without_evaluation() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();

    let first = scheduler.submit(square(0.0), attributes(8.0)).unwrap();
    assert_eq!(first.wait_timeout(TIMEOUT), RequestState::Completed);
    assert!(!first.from_cache());

    // same content built in another order
    let reordered = AttributeSet::new()
        .with("wallColor", "#aa8866")
        .and_then(|s| s.with("windows", true))
        .and_then(|s| s.with("height", 8.0))
        .unwrap();
    let second = scheduler.submit(square(0.0), reordered).unwrap();
    assert_eq!(second.state(), RequestState::Completed);
    assert!(second.from_cache());
    assert_eq!(first.descriptor(), second.descriptor());

    let outcomes = drain_all(&scheduler);
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[1].result, GenerationResult::Completed { from_cache: true, .. }));
    assert_eq!(scheduler.stats().cache_hits, 1);
}

#[test]
fn invalid_shape_never_becomes_a_request() {
    let scheduler = GenerationScheduler::new(
        Arc::new(ExtrusionEvaluator::default()),
        BridgeConfig { min_shape_area: 1.0, ..config() },
    )
    .unwrap();
    let tiny = InitialShape::new(
        vec![DVec3::ZERO, DVec3::new(0.5, 0.0, 0.0), DVec3::new(0.0, 0.0, -0.5)],
        RulePackageRef::new("extrude", 1),
        "Lot",
    );

    let err = scheduler.submit(tiny, AttributeSet::new()).unwrap_err();
    assert!(matches!(err, InvalidShapeError::BelowMinimumArea { .. }));
    assert!(!scheduler.is_generating());
    assert_eq!(scheduler.stats().submitted, 0);
    assert_eq!(scheduler.stats().rejected, 1);
    assert!(drain_all(&scheduler).is_empty());
}

#[test]
fn evaluator_fault_fails_request_without_caching() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    let shape = InitialShape::new(square(0.0).faces()[0].vertices.clone(), RulePackageRef::new("extrude", 1), "Tower");

    let handle = scheduler.submit(shape, AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Failed);
    assert!(matches!(
        handle.error(),
        Some(GenerationError::Evaluator(EvaluatorFault::UnsupportedStartRule { .. }))
    ));

    let outcomes = drain_all(&scheduler);
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(failure(&outcomes[0]), GenerationError::Evaluator(_)));
    assert!(scheduler.cache().is_empty());
}

#[test]
fn evaluator_panic_is_contained() {
    let scheduler = GenerationScheduler::new(Arc::new(Panicking), config()).unwrap();
    let handle = scheduler.submit(square(0.0), AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Failed);
    match handle.error() {
        Some(GenerationError::Panicked(message)) => assert!(message.contains("rule crashed")),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(scheduler.cache().is_empty());

    // the pool survives and keeps serving
    let again = scheduler.submit(square(5.0), AttributeSet::new()).unwrap();
    assert_eq!(again.wait_timeout(TIMEOUT), RequestState::Failed);
}

#[test]
fn out_of_range_index_fails_with_encoding_error() {
    let events = vec![
        GeometryEvent::VertexBatch {
            positions: vec![DVec3::ZERO, DVec3::X, DVec3::new(1.0, 0.0, -1.0), DVec3::NEG_Z],
            normals: None,
        },
        GeometryEvent::FaceBatch {
            material: MaterialTag::named("wall"),
            indices: vec![0, 1, 10],
            face_vertex_counts: vec![3],
            uv_sets: Vec::new(),
        },
        GeometryEvent::Done,
    ];
    let scheduler = GenerationScheduler::new(Arc::new(ReplayEvaluator::new(events)), config()).unwrap();

    let handle = scheduler.submit(triangle(), AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Failed);
    assert!(matches!(
        handle.error(),
        Some(GenerationError::Encoding(EncodingError::IndexOutOfRange { index: 10, vertex_count: 4, .. }))
    ));
    assert!(scheduler.cache().is_empty());
}

#[test]
fn stream_without_done_fails() {
    let events = vec![GeometryEvent::VertexBatch { positions: vec![DVec3::ZERO], normals: None }];
    let scheduler = GenerationScheduler::new(Arc::new(ReplayEvaluator::new(events)), config()).unwrap();
    let handle = scheduler.submit(triangle(), AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Failed);
    assert_eq!(handle.error(), Some(GenerationError::Encoding(EncodingError::MissingDone)));
}

#[test]
fn drain_respects_per_call_budget() {
    let scheduler = GenerationScheduler::new(
        Arc::new(ExtrusionEvaluator::default()),
        BridgeConfig { max_completions_per_drain: 2, ..config() },
    )
    .unwrap();
    let handles: Vec<_> = (0..3)
        .map(|i| scheduler.submit(square(i as f64 * 10.0), AttributeSet::new()).unwrap())
        .collect();
    for handle in &handles {
        assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Completed);
    }

    let mut seen = Vec::new();
    assert_eq!(scheduler.drain_completed(|o| seen.push(o.request)), 2);
    assert_eq!(scheduler.drain_completed(|o| seen.push(o.request)), 1);
    assert_eq!(scheduler.drain_completed(|o| seen.push(o.request)), 0);
    seen.sort();
    let mut expected: Vec<_> = handles.iter().map(|h| h.id()).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn explicit_cancel_is_silent() {
    let (scheduler, started, gate) = gated(config());
    let handle = scheduler.submit(square(0.0), AttributeSet::new()).unwrap();
    started.recv_timeout(TIMEOUT).unwrap();

    assert!(scheduler.is_generating_slot(&handle.slot()));
    assert!(scheduler.cancel(&handle.slot()));
    assert!(!scheduler.cancel(&handle.slot()));
    assert_eq!(handle.state(), RequestState::Cancelled);
    drop(gate);

    assert!(drain_all(&scheduler).is_empty());
    assert!(scheduler.cache().is_empty());
}

#[test]
fn host_key_groups_footprint_edits() {
    let (scheduler, started, gate) = gated(config());

    let before = scheduler.submit(square(0.0).with_key(ShapeKey(42)), AttributeSet::new()).unwrap();
    started.recv_timeout(TIMEOUT).unwrap();
    let after = scheduler.submit(square(1.0).with_key(ShapeKey(42)), AttributeSet::new()).unwrap();
    let unrelated = scheduler.submit(square(20.0), AttributeSet::new()).unwrap();
    drop(gate);

    assert_eq!(before.slot(), SlotKey::Host(ShapeKey(42)));
    assert_eq!(after.wait_timeout(TIMEOUT), RequestState::Completed);
    assert_eq!(unrelated.wait_timeout(TIMEOUT), RequestState::Completed);
    assert_eq!(before.state(), RequestState::Cancelled);
}

#[test]
fn rule_version_change_invalidates_results() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    let handle = scheduler.submit(square(0.0), AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Completed);
    assert_eq!(scheduler.cache().len(), 1);

    assert_eq!(scheduler.invalidate_rule_version(2), 1);
    assert!(scheduler.cache().is_empty());

    let upgraded = InitialShape::new(square(0.0).faces()[0].vertices.clone(), RulePackageRef::new("extrude", 2), "Lot");
    let handle = scheduler.submit(upgraded, AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Completed);
    assert!(!handle.from_cache());
    assert_eq!(scheduler.cache().len(), 1);
}

#[test]
fn newer_rule_versions_are_cached_after_invalidation() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    scheduler.invalidate_rule_version(2);

    let v3 = || InitialShape::new(square(0.0).faces()[0].vertices.clone(), RulePackageRef::new("extrude", 3), "Lot");
    let first = scheduler.submit(v3(), AttributeSet::new()).unwrap();
    assert_eq!(first.wait_timeout(TIMEOUT), RequestState::Completed);
    assert_eq!(scheduler.cache().len(), 1);

    let again = scheduler.submit(v3(), AttributeSet::new()).unwrap();
    assert_eq!(again.state(), RequestState::Completed);
    assert!(again.from_cache());
    assert_eq!(scheduler.cache().stats().rejected, 0);
}

#[test]
fn package_reload_drops_only_its_older_results() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    let handle = scheduler.submit(square(0.0), AttributeSet::new()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Completed);

    assert_eq!(scheduler.invalidate_rule_package(&RulePackageRef::new("other", 9)), 0);
    assert_eq!(scheduler.cache().len(), 1);
    assert_eq!(scheduler.invalidate_rule_package(&RulePackageRef::new("extrude", 2)), 1);
    assert!(scheduler.cache().is_empty());
}

#[test]
fn outcome_is_queued_before_the_handle_completes() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    for i in 0..20 {
        let first = scheduler.submit(square(0.0), attributes(5.0 + i as f64)).unwrap();
        assert_eq!(first.wait_timeout(TIMEOUT), RequestState::Completed);
        let mut queued = Vec::new();
        assert_eq!(scheduler.drain_completed(|o| queued.push(o.request)), 1);
        assert_eq!(queued, vec![first.id()]);

        // a cache hit queues only its own outcome
        let second = scheduler.submit(square(0.0), attributes(5.0 + i as f64)).unwrap();
        assert!(second.from_cache());
        let order: Vec<_> = drain_all(&scheduler).iter().map(|o| o.request).collect();
        assert_eq!(order, vec![second.id()]);
    }
}

#[test]
fn invalid_config_starts_no_scheduler() {
    let zero_cache = BridgeConfig {
        cache: CacheConfig { capacity: 0, ..CacheConfig::default() },
        ..config()
    };
    assert!(matches!(
        GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), zero_cache),
        Err(ConfigError::Invalid(_))
    ));
    let no_workers = BridgeConfig { worker_threads: 0, ..config() };
    assert!(GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), no_workers).is_err());
}

#[test]
fn default_attributes_come_from_the_evaluator() {
    let scheduler = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    let rule = scheduler.load_default_attributes(&square(0.0)).unwrap();
    assert_eq!(rule.defaults.get_float("height"), Some(10.0));
    assert_eq!(rule.defaults.get_bool("windows"), Some(true));
    assert_eq!(
        rule.metadata("wallColor").and_then(|m| m.annotation.clone()),
        Some(AttributeAnnotation::Color)
    );
}

#[test]
fn default_attributes_load_on_a_worker() {
    let (scheduler, started, gate) = gated(config());
    // a busy evaluation does not hold up the answer on the other worker
    let busy = scheduler.submit(square(0.0), AttributeSet::new()).unwrap();
    started.recv_timeout(TIMEOUT).unwrap();

    let pending = scheduler.load_default_attributes_async(square(0.0));
    let rule = pending.wait_timeout(TIMEOUT).unwrap().unwrap();
    assert!(rule.defaults.is_empty());
    assert!(pending.try_get().is_none());

    let foreign = InitialShape::new(square(0.0).faces()[0].vertices.clone(), RulePackageRef::new("other", 1), "Lot");
    let scheduler_ok = GenerationScheduler::new(Arc::new(ExtrusionEvaluator::default()), config()).unwrap();
    let refused = scheduler_ok.load_default_attributes_async(foreign).wait_timeout(TIMEOUT).unwrap();
    assert!(matches!(refused, Err(GenerationError::Evaluator(EvaluatorFault::RulePackageLoad { .. }))));

    drop(gate);
    assert_eq!(busy.wait_timeout(TIMEOUT), RequestState::Completed);
}

#[test]
fn results_arrive_in_host_coordinates() {
    let scheduler = GenerationScheduler::new(
        Arc::new(ExtrusionEvaluator::default()),
        BridgeConfig { coordinates: CoordinateRemap::z_up_centimeters(), ..config() },
    )
    .unwrap();
    // Z-up centimeter footprint, 4m x 3m
    let shape = InitialShape::new(
        vec![
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(400.0, 0.0, 0.0),
            DVec3::new(400.0, 300.0, 0.0),
            DVec3::new(0.0, 300.0, 0.0),
        ],
        RulePackageRef::new("extrude", 1),
        "Lot",
    );
    let handle = scheduler.submit(shape, AttributeSet::new().with("height", 6.0).unwrap()).unwrap();
    assert_eq!(handle.wait_timeout(TIMEOUT), RequestState::Completed);

    let descriptor = handle.descriptor().unwrap();
    let top = descriptor
        .groups
        .iter()
        .flat_map(|g| g.positions.iter())
        .map(|p| p.z)
        .fold(f32::MIN, f32::max);
    assert!((top - 600.0).abs() < 1e-3);
    let roof = descriptor.groups.iter().find(|g| g.material.name == "roof").unwrap();
    assert!(roof.normals.iter().all(|n| n.z > 0.99));
}
