//! Contract between the scheduler and a rule engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::attributes::AttributeSet;
use crate::encoder::GeometryEvent;
use crate::error::EvaluatorFault;
use crate::metadata::RuleAttributes;
use crate::shape::InitialShape;

mod extrude;
mod replay;

pub use extrude::ExtrusionEvaluator;
pub use replay::ReplayEvaluator;

/// Answer to every emitted event. `Stop` means the request was cancelled or the
/// stream is already broken, and the evaluator should return as soon as it can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Stop,
}

/// Receiver of a rule evaluation's output.
pub trait GeometrySink {
    fn emit(&mut self, event: GeometryEvent) -> EventFlow;
}

/// Records every event, for capture and replay.
impl GeometrySink for Vec<GeometryEvent> {
    fn emit(&mut self, event: GeometryEvent) -> EventFlow {
        self.push(event);
        EventFlow::Continue
    }
}

/// A rule engine. One invocation runs on one worker thread at a time; separate
/// invocations may run concurrently, so implementations share no mutable state
/// between calls.
///
/// Shapes arrive in engine coordinates (Y up, outlines counter-clockwise seen from
/// above). The stream must end with [`GeometryEvent::Done`] unless the sink said
/// `Stop`.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(
        &self,
        shape: &InitialShape,
        attributes: &AttributeSet,
        sink: &mut dyn GeometrySink,
    ) -> Result<(), EvaluatorFault>;

    /// Rule defaults for `shape` and how to edit them, for hosts that display
    /// parameters.
    fn default_attributes(&self, _shape: &InitialShape) -> Result<RuleAttributes, EvaluatorFault> {
        Ok(RuleAttributes::default())
    }
}

/// Cooperative cancellation flag shared between a request and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }
}
