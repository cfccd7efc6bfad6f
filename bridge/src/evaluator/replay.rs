use super::{EventFlow, GeometrySink, RuleEvaluator};
use crate::attributes::AttributeSet;
use crate::encoder::GeometryEvent;
use crate::error::EvaluatorFault;
use crate::metadata::RuleAttributes;
use crate::shape::InitialShape;

/// Plays back a captured event stream regardless of the input shape. Used to
/// reproduce evaluator output offline and to feed hand-written streams in tests.
#[derive(Debug, Clone, Default)]
pub struct ReplayEvaluator {
    events: Vec<GeometryEvent>,
    defaults: RuleAttributes,
}

impl ReplayEvaluator {
    pub fn new(events: Vec<GeometryEvent>) -> Self {
        Self { events, defaults: RuleAttributes::default() }
    }

    /// Reads a stream captured with `serde_json::to_string(&events)`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn with_defaults(mut self, defaults: RuleAttributes) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn events(&self) -> &[GeometryEvent] {
        &self.events
    }
}

impl RuleEvaluator for ReplayEvaluator {
    fn evaluate(
        &self,
        _shape: &InitialShape,
        _attributes: &AttributeSet,
        sink: &mut dyn GeometrySink,
    ) -> Result<(), EvaluatorFault> {
        for event in &self.events {
            if sink.emit(event.clone()) == EventFlow::Stop {
                break;
            }
        }
        Ok(())
    }

    fn default_attributes(&self, _shape: &InitialShape) -> Result<RuleAttributes, EvaluatorFault> {
        Ok(self.defaults.clone())
    }
}
