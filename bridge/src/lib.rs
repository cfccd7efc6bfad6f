//! Drives a rule-based shape grammar engine off the host thread and turns its
//! geometry stream into host-ready mesh descriptors.
//!
//! A host builds an [`InitialShape`] and an [`AttributeSet`], hands them to a
//! [`GenerationScheduler`], and drains finished [`GenerationOutcome`]s on its own
//! thread. Newer submissions for the same shape supersede older ones, and
//! finished results are memoized in a [`ResultCache`].

pub mod attributes;
pub mod cache;
pub mod config;
pub mod coords;
pub mod encoder;
pub mod error;
pub mod evaluator;
mod fingerprint;
pub mod metadata;
pub mod request;
pub mod scheduler;
pub mod shape;

pub use attributes::{AttributeKind, AttributeSet, AttributeValue};
pub use cache::{CacheConfig, CacheKey, CacheStats, ResultCache};
pub use config::BridgeConfig;
pub use coords::{CoordinateRemap, SignedAxis};
pub use encoder::{
    BlendMode, EncoderConfig, GeneratedMeshDescriptor, GeometryEncoder, GeometryEvent, GeometryGroup,
    InstancePlacement, MaterialTag, Report, Severity, WeldPolicy, WELD_REPORT_KEY,
};
pub use error::{AttributeError, ConfigError, EncodingError, EvaluatorFault, GenerationError, InvalidShapeError};
pub use evaluator::{CancellationToken, EventFlow, ExtrusionEvaluator, GeometrySink, ReplayEvaluator, RuleEvaluator};
pub use fingerprint::Fingerprint;
pub use metadata::{AttributeAnnotation, AttributeMetadata, RuleAttributes};
pub use request::{RequestHandle, RequestId, RequestState, SlotKey};
pub use scheduler::{
    DefaultAttributesHandle, GenerationOutcome, GenerationResult, GenerationScheduler, GenerationThreadPool,
    SchedulerStats,
};
pub use shape::{InitialShape, RulePackageRef, ShapeFace, ShapeKey};
