use thiserror::Error;

use crate::attributes::AttributeKind;

/// Rejected input polygon. Reported synchronously from `submit`, no request is created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidShapeError {
    #[error("initial shape has no faces")]
    Empty,
    #[error("face {face} ring {ring} has {count} distinct vertices, at least 3 are required")]
    TooFewVertices { face: usize, ring: usize, count: usize },
    #[error("face {face} ring {ring} has a zero-length edge at vertex {vertex}")]
    DegenerateEdge { face: usize, ring: usize, vertex: usize },
    #[error("face {face} ring {ring} has a non-finite coordinate at vertex {vertex}")]
    NonFinite { face: usize, ring: usize, vertex: usize },
    #[error("face {face} is not planar (deviation {deviation:.6})")]
    NonPlanar { face: usize, deviation: f64 },
    #[error("face {face} ring {ring} intersects itself between edges {first} and {second}")]
    SelfIntersecting { face: usize, ring: usize, first: usize, second: usize },
    #[error("shape area {area:.6} is below the minimum of {minimum:.6}")]
    BelowMinimumArea { area: f64, minimum: f64 },
    #[error("start rule name is empty")]
    MissingStartRule,
    #[error("footprint mesh index {index} is out of range for {vertex_count} vertices")]
    MeshIndexOutOfRange { index: u32, vertex_count: usize },
    #[error("footprint mesh outline is not a simple loop at vertex {index}")]
    NonManifoldOutline { index: u32 },
}

/// The evaluator's event stream broke the structural contract.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    #[error("face batch {batch} references vertex {index} but only {vertex_count} vertices were sent")]
    IndexOutOfRange { batch: usize, index: u32, vertex_count: usize },
    #[error("face batch {batch}: face vertex counts sum to {expected} but {actual} indices were sent")]
    FaceCountMismatch { batch: usize, expected: usize, actual: usize },
    #[error("face batch {batch}: face {face} has {corners} corners, at least 3 are required")]
    DegenerateFace { batch: usize, face: usize, corners: u32 },
    #[error("face batch {batch}: uv set {set} has {actual} coordinates, expected {expected}")]
    UvLengthMismatch { batch: usize, set: usize, expected: usize, actual: usize },
    #[error("face batch {batch}: uv set count {actual} differs from earlier batches of the same material ({expected})")]
    UvSetCountMismatch { batch: usize, expected: usize, actual: usize },
    #[error("vertex batch {batch} has {normals} normals for {positions} positions")]
    NormalLengthMismatch { batch: usize, positions: usize, normals: usize },
    #[error("vertex batch {batch} contains a non-finite coordinate")]
    NonFiniteVertex { batch: usize },
    #[error("event received after Done")]
    EventAfterDone,
    #[error("event stream ended without Done")]
    MissingDone,
}

/// Fault raised by the rule evaluator itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluatorFault {
    #[error("failed to load rule package '{package}': {reason}")]
    RulePackageLoad { package: String, reason: String },
    #[error("rule package '{package}' has no start rule '{rule}'")]
    UnsupportedStartRule { package: String, rule: String },
    #[error("asset resolution failed for '{asset}': {reason}")]
    AssetResolution { asset: String, reason: String },
    #[error("evaluator error: {0}")]
    Internal(String),
}

/// Terminal failure of one generation request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Evaluator(#[from] EvaluatorFault),
    #[error("evaluator panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttributeError {
    #[error("attribute '{name}' holds a {existing} value, cannot store a {attempted}")]
    TypeMismatch { name: String, existing: AttributeKind, attempted: AttributeKind },
    #[error("attribute name is empty")]
    EmptyName,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("invalid RON config: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config extension '{0}', expected .ron or .json")]
    UnsupportedFormat(String),
    #[error("invalid config value: {0}")]
    Invalid(String),
}
