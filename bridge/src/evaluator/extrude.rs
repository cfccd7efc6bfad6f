use std::time::Duration;

use glam::{DMat4, DQuat, DVec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{EventFlow, GeometrySink, RuleEvaluator};
use crate::attributes::{AttributeSet, AttributeValue};
use crate::encoder::{GeometryEvent, MaterialTag, Severity, WELD_REPORT_KEY};
use crate::error::EvaluatorFault;
use crate::metadata::{AttributeAnnotation, AttributeMetadata, RuleAttributes};
use crate::shape::InitialShape;

/// Tallest block the package builds, in meters.
const MAX_HEIGHT: f64 = 1000.0;
const MAX_FLOORS: u32 = 250;

/// Stops the evaluation when the sink asks for it.
macro_rules! emit {
    ($sink:expr, $delay:expr, $event:expr) => {
        if let Some(delay) = $delay {
            std::thread::sleep(delay);
        }
        if $sink.emit($event) == EventFlow::Stop {
            return Ok(());
        }
    };
}

/// Reference rule package: extrudes every face of the footprint into a block with
/// walls, a flat roof and window instances per floor.
///
/// Attributes: `height`, `heightVariation`, `floorHeight`, `windows`,
/// `windowAsset`, `wallColor`, `roofColor`.
#[derive(Debug, Clone)]
pub struct ExtrusionEvaluator {
    package_id: String,
    start_rules: Vec<String>,
    event_delay: Option<Duration>,
}

impl Default for ExtrusionEvaluator {
    fn default() -> Self {
        Self::new("extrude")
    }
}

struct Params {
    height: f64,
    floor_height: f64,
    windows: bool,
    window_asset: String,
    wall: MaterialTag,
    roof: MaterialTag,
}

impl ExtrusionEvaluator {
    pub fn new(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            start_rules: vec!["Lot".to_string(), "Building".to_string()],
            event_delay: None,
        }
    }

    /// Sleeps before every emitted event, to make evaluations slow enough to
    /// observe supersession.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    fn params(&self, shape: &InitialShape, attributes: &AttributeSet, sink: &mut dyn GeometrySink) -> Params {
        let defaults = self.defaults();
        let float = |name: &str, fallback: f64| {
            attributes
                .resolve(name, &defaults)
                .and_then(|v| v.as_float())
                .unwrap_or(fallback)
        };

        let mut height = float("height", 10.0);
        if !height.is_finite() || height.abs() > MAX_HEIGHT {
            sink.emit(GeometryEvent::Report {
                severity: Severity::Warning,
                message: format!("height {height} is outside ±{MAX_HEIGHT}, clamped"),
            });
            height = if height.is_nan() { 10.0 } else { height.clamp(-MAX_HEIGHT, MAX_HEIGHT) };
        }
        let variation = float("heightVariation", 0.0).abs();
        if variation.is_finite() && variation > 0.0 {
            let variation = variation.min(MAX_HEIGHT);
            let mut rng = StdRng::seed_from_u64(shape.random_seed() as u64);
            height = (height + rng.gen_range(-variation..=variation)).min(MAX_HEIGHT);
        }
        let floor_height = float("floorHeight", 3.0);
        let floor_height = if floor_height.is_finite() { floor_height.max(0.5) } else { 3.0 };

        let mut color = |name: &str| {
            let value = attributes.resolve(name, &defaults).and_then(|v| v.as_str()).unwrap_or("#ffffff");
            parse_hex_color(value).unwrap_or_else(|| {
                sink.emit(GeometryEvent::Report {
                    severity: Severity::Warning,
                    message: format!("{name}: '{value}' is not a #rrggbb color"),
                });
                [1.0, 1.0, 1.0, 1.0]
            })
        };
        let wall = MaterialTag::named("wall").with_color(color("wallColor"));
        let roof = MaterialTag::named("roof").with_color(color("roofColor"));

        Params {
            height,
            floor_height,
            windows: attributes
                .resolve("windows", &defaults)
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            window_asset: attributes
                .resolve("windowAsset", &defaults)
                .and_then(|v| v.as_str())
                .unwrap_or("window")
                .to_string(),
            wall,
            roof,
        }
    }

    fn defaults(&self) -> AttributeSet {
        let mut set = AttributeSet::new();
        let entries: [(&str, AttributeValue); 7] = [
            ("height", 10.0.into()),
            ("heightVariation", 0.0.into()),
            ("floorHeight", 3.0.into()),
            ("windows", true.into()),
            ("windowAsset", "window".into()),
            ("wallColor", "#d8cfc0".into()),
            ("roofColor", "#6b4e3d".into()),
        ];
        for (name, value) in entries {
            // names are distinct, set cannot fail
            let _ = set.set(name, value);
        }
        set
    }

    fn metadata(&self) -> RuleAttributes {
        let meters = |min: f64, max: f64| {
            AttributeMetadata::annotated(AttributeAnnotation::Range {
                min: Some(min),
                max: Some(max),
                step_size: 0.5,
                restricted: false,
            })
        };
        RuleAttributes::new(self.defaults())
            .with_metadata("height", meters(0.0, MAX_HEIGHT).ordered(0))
            .with_metadata("floorHeight", meters(0.5, 10.0).ordered(1))
            .with_metadata("heightVariation", meters(0.0, 50.0).in_group("Variation", 2))
            .with_metadata("windows", AttributeMetadata::default().in_group("Facade", 1).ordered(0))
            .with_metadata(
                "windowAsset",
                // logical asset names, so no extension filter
                AttributeMetadata::annotated(AttributeAnnotation::File { extensions: Vec::new() })
                    .in_group("Facade", 1)
                    .ordered(1),
            )
            .with_metadata(
                "wallColor",
                AttributeMetadata::annotated(AttributeAnnotation::Color).in_group("Facade", 1).ordered(2),
            )
            .with_metadata(
                "roofColor",
                AttributeMetadata::annotated(AttributeAnnotation::Color).in_group("Roof", 3),
            )
    }
}

impl RuleEvaluator for ExtrusionEvaluator {
    fn evaluate(
        &self,
        shape: &InitialShape,
        attributes: &AttributeSet,
        sink: &mut dyn GeometrySink,
    ) -> Result<(), EvaluatorFault> {
        if shape.rule_package().id != self.package_id {
            return Err(EvaluatorFault::RulePackageLoad {
                package: shape.rule_package().id.clone(),
                reason: format!("this evaluator serves '{}'", self.package_id),
            });
        }
        if !self.start_rules.iter().any(|r| r == shape.start_rule()) {
            return Err(EvaluatorFault::UnsupportedStartRule {
                package: self.package_id.clone(),
                rule: shape.start_rule().to_string(),
            });
        }

        let params = self.params(shape, attributes, sink);
        let delay = self.event_delay;
        if params.height <= 0.0 {
            emit!(sink, delay, GeometryEvent::Report {
                severity: Severity::Warning,
                message: format!("height {:.2} is not positive, emitting the flat footprint", params.height),
            });
        }
        let height = params.height.max(0.0);
        let floors = ((height / params.floor_height).floor().max(1.0) as u32).min(MAX_FLOORS);

        emit!(sink, delay, GeometryEvent::ReportValue { key: WELD_REPORT_KEY.into(), value: false.into() });
        emit!(sink, delay, GeometryEvent::ReportValue { key: "floors".into(), value: (floors as f64).into() });

        let mut base = 0u32;
        for (face_index, face) in shape.faces().iter().enumerate() {
            let up = DVec3::Y * height;

            // roof, fan triangulated, so only faces without holes get one
            if face.holes.is_empty() {
                let n = face.vertices.len();
                emit!(sink, delay, GeometryEvent::VertexBatch {
                    positions: face.vertices.iter().map(|v| *v + up).collect(),
                    normals: Some(vec![DVec3::Y; n]),
                });
                emit!(sink, delay, GeometryEvent::FaceBatch {
                    material: params.roof.clone(),
                    indices: (base..base + n as u32).collect(),
                    face_vertex_counts: vec![n as u32],
                    uv_sets: vec![face.vertices.iter().map(|v| [v.x, v.z]).collect()],
                });
                base += n as u32;
            } else {
                emit!(sink, delay, GeometryEvent::Report {
                    severity: Severity::Info,
                    message: format!("face {face_index} has holes, roof omitted"),
                });
            }

            if height == 0.0 {
                continue;
            }

            let rings = std::iter::once(&face.vertices).chain(face.holes.iter());
            for ring in rings {
                let mut positions = Vec::with_capacity(ring.len() * 4);
                let mut uvs = Vec::with_capacity(ring.len() * 4);
                let mut placements = Vec::new();
                for (i, a) in ring.iter().enumerate() {
                    let b = ring[(i + 1) % ring.len()];
                    let length = a.distance(b);
                    positions.extend_from_slice(&[*a, b, b + up, *a + up]);
                    uvs.extend_from_slice(&[[0.0, 0.0], [length, 0.0], [length, height], [0.0, height]]);

                    let outward = (b - *a).cross(DVec3::Y).normalize_or_zero();
                    if params.windows && length >= 2.0 && outward != DVec3::ZERO {
                        let rotation = DQuat::from_rotation_arc(DVec3::Z, outward);
                        let mid = (*a + b) * 0.5;
                        for floor in 0..floors {
                            let y = (floor as f64 + 0.5) * params.floor_height;
                            if y < height {
                                placements.push(DMat4::from_rotation_translation(rotation, mid + DVec3::Y * y));
                            }
                        }
                    }
                }

                let quads = ring.len() as u32;
                emit!(sink, delay, GeometryEvent::VertexBatch { positions, normals: None });
                emit!(sink, delay, GeometryEvent::FaceBatch {
                    material: params.wall.clone(),
                    indices: (base..base + quads * 4).collect(),
                    face_vertex_counts: vec![4; quads as usize],
                    uv_sets: vec![uvs],
                });
                base += quads * 4;

                for transform in placements {
                    emit!(sink, delay, GeometryEvent::InstancePlacement {
                        transform,
                        asset: params.window_asset.clone(),
                    });
                }
            }
        }

        emit!(sink, delay, GeometryEvent::Done);
        Ok(())
    }

    fn default_attributes(&self, shape: &InitialShape) -> Result<RuleAttributes, EvaluatorFault> {
        if shape.rule_package().id != self.package_id {
            return Err(EvaluatorFault::RulePackageLoad {
                package: shape.rule_package().id.clone(),
                reason: format!("this evaluator serves '{}'", self.package_id),
            });
        }
        Ok(self.metadata())
    }
}

/// `#rrggbb` to linear-ish RGBA in 0..1.
fn parse_hex_color(value: &str) -> Option<[f32; 4]> {
    let hex = value.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok().map(|c| c as f32 / 255.0);
    Some([channel(0)?, channel(2)?, channel(4)?, 1.0])
}
