use std::collections::{BTreeMap, HashMap};

use glam::{DMat4, DVec3, Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::attributes::AttributeValue;
use crate::coords::CoordinateRemap;
use crate::error::{ConfigError, EncodingError};

/// Report value through which an evaluator asks for vertex welding.
pub const WELD_REPORT_KEY: &str = "encoder.weld";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlendMode {
    Opaque,
    Masked,
    Translucent,
}

/// Surface description attached to a face batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialTag {
    pub name: String,
    pub base_color: [f32; 4],
    pub opacity: f32,
    pub texture: Option<String>,
    pub opacity_map: Option<String>,
}

impl MaterialTag {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_color: [1.0, 1.0, 1.0, 1.0],
            opacity: 1.0,
            texture: None,
            opacity_map: None,
        }
    }

    pub fn with_color(mut self, rgba: [f32; 4]) -> Self {
        self.base_color = rgba;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn with_texture(mut self, texture: impl Into<String>) -> Self {
        self.texture = Some(texture.into());
        self
    }

    pub fn with_opacity_map(mut self, map: impl Into<String>) -> Self {
        self.opacity_map = Some(map.into());
        self
    }

    /// An opacity map selects alpha masking, otherwise partial opacity selects
    /// blending.
    pub fn blend_mode(&self) -> BlendMode {
        if self.opacity_map.is_some() {
            BlendMode::Masked
        } else if self.opacity < 1.0 {
            BlendMode::Translucent
        } else {
            BlendMode::Opaque
        }
    }

    fn key(&self) -> MaterialKey {
        let [r, g, b, a] = self.base_color.map(f32::to_bits);
        MaterialKey {
            name: self.name.clone(),
            texture: self.texture.clone(),
            opacity_map: self.opacity_map.clone(),
            scalars: [r, g, b, a, self.opacity.to_bits()],
        }
    }
}

/// Total order over materials; group output follows it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MaterialKey {
    name: String,
    texture: Option<String>,
    opacity_map: Option<String>,
    scalars: [u32; 5],
}

/// One step of an evaluator's output, in engine coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GeometryEvent {
    /// Appends to the evaluation-wide vertex pool. Normals, when present, pair up
    /// with positions.
    VertexBatch {
        positions: Vec<DVec3>,
        normals: Option<Vec<DVec3>>,
    },
    /// Polygons indexing the vertex pool. `uv_sets` hold one coordinate per corner.
    FaceBatch {
        material: MaterialTag,
        indices: Vec<u32>,
        face_vertex_counts: Vec<u32>,
        uv_sets: Vec<Vec<[f64; 2]>>,
    },
    InstancePlacement {
        transform: DMat4,
        asset: String,
    },
    Report {
        severity: Severity,
        message: String,
    },
    ReportValue {
        key: String,
        value: AttributeValue,
    },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WeldPolicy {
    /// Weld only when the evaluator reports `encoder.weld = true`.
    #[default]
    Evaluator,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Engine-space tolerance for welding position, normal and UV.
    pub weld_epsilon: f64,
    pub weld_policy: WeldPolicy,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            weld_epsilon: 1e-5,
            weld_policy: WeldPolicy::Evaluator,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.weld_epsilon.is_finite() && self.weld_epsilon > 0.0) {
            return Err(ConfigError::Invalid(format!("weld epsilon must be positive, got {}", self.weld_epsilon)));
        }
        Ok(())
    }
}

/// Triangles of one material, in host coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryGroup {
    pub material: MaterialTag,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uv_sets: Vec<Vec<Vec2>>,
    pub indices: Vec<u32>,
}

impl GeometryGroup {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePlacement {
    pub transform: Mat4,
    pub asset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub severity: Severity,
    pub message: String,
}

/// Immutable result of one evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeneratedMeshDescriptor {
    pub groups: Vec<GeometryGroup>,
    pub instances: Vec<InstancePlacement>,
    pub reports: Vec<Report>,
    pub report_values: BTreeMap<String, AttributeValue>,
}

impl GeneratedMeshDescriptor {
    pub fn vertex_count(&self) -> usize {
        self.groups.iter().map(|g| g.positions.len()).sum()
    }

    pub fn index_count(&self) -> usize {
        self.groups.iter().map(|g| g.indices.len()).sum()
    }

    pub fn triangle_count(&self) -> usize {
        self.index_count() / 3
    }

    pub fn has_errors(&self) -> bool {
        self.reports.iter().any(|r| r.severity == Severity::Error)
    }

    /// Rough heap footprint, used for the cache byte budget.
    pub fn approx_size_bytes(&self) -> usize {
        let groups: usize = self
            .groups
            .iter()
            .map(|g| {
                g.positions.len() * std::mem::size_of::<Vec3>() * 2
                    + g.uv_sets.iter().map(|s| s.len() * std::mem::size_of::<Vec2>()).sum::<usize>()
                    + g.indices.len() * std::mem::size_of::<u32>()
                    + g.material.name.len()
            })
            .sum();
        let instances: usize = self
            .instances
            .iter()
            .map(|i| std::mem::size_of::<Mat4>() + i.asset.len())
            .sum();
        let reports: usize = self.reports.iter().map(|r| r.message.len() + 8).sum();
        std::mem::size_of::<Self>() + groups + instances + reports + self.report_values.len() * 32
    }
}

struct GroupBuilder {
    material: MaterialTag,
    uv_set_count: usize,
    /// (pool index, uv bits) -> group vertex
    lookup: HashMap<(u32, Vec<[u64; 2]>), u32>,
    vertices: Vec<(u32, Vec<[f64; 2]>)>,
    indices: Vec<u32>,
}

#[derive(Clone)]
struct EngineVertex {
    position: DVec3,
    normal: DVec3,
    uvs: Vec<[f64; 2]>,
}

/// Accumulates one evaluation's event stream and turns it into a
/// [`GeneratedMeshDescriptor`]. Structural checks run as events arrive; coordinate
/// conversion runs once in [`GeometryEncoder::finalize`].
pub struct GeometryEncoder {
    config: EncoderConfig,
    remap: CoordinateRemap,
    positions: Vec<DVec3>,
    normals: Vec<Option<DVec3>>,
    groups: BTreeMap<MaterialKey, GroupBuilder>,
    instances: Vec<(DMat4, String)>,
    reports: Vec<Report>,
    report_values: BTreeMap<String, AttributeValue>,
    vertex_batches: usize,
    face_batches: usize,
    done: bool,
}

impl GeometryEncoder {
    pub fn new(config: EncoderConfig, remap: CoordinateRemap) -> Self {
        Self {
            config,
            remap,
            positions: Vec::new(),
            normals: Vec::new(),
            groups: BTreeMap::new(),
            instances: Vec::new(),
            reports: Vec::new(),
            report_values: BTreeMap::new(),
            vertex_batches: 0,
            face_batches: 0,
            done: false,
        }
    }

    /// Encodes a complete recorded stream.
    pub fn encode(
        events: impl IntoIterator<Item = GeometryEvent>,
        config: EncoderConfig,
        remap: CoordinateRemap,
    ) -> Result<GeneratedMeshDescriptor, EncodingError> {
        let mut encoder = Self::new(config, remap);
        for event in events {
            encoder.push(event)?;
        }
        encoder.finalize()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn vertex_pool_len(&self) -> usize {
        self.positions.len()
    }

    pub fn push(&mut self, event: GeometryEvent) -> Result<(), EncodingError> {
        if self.done {
            return Err(EncodingError::EventAfterDone);
        }
        match event {
            GeometryEvent::VertexBatch { positions, normals } => self.push_vertices(positions, normals),
            GeometryEvent::FaceBatch {
                material,
                indices,
                face_vertex_counts,
                uv_sets,
            } => self.push_faces(material, indices, face_vertex_counts, uv_sets),
            GeometryEvent::InstancePlacement { transform, asset } => {
                self.instances.push((transform, asset));
                Ok(())
            }
            GeometryEvent::Report { severity, message } => {
                match severity {
                    Severity::Info => info!("evaluator: {}", message),
                    Severity::Warning => warn!("evaluator: {}", message),
                    Severity::Error => error!("evaluator: {}", message),
                }
                self.reports.push(Report { severity, message });
                Ok(())
            }
            GeometryEvent::ReportValue { key, value } => {
                self.report_values.insert(key, value);
                Ok(())
            }
            GeometryEvent::Done => {
                self.done = true;
                Ok(())
            }
        }
    }

    fn push_vertices(&mut self, positions: Vec<DVec3>, normals: Option<Vec<DVec3>>) -> Result<(), EncodingError> {
        let batch = self.vertex_batches;
        self.vertex_batches += 1;

        if positions.iter().any(|p| !p.is_finite()) {
            return Err(EncodingError::NonFiniteVertex { batch });
        }
        match normals {
            Some(normals) => {
                if normals.len() != positions.len() {
                    return Err(EncodingError::NormalLengthMismatch {
                        batch,
                        positions: positions.len(),
                        normals: normals.len(),
                    });
                }
                if normals.iter().any(|n| !n.is_finite()) {
                    return Err(EncodingError::NonFiniteVertex { batch });
                }
                self.normals.extend(normals.into_iter().map(|n| Some(n.normalize_or_zero())));
            }
            None => self.normals.extend(std::iter::repeat(None).take(positions.len())),
        }
        self.positions.extend(positions);
        Ok(())
    }

    fn push_faces(
        &mut self,
        material: MaterialTag,
        indices: Vec<u32>,
        face_vertex_counts: Vec<u32>,
        uv_sets: Vec<Vec<[f64; 2]>>,
    ) -> Result<(), EncodingError> {
        let batch = self.face_batches;
        self.face_batches += 1;

        if let Some((face, &corners)) = face_vertex_counts.iter().enumerate().find(|&(_, &c)| c < 3) {
            return Err(EncodingError::DegenerateFace { batch, face, corners });
        }
        let expected: usize = face_vertex_counts.iter().map(|&c| c as usize).sum();
        if expected != indices.len() {
            return Err(EncodingError::FaceCountMismatch {
                batch,
                expected,
                actual: indices.len(),
            });
        }
        let vertex_count = self.positions.len();
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(EncodingError::IndexOutOfRange { batch, index, vertex_count });
        }
        for (set, uvs) in uv_sets.iter().enumerate() {
            if uvs.len() != indices.len() {
                return Err(EncodingError::UvLengthMismatch {
                    batch,
                    set,
                    expected: indices.len(),
                    actual: uvs.len(),
                });
            }
        }

        let group = self.groups.entry(material.key()).or_insert_with(|| GroupBuilder {
            material,
            uv_set_count: uv_sets.len(),
            lookup: HashMap::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
        });
        if group.uv_set_count != uv_sets.len() {
            return Err(EncodingError::UvSetCountMismatch {
                batch,
                expected: group.uv_set_count,
                actual: uv_sets.len(),
            });
        }

        let mut corner = 0usize;
        for &count in &face_vertex_counts {
            let face: Vec<u32> = (corner..corner + count as usize)
                .map(|c| {
                    let uvs: Vec<[f64; 2]> = uv_sets.iter().map(|set| set[c]).collect();
                    group.vertex(indices[c], uvs)
                })
                .collect();
            for i in 1..face.len() - 1 {
                group.indices.extend_from_slice(&[face[0], face[i], face[i + 1]]);
            }
            corner += count as usize;
        }
        Ok(())
    }

    fn should_weld(&self) -> bool {
        match self.config.weld_policy {
            WeldPolicy::Always => true,
            WeldPolicy::Never => false,
            WeldPolicy::Evaluator => self
                .report_values
                .get(WELD_REPORT_KEY)
                .and_then(AttributeValue::as_bool)
                .unwrap_or(false),
        }
    }

    /// Area-weighted normals for pool vertices the evaluator left without one.
    fn resolve_normals(&self) -> Vec<DVec3> {
        let mut accumulated = vec![DVec3::ZERO; self.positions.len()];
        for group in self.groups.values() {
            for tri in group.indices.chunks_exact(3) {
                let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| group.vertices[i as usize].0 as usize);
                let n = (self.positions[b] - self.positions[a]).cross(self.positions[c] - self.positions[a]);
                for i in [a, b, c] {
                    accumulated[i] += n;
                }
            }
        }
        self.normals
            .iter()
            .zip(accumulated)
            .map(|(given, sum)| given.unwrap_or_else(|| sum.normalize_or_zero()))
            .collect()
    }

    pub fn finalize(self) -> Result<GeneratedMeshDescriptor, EncodingError> {
        if !self.done {
            return Err(EncodingError::MissingDone);
        }

        let normals = self.resolve_normals();
        let weld = self.should_weld();
        let flip = self.remap.flips_handedness();
        let remap = self.remap;
        let epsilon = self.config.weld_epsilon;

        let mut groups = Vec::with_capacity(self.groups.len());
        for group in self.groups.into_values() {
            if group.indices.is_empty() {
                continue;
            }
            let mut vertices: Vec<EngineVertex> = group
                .vertices
                .iter()
                .map(|(pool, uvs)| EngineVertex {
                    position: self.positions[*pool as usize],
                    normal: normals[*pool as usize],
                    uvs: uvs.clone(),
                })
                .collect();
            let mut indices = group.indices;
            if weld {
                let before = vertices.len();
                (vertices, indices) = weld_vertices(&vertices, &indices, epsilon);
                debug!("welded group '{}' from {} to {} vertices", group.material.name, before, vertices.len());
            }
            if flip {
                for tri in indices.chunks_exact_mut(3) {
                    tri.swap(1, 2);
                }
            }

            let uv_sets: Vec<Vec<Vec2>> = (0..group.uv_set_count)
                .map(|set| vertices.iter().map(|v| remap.uv_to_host(v.uvs[set])).collect())
                .collect();
            groups.push(GeometryGroup {
                material: group.material,
                positions: vertices.iter().map(|v| remap.host_vec3(v.position)).collect(),
                normals: vertices.iter().map(|v| remap.normal_to_host(v.normal).as_vec3()).collect(),
                uv_sets,
                indices,
            });
        }

        let instances = self
            .instances
            .into_iter()
            .map(|(transform, asset)| InstancePlacement {
                transform: remap.transform_to_host(transform),
                asset,
            })
            .collect();

        Ok(GeneratedMeshDescriptor {
            groups,
            instances,
            reports: self.reports,
            report_values: self.report_values,
        })
    }
}

impl GroupBuilder {
    fn vertex(&mut self, pool: u32, uvs: Vec<[f64; 2]>) -> u32 {
        let bits: Vec<[u64; 2]> = uvs.iter().map(|uv| [uv[0].to_bits(), uv[1].to_bits()]).collect();
        let vertices = &mut self.vertices;
        *self.lookup.entry((pool, bits)).or_insert_with(|| {
            vertices.push((pool, uvs));
            (vertices.len() - 1) as u32
        })
    }
}

fn close(a: &EngineVertex, b: &EngineVertex, epsilon: f64) -> bool {
    a.position.distance(b.position) <= epsilon
        && a.normal.distance(b.normal) <= epsilon
        && a.uvs
            .iter()
            .zip(&b.uvs)
            .all(|(p, q)| (p[0] - q[0]).abs() <= epsilon && (p[1] - q[1]).abs() <= epsilon)
}

/// Merges vertices within `epsilon` using a uniform grid; triangles that collapse
/// are dropped.
fn weld_vertices(vertices: &[EngineVertex], indices: &[u32], epsilon: f64) -> (Vec<EngineVertex>, Vec<u32>) {
    let cell_of = |p: DVec3| {
        let c = (p / epsilon).floor();
        [c.x as i64, c.y as i64, c.z as i64]
    };
    let mut grid: HashMap<[i64; 3], Vec<u32>> = HashMap::new();
    let mut merged: Vec<EngineVertex> = Vec::new();
    let mut remap = Vec::with_capacity(vertices.len());

    for v in vertices {
        let [x, y, z] = cell_of(v.position);
        let mut found = None;
        'search: for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(candidates) = grid.get(&[x + dx, y + dy, z + dz]) {
                        if let Some(&hit) = candidates.iter().find(|&&c| close(&merged[c as usize], v, epsilon)) {
                            found = Some(hit);
                            break 'search;
                        }
                    }
                }
            }
        }
        let index = match found {
            Some(hit) => hit,
            None => {
                merged.push(v.clone());
                let index = (merged.len() - 1) as u32;
                grid.entry([x, y, z]).or_default().push(index);
                index
            }
        };
        remap.push(index);
    }

    let indices = indices
        .chunks_exact(3)
        .map(|tri| [tri[0], tri[1], tri[2]].map(|i| remap[i as usize]))
        .filter(|t| t[0] != t[1] && t[1] != t[2] && t[0] != t[2])
        .flatten()
        .collect();
    (merged, indices)
}
