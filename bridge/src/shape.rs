use std::collections::{BTreeMap, HashMap};

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeSet;
use crate::coords::CoordinateRemap;
use crate::error::InvalidShapeError;
use crate::fingerprint::{Fingerprint, FingerprintHasher};

/// Two consecutive vertices closer than this are one vertex.
const COINCIDENT_EPSILON: f64 = 1e-9;
/// Allowed distance from the face plane, relative to the face extent.
const PLANARITY_TOLERANCE: f64 = 1e-4;

/// Handle to an externally owned compiled rule package. The bridge only reads the
/// id and version, for fingerprinting and cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RulePackageRef {
    pub id: String,
    pub version: u64,
}

impl RulePackageRef {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self { id: id.into(), version }
    }

    /// Identity of the package across versions.
    pub fn id_fingerprint(&self) -> Fingerprint {
        FingerprintHasher::new("procgen-package-v1").str(&self.id).finish()
    }
}

/// Host-side identity of a scene object, stable across footprint edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeKey(pub u64);

/// One planar face: an outer ring plus optional hole rings. Rings are implicitly
/// closed; a repeated first vertex at the end is tolerated and dropped.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeFace {
    pub vertices: Vec<DVec3>,
    pub holes: Vec<Vec<DVec3>>,
}

impl ShapeFace {
    pub fn new(vertices: Vec<DVec3>) -> Self {
        Self { vertices, holes: Vec::new() }
    }

    pub fn with_hole(mut self, hole: Vec<DVec3>) -> Self {
        self.holes.push(hole);
        self
    }

    fn rings(&self) -> impl Iterator<Item = &[DVec3]> {
        std::iter::once(open_ring(&self.vertices)).chain(self.holes.iter().map(|h| open_ring(h)))
    }

    /// Outer area minus hole areas.
    pub fn area(&self) -> f64 {
        let outer = newell_normal(open_ring(&self.vertices)).length() * 0.5;
        let holes: f64 = self
            .holes
            .iter()
            .map(|h| newell_normal(open_ring(h)).length() * 0.5)
            .sum();
        (outer - holes).max(0.0)
    }

    pub fn normal(&self) -> DVec3 {
        newell_normal(open_ring(&self.vertices)).normalize_or_zero()
    }
}

/// The unit of generation: footprint geometry, rule package, start rule, seed and
/// per-shape attribute overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialShape {
    faces: Vec<ShapeFace>,
    rule_package: RulePackageRef,
    start_rule: String,
    random_seed: i32,
    attributes: AttributeSet,
    key: Option<ShapeKey>,
}

impl InitialShape {
    pub fn new(vertices: Vec<DVec3>, rule_package: RulePackageRef, start_rule: impl Into<String>) -> Self {
        Self::from_faces(vec![ShapeFace::new(vertices)], rule_package, start_rule)
    }

    pub fn from_faces(faces: Vec<ShapeFace>, rule_package: RulePackageRef, start_rule: impl Into<String>) -> Self {
        Self {
            faces,
            rule_package,
            start_rule: start_rule.into(),
            random_seed: 0,
            attributes: AttributeSet::new(),
            key: None,
        }
    }

    /// Footprint recovered from a triangulated mesh: boundary edges (used by exactly
    /// one triangle) are chained into rings, and rings nested inside an odd number of
    /// other rings become holes of their innermost container.
    pub fn from_triangle_mesh(
        vertices: &[DVec3],
        indices: &[u32],
        rule_package: RulePackageRef,
        start_rule: impl Into<String>,
    ) -> Result<Self, InvalidShapeError> {
        let faces = faces_from_triangles(vertices, indices)?;
        Ok(Self::from_faces(faces, rule_package, start_rule))
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_key(mut self, key: ShapeKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn faces(&self) -> &[ShapeFace] {
        &self.faces
    }

    pub fn rule_package(&self) -> &RulePackageRef {
        &self.rule_package
    }

    pub fn start_rule(&self) -> &str {
        &self.start_rule
    }

    pub fn random_seed(&self) -> i32 {
        self.random_seed
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn key(&self) -> Option<ShapeKey> {
        self.key
    }

    pub fn area(&self) -> f64 {
        self.faces.iter().map(ShapeFace::area).sum()
    }

    /// Checks closure, planarity, simplicity and minimum area.
    pub fn validate(&self, min_area: f64) -> Result<(), InvalidShapeError> {
        if self.start_rule.trim().is_empty() {
            return Err(InvalidShapeError::MissingStartRule);
        }
        if self.faces.is_empty() {
            return Err(InvalidShapeError::Empty);
        }

        for (face_index, face) in self.faces.iter().enumerate() {
            for (ring_index, ring) in face.rings().enumerate() {
                check_ring(face_index, ring_index, ring)?;
            }
            check_planar(face_index, face)?;
            check_simple(face_index, face)?;

            let area = face.area();
            if area <= COINCIDENT_EPSILON {
                return Err(InvalidShapeError::BelowMinimumArea { area, minimum: min_area });
            }
        }

        let area = self.area();
        if area < min_area {
            return Err(InvalidShapeError::BelowMinimumArea { area, minimum: min_area });
        }
        Ok(())
    }

    /// Geometry, rule package id and version, start rule and seed. Per-shape
    /// attributes and the host key are not part of it.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut h = FingerprintHasher::new("procgen-shape-v1");
        h.str(&self.rule_package.id)
            .u64(self.rule_package.version)
            .str(&self.start_rule)
            .i64(self.random_seed as i64)
            .len(self.faces.len());
        for face in &self.faces {
            h.len(face.holes.len() + 1);
            for ring in face.rings() {
                h.len(ring.len());
                for v in ring {
                    h.f64(v.x).f64(v.y).f64(v.z);
                }
            }
        }
        h.finish()
    }

    /// Drops explicit closing vertices and consecutive duplicates.
    pub fn normalized(&self) -> Self {
        let mut shape = self.clone();
        for face in &mut shape.faces {
            face.vertices = dedup_ring(&face.vertices);
            for hole in &mut face.holes {
                *hole = dedup_ring(hole);
            }
        }
        shape
    }

    /// Outer rings wind counter-clockwise around `up`, holes clockwise.
    pub fn oriented_up(&self, up: DVec3) -> Self {
        let mut shape = self.clone();
        for face in &mut shape.faces {
            if newell_normal(&face.vertices).dot(up) < 0.0 {
                face.vertices.reverse();
            }
            for hole in &mut face.holes {
                if newell_normal(hole).dot(up) > 0.0 {
                    hole.reverse();
                }
            }
        }
        shape
    }

    /// Copy with every vertex converted from host into engine coordinates.
    pub fn to_engine(&self, remap: &CoordinateRemap) -> Self {
        let mut shape = self.clone();
        for face in &mut shape.faces {
            for v in &mut face.vertices {
                *v = remap.point_to_engine(*v);
            }
            for hole in &mut face.holes {
                for v in hole.iter_mut() {
                    *v = remap.point_to_engine(*v);
                }
            }
        }
        shape
    }
}

fn open_ring(ring: &[DVec3]) -> &[DVec3] {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 && first.distance(*last) <= COINCIDENT_EPSILON => &ring[..ring.len() - 1],
        _ => ring,
    }
}

fn dedup_ring(ring: &[DVec3]) -> Vec<DVec3> {
    let mut out: Vec<DVec3> = Vec::with_capacity(ring.len());
    for v in open_ring(ring) {
        if out.last().map_or(true, |last| last.distance(*v) > COINCIDENT_EPSILON) {
            out.push(*v);
        }
    }
    while out.len() > 1 && out[0].distance(out[out.len() - 1]) <= COINCIDENT_EPSILON {
        out.pop();
    }
    out
}

/// Newell's method; the length is twice the ring area.
fn newell_normal(ring: &[DVec3]) -> DVec3 {
    let mut n = DVec3::ZERO;
    for (i, a) in ring.iter().enumerate() {
        let b = ring[(i + 1) % ring.len()];
        n.x += (a.y - b.y) * (a.z + b.z);
        n.y += (a.z - b.z) * (a.x + b.x);
        n.z += (a.x - b.x) * (a.y + b.y);
    }
    n
}

fn check_ring(face: usize, ring_index: usize, ring: &[DVec3]) -> Result<(), InvalidShapeError> {
    if let Some(vertex) = ring.iter().position(|v| !v.is_finite()) {
        return Err(InvalidShapeError::NonFinite { face, ring: ring_index, vertex });
    }
    if ring.len() < 3 {
        return Err(InvalidShapeError::TooFewVertices { face, ring: ring_index, count: ring.len() });
    }
    for (i, a) in ring.iter().enumerate() {
        let b = ring[(i + 1) % ring.len()];
        if a.distance(b) <= COINCIDENT_EPSILON {
            return Err(InvalidShapeError::DegenerateEdge { face, ring: ring_index, vertex: i });
        }
    }
    Ok(())
}

/// Newell normal, or for outlines whose signed area cancels out (a bowtie) the
/// normal of the first non-collinear corner.
fn plane_normal(ring: &[DVec3]) -> DVec3 {
    let newell = newell_normal(ring).normalize_or_zero();
    if newell != DVec3::ZERO {
        return newell;
    }
    let Some(&origin) = ring.first() else {
        return DVec3::ZERO;
    };
    ring.windows(2)
        .map(|w| (w[0] - origin).cross(w[1] - origin))
        .find(|n| n.length_squared() > COINCIDENT_EPSILON)
        .map_or(DVec3::ZERO, DVec3::normalize)
}

fn check_planar(face_index: usize, face: &ShapeFace) -> Result<(), InvalidShapeError> {
    let normal = plane_normal(open_ring(&face.vertices));
    if normal == DVec3::ZERO {
        // collinear outline, caught by the area check
        return Ok(());
    }
    let origin = face.vertices[0];
    let (min, max) = face
        .rings()
        .flatten()
        .fold((DVec3::splat(f64::MAX), DVec3::splat(f64::MIN)), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let extent = (max - min).length().max(1.0);
    let deviation = face
        .rings()
        .flatten()
        .map(|v| (*v - origin).dot(normal).abs())
        .fold(0.0, f64::max);
    if deviation > PLANARITY_TOLERANCE * extent {
        return Err(InvalidShapeError::NonPlanar { face: face_index, deviation });
    }
    Ok(())
}

/// Projects onto the coordinate plane best aligned with `normal`.
fn project(normal: DVec3, v: DVec3) -> DVec2 {
    let a = normal.abs();
    if a.x >= a.y && a.x >= a.z {
        DVec2::new(v.y, v.z)
    } else if a.y >= a.z {
        DVec2::new(v.z, v.x)
    } else {
        DVec2::new(v.x, v.y)
    }
}

fn check_simple(face_index: usize, face: &ShapeFace) -> Result<(), InvalidShapeError> {
    let normal = plane_normal(open_ring(&face.vertices));
    if normal == DVec3::ZERO {
        return Ok(());
    }
    let rings: Vec<Vec<DVec2>> = face
        .rings()
        .map(|ring| ring.iter().map(|v| project(normal, *v)).collect())
        .collect();

    // edges as (ring, edge index) pairs, each edge i runs from vertex i to i + 1
    let edges: Vec<(usize, usize)> = rings
        .iter()
        .enumerate()
        .flat_map(|(r, ring)| (0..ring.len()).map(move |e| (r, e)))
        .collect();

    let segment = |(r, e): (usize, usize)| {
        let ring = &rings[r];
        (ring[e], ring[(e + 1) % ring.len()])
    };

    for (i, &first) in edges.iter().enumerate() {
        for &second in &edges[i + 1..] {
            let (a0, a1) = segment(first);
            let (b0, b1) = segment(second);
            let adjacent = first.0 == second.0 && {
                let n = rings[first.0].len();
                (first.1 + 1) % n == second.1 || (second.1 + 1) % n == first.1
            };
            let hit = if adjacent { folds_back(a0, a1, b0, b1) } else { segments_intersect(a0, a1, b0, b1) };
            if hit {
                return Err(InvalidShapeError::SelfIntersecting {
                    face: face_index,
                    ring: first.0,
                    first: first.1,
                    second: second.1,
                });
            }
        }
    }
    Ok(())
}

fn cross(o: DVec2, a: DVec2, b: DVec2) -> f64 {
    (a - o).perp_dot(b - o)
}

fn on_segment(p: DVec2, q: DVec2, r: DVec2) -> bool {
    q.x <= p.x.max(r.x) && q.x >= p.x.min(r.x) && q.y <= p.y.max(r.y) && q.y >= p.y.min(r.y)
}

fn segments_intersect(p1: DVec2, p2: DVec2, q1: DVec2, q2: DVec2) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0)) && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0)) {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, p1, q2))
        || (d2 == 0.0 && on_segment(q1, p2, q2))
        || (d3 == 0.0 && on_segment(p1, q1, p2))
        || (d4 == 0.0 && on_segment(p1, q2, p2))
}

/// Adjacent edges only meet at their shared vertex unless the outline doubles back.
fn folds_back(a0: DVec2, a1: DVec2, b0: DVec2, b1: DVec2) -> bool {
    let da = a1 - a0;
    let db = b1 - b0;
    da.perp_dot(db).abs() <= f64::EPSILON * da.length() * db.length() && da.dot(db) < 0.0
}

fn point_in_ring(ring: &[DVec2], p: DVec2) -> bool {
    let mut inside = false;
    let n = ring.len();
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        if (a.y > p.y) != (b.y > p.y) {
            let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if p.x < x {
                inside = !inside;
            }
        }
    }
    inside
}

fn faces_from_triangles(vertices: &[DVec3], indices: &[u32]) -> Result<Vec<ShapeFace>, InvalidShapeError> {
    if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
        return Err(InvalidShapeError::MeshIndexOutOfRange { index, vertex_count: vertices.len() });
    }

    // weld exact duplicates so that split vertices still share edges
    let mut welded: HashMap<[u64; 3], u32> = HashMap::new();
    let mut positions: Vec<DVec3> = Vec::new();
    // first input index of each welded position, for error reporting
    let mut first_index: Vec<u32> = Vec::new();
    let remapped: Vec<u32> = indices
        .iter()
        .map(|&i| {
            let v = vertices[i as usize];
            *welded.entry([v.x.to_bits(), v.y.to_bits(), v.z.to_bits()]).or_insert_with(|| {
                positions.push(v);
                first_index.push(i);
                (positions.len() - 1) as u32
            })
        })
        .collect();

    let mut edge_use: HashMap<(u32, u32), (usize, (u32, u32))> = HashMap::new();
    let mut normal = DVec3::ZERO;
    for tri in remapped.chunks_exact(3) {
        if tri[0] == tri[1] || tri[1] == tri[2] || tri[0] == tri[2] {
            continue;
        }
        let (a, b, c) = (positions[tri[0] as usize], positions[tri[1] as usize], positions[tri[2] as usize]);
        normal += (b - a).cross(c - a);
        for k in 0..3 {
            let (i0, i1) = (tri[k], tri[(k + 1) % 3]);
            let entry = edge_use.entry((i0.min(i1), i0.max(i1))).or_insert((0, (i0, i1)));
            entry.0 += 1;
        }
    }

    if let Some((_, (from, _))) = edge_use.values().find(|(count, _)| *count > 2) {
        return Err(InvalidShapeError::NonManifoldOutline { index: first_index[*from as usize] });
    }

    // each boundary vertex starts exactly one boundary edge, or the rings are ambiguous
    let mut boundary: BTreeMap<u32, u32> = BTreeMap::new();
    for (_, (from, to)) in edge_use.values().filter(|(count, _)| *count == 1) {
        if boundary.insert(*from, *to).is_some() {
            return Err(InvalidShapeError::NonManifoldOutline { index: first_index[*from as usize] });
        }
    }

    let mut rings: Vec<Vec<DVec3>> = Vec::new();
    while let Some((start, mut next)) = boundary.pop_first() {
        let mut ring = vec![positions[start as usize]];
        while let Some(after) = boundary.remove(&next) {
            ring.push(positions[next as usize]);
            next = after;
        }
        if ring.len() >= 3 {
            rings.push(ring);
        }
    }
    if rings.is_empty() {
        return Err(InvalidShapeError::Empty);
    }

    let normal = normal.normalize_or_zero();
    let flat: Vec<Vec<DVec2>> = rings.iter().map(|r| r.iter().map(|v| project(normal, *v)).collect()).collect();
    // containers[i] = rings that enclose ring i
    let containers: Vec<Vec<usize>> = (0..rings.len())
        .map(|i| {
            (0..rings.len())
                .filter(|&j| j != i && point_in_ring(&flat[j], flat[i][0]))
                .collect()
        })
        .collect();

    let mut faces: BTreeMap<usize, ShapeFace> = BTreeMap::new();
    for (i, enclosing) in containers.iter().enumerate() {
        if enclosing.len() % 2 == 0 {
            faces.insert(i, ShapeFace::new(rings[i].clone()));
        }
    }
    for (i, enclosing) in containers.iter().enumerate() {
        if enclosing.len() % 2 == 1 {
            // innermost container is the one enclosed by all the others
            let parent = enclosing.iter().copied().max_by_key(|&j| containers[j].len());
            if let Some(face) = parent.and_then(|p| faces.get_mut(&p)) {
                face.holes.push(rings[i].clone());
            }
        }
    }
    Ok(faces.into_values().collect())
}
