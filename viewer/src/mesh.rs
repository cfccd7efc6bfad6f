use bevy::prelude::*;
use bevy::render::mesh::{Indices, PrimitiveTopology};
use procgen_bridge::{BlendMode, GeometryGroup, MaterialTag};

/// Builds a render mesh from one material group of a generated descriptor.
pub fn group_to_mesh(group: &GeometryGroup) -> Mesh {
    let mut mesh = Mesh::new(PrimitiveTopology::TriangleList);

    let positions: Vec<[f32; 3]> = group.positions.iter().map(|v| v.to_array()).collect();
    let normals: Vec<[f32; 3]> = group.normals.iter().map(|v| v.to_array()).collect();
    // the PBR pipeline expects UVs even for untextured groups
    let uv0: Vec<[f32; 2]> = match group.uv_sets.first() {
        Some(set) => set.iter().map(|uv| uv.to_array()).collect(),
        None => vec![[0.0, 0.0]; group.positions.len()],
    };

    mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
    mesh.insert_attribute(Mesh::ATTRIBUTE_NORMAL, normals);
    mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, uv0);
    if let Some(set) = group.uv_sets.get(1) {
        let uv1: Vec<[f32; 2]> = set.iter().map(|uv| uv.to_array()).collect();
        mesh.insert_attribute(Mesh::ATTRIBUTE_UV_1, uv1);
    }
    mesh.set_indices(Some(Indices::U32(group.indices.clone())));

    mesh
}

pub fn alpha_mode(tag: &MaterialTag) -> AlphaMode {
    match tag.blend_mode() {
        BlendMode::Opaque => AlphaMode::Opaque,
        BlendMode::Masked => AlphaMode::Mask(0.5),
        BlendMode::Translucent => AlphaMode::Blend,
    }
}

/// Material without textures; the caller loads `texture` and `opacity_map`
/// through the asset server.
pub fn standard_material(tag: &MaterialTag) -> StandardMaterial {
    let [r, g, b, a] = tag.base_color;
    StandardMaterial {
        base_color: Color::rgba(r, g, b, a * tag.opacity),
        alpha_mode: alpha_mode(tag),
        perceptual_roughness: 0.8,
        double_sided: tag.blend_mode() != BlendMode::Opaque,
        cull_mode: if tag.blend_mode() == BlendMode::Opaque {
            Some(bevy::render::render_resource::Face::Back)
        } else {
            None
        },
        ..default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::render::mesh::VertexAttributeValues;

    fn quad(uv_sets: Vec<Vec<Vec2>>) -> GeometryGroup {
        GeometryGroup {
            material: MaterialTag::named("roof"),
            positions: vec![Vec3::ZERO, Vec3::X, Vec3::new(1.0, 0.0, -1.0), Vec3::NEG_Z],
            normals: vec![Vec3::Y; 4],
            uv_sets,
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    #[test]
    fn mesh_keeps_counts() {
        let mesh = group_to_mesh(&quad(Vec::new()));
        assert_eq!(mesh.count_vertices(), 4);
        assert_eq!(mesh.indices().map(|i| i.len()), Some(6));
        match mesh.attribute(Mesh::ATTRIBUTE_UV_0) {
            Some(VertexAttributeValues::Float32x2(uvs)) => assert_eq!(uvs.len(), 4),
            other => panic!("unexpected uv attribute {other:?}"),
        }
        assert!(mesh.attribute(Mesh::ATTRIBUTE_UV_1).is_none());
    }

    #[test]
    fn second_uv_set_becomes_uv1() {
        let set = vec![Vec2::ZERO, Vec2::X, Vec2::ONE, Vec2::Y];
        let mesh = group_to_mesh(&quad(vec![set.clone(), set]));
        assert!(mesh.attribute(Mesh::ATTRIBUTE_UV_1).is_some());
    }

    #[test]
    fn translucent_materials_blend() {
        let glass = MaterialTag::named("glass").with_opacity(0.3);
        let material = standard_material(&glass);
        assert_eq!(material.alpha_mode, AlphaMode::Blend);
        assert!((material.base_color.a() - 0.3).abs() < 1e-6);
        assert!(material.cull_mode.is_none());

        let wall = standard_material(&MaterialTag::named("wall"));
        assert_eq!(wall.alpha_mode, AlphaMode::Opaque);
    }
}
