use std::collections::HashMap;

use bevy::prelude::*;
use procgen_bridge::MaterialTag;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TagKey {
    name: String,
    texture: Option<String>,
    opacity_map: Option<String>,
    scalars: [u32; 5],
}

impl From<&MaterialTag> for TagKey {
    fn from(tag: &MaterialTag) -> Self {
        let [r, g, b, a] = tag.base_color.map(f32::to_bits);
        Self {
            name: tag.name.clone(),
            texture: tag.texture.clone(),
            opacity_map: tag.opacity_map.clone(),
            scalars: [r, g, b, a, tag.opacity.to_bits()],
        }
    }
}

/// One `StandardMaterial` per distinct material tag, shared by every model
/// and every regeneration.
#[derive(Resource, Default)]
pub struct MaterialCache {
    handles: HashMap<TagKey, Handle<StandardMaterial>>,
}

impl MaterialCache {
    /// The material for `tag`, built with `build` the first time it is seen.
    pub fn get_or_insert_with(
        &mut self,
        tag: &MaterialTag,
        materials: &mut Assets<StandardMaterial>,
        build: impl FnOnce(&MaterialTag) -> StandardMaterial,
    ) -> Handle<StandardMaterial> {
        self.handles
            .entry(TagKey::from(tag))
            .or_insert_with(|| materials.add(build(tag)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}
