//! Bevy front end for the procedural generation bridge: lots become
//! `ProceduralShape` entities and finished descriptors become meshes.

pub mod materials;
pub mod mesh;
pub mod plugin;
pub mod scene;
pub mod storage;

pub use plugin::{GeneratedModel, GenerationBridge, InstanceAsset, ProceduralShape, ProcgenPlugin, SceneSource};
pub use materials::MaterialCache;
pub use scene::{DemoScene, LotDescription};
pub use storage::ModelStorage;
