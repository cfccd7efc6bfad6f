use std::sync::Arc;

use bevy::prelude::*;
use procgen_bridge::{
    AttributeSet, BridgeConfig, ExtrusionEvaluator, GeneratedMeshDescriptor, GenerationOutcome, GenerationResult,
    GenerationScheduler, InitialShape, RulePackageRef,
};

use crate::materials::MaterialCache;
use crate::mesh::{group_to_mesh, standard_material};
use crate::scene::DemoScene;
use crate::storage::ModelStorage;

/// Scheduler owned by the app; dropping it cancels whatever is still running.
#[derive(Resource)]
pub struct GenerationBridge {
    pub scheduler: GenerationScheduler,
}

/// Where the demo scene is read from at startup.
#[derive(Resource, Clone)]
pub struct SceneSource {
    pub path: String,
}

impl Default for SceneSource {
    fn default() -> Self {
        Self {
            path: "assets/scene.json".to_string(),
        }
    }
}

/// Stand-in geometry for instance placements until real assets are resolved.
#[derive(Resource)]
pub struct PlaceholderAssets {
    pub mesh: Handle<Mesh>,
    pub material: Handle<StandardMaterial>,
}

/// A shape that is regenerated whenever it changes.
#[derive(Component, Clone)]
pub struct ProceduralShape {
    pub shape: InitialShape,
    pub attributes: AttributeSet,
}

/// Marks the entities spawned from a descriptor.
#[derive(Component)]
pub struct GeneratedModel;

#[derive(Component, Debug)]
pub struct InstanceAsset(pub String);

pub struct ProcgenPlugin {
    /// `.ron` or `.json` bridge configuration; defaults are used when it cannot be read.
    pub config_path: String,
}

impl Default for ProcgenPlugin {
    fn default() -> Self {
        Self {
            config_path: "assets/bridge.ron".to_string(),
        }
    }
}

impl Plugin for ProcgenPlugin {
    fn build(&self, app: &mut App) {
        let config = BridgeConfig::load(&self.config_path).unwrap_or_else(|e| {
            warn!("Failed to load bridge config {}: {}, using defaults", self.config_path, e);
            BridgeConfig::default()
        });
        info!(
            "Bridge config: {} workers, cache capacity {}",
            config.worker_threads, config.cache.capacity
        );

        let evaluator = Arc::new(ExtrusionEvaluator::new("extrude"));
        let scheduler = match GenerationScheduler::new(evaluator, config) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                error!("Bridge config {} rejected: {}, procedural generation disabled", self.config_path, e);
                return;
            }
        };

        app.insert_resource(GenerationBridge { scheduler })
            .init_resource::<ModelStorage>()
            .init_resource::<MaterialCache>()
            .init_resource::<SceneSource>()
            .add_systems(Startup, (setup_placeholders, setup_lighting, spawn_scene_lots))
            .add_systems(
                Update,
                (
                    reseed_on_space,
                    cancel_removed_shapes,
                    submit_changed_shapes,
                    apply_completed_generations,
                    log_bridge_stats,
                )
                    .chain(),
            );
    }
}

fn setup_placeholders(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    commands.insert_resource(PlaceholderAssets {
        mesh: meshes.add(Mesh::from(shape::Box::new(1.2, 1.4, 0.1))),
        material: materials.add(StandardMaterial {
            base_color: Color::rgba(0.6, 0.8, 0.95, 0.6),
            alpha_mode: AlphaMode::Blend,
            ..default()
        }),
    });
}

fn setup_lighting(mut commands: Commands) {
    commands.insert_resource(AmbientLight {
        color: Color::WHITE,
        brightness: 0.4,
    });

    commands.spawn(DirectionalLightBundle {
        directional_light: DirectionalLight {
            illuminance: 12000.0,
            shadows_enabled: true,
            ..default()
        },
        transform: Transform::from_xyz(30.0, 60.0, 20.0).looking_at(Vec3::ZERO, Vec3::Y),
        ..default()
    });
}

fn spawn_scene_lots(mut commands: Commands, source: Res<SceneSource>) {
    let scene = DemoScene::load_or_default(&source.path);
    let package = RulePackageRef::new(scene.rule_package.clone(), scene.rule_version);
    info!("Spawning {} lots from rule package {}", scene.lots.len(), scene.rule_package);

    for lot in &scene.lots {
        commands.spawn((
            ProceduralShape {
                shape: lot.to_shape(&package),
                attributes: lot.attributes(),
            },
            SpatialBundle::default(),
            Name::new(format!("Lot {}", lot.key)),
        ));
    }
}

/// Space reseeds every shape and enables height variation so the change is visible.
fn reseed_on_space(keyboard: Res<Input<KeyCode>>, mut shapes: Query<&mut ProceduralShape>) {
    if !keyboard.just_pressed(KeyCode::Space) {
        return;
    }
    for mut procedural in shapes.iter_mut() {
        let seed = procedural.shape.random_seed().wrapping_add(1);
        procedural.shape = procedural.shape.clone().with_seed(seed);
        if !procedural.attributes.contains("heightVariation") {
            if let Err(e) = procedural.attributes.set("heightVariation", 4.0) {
                warn!("{}", e);
            }
        }
    }
}

fn submit_changed_shapes(
    bridge: Res<GenerationBridge>,
    storage: Res<ModelStorage>,
    changed: Query<(Entity, &ProceduralShape), Changed<ProceduralShape>>,
) {
    for (entity, procedural) in changed.iter() {
        match bridge.scheduler.submit(procedural.shape.clone(), procedural.attributes.clone()) {
            Ok(handle) => {
                debug!("Submitted {:?} as request {} in slot {}", entity, handle.id(), handle.slot());
                if let Some(old) = storage.track(handle.slot(), entity, handle.id()) {
                    bridge.scheduler.cancel(&old);
                }
            }
            Err(e) => warn!("Shape on {:?} rejected: {}", entity, e),
        }
    }
}

fn cancel_removed_shapes(
    bridge: Res<GenerationBridge>,
    storage: Res<ModelStorage>,
    mut removed: RemovedComponents<ProceduralShape>,
) {
    for entity in removed.read() {
        if let Some(slot) = storage.release(entity) {
            if bridge.scheduler.cancel(&slot) {
                debug!("Cancelled generation for removed {:?}", entity);
            }
        }
    }
}

fn apply_completed_generations(
    mut commands: Commands,
    bridge: Res<GenerationBridge>,
    storage: Res<ModelStorage>,
    placeholders: Res<PlaceholderAssets>,
    asset_server: Res<AssetServer>,
    mut material_cache: ResMut<MaterialCache>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    let mut outcomes: Vec<GenerationOutcome> = Vec::new();
    bridge.scheduler.drain_completed(|outcome| outcomes.push(outcome));

    for outcome in outcomes {
        let Some(owner) = storage.accept(&outcome.slot, outcome.request) else {
            debug!("Dropping stale outcome {} for slot {}", outcome.request, outcome.slot);
            continue;
        };
        match outcome.result {
            GenerationResult::Completed { descriptor, from_cache } => {
                debug!(
                    "Request {} done ({} triangles, {} instances, cached: {})",
                    outcome.request,
                    descriptor.triangle_count(),
                    descriptor.instances.len(),
                    from_cache
                );
                for report in &descriptor.reports {
                    debug!("{:?}: {}", report.severity, report.message);
                }
                let Some(mut owner_commands) = commands.get_entity(owner) else {
                    continue;
                };
                owner_commands.despawn_descendants();
                owner_commands.with_children(|parent| {
                    spawn_descriptor(
                        parent,
                        &descriptor,
                        &placeholders,
                        &asset_server,
                        &mut material_cache,
                        &mut meshes,
                        &mut materials,
                    );
                });
            }
            GenerationResult::Failed(e) => {
                error!("Generation {} for {} failed: {}", outcome.request, outcome.slot, e);
            }
        }
    }
}

fn spawn_descriptor(
    parent: &mut ChildBuilder,
    descriptor: &GeneratedMeshDescriptor,
    placeholders: &PlaceholderAssets,
    asset_server: &AssetServer,
    material_cache: &mut MaterialCache,
    meshes: &mut Assets<Mesh>,
    materials: &mut Assets<StandardMaterial>,
) {
    for group in &descriptor.groups {
        let material = material_cache.get_or_insert_with(&group.material, materials, |tag| {
            let mut material = standard_material(tag);
            // no dedicated opacity slot; base color alpha carries it when there is no texture
            material.base_color_texture = tag
                .texture
                .as_ref()
                .or(tag.opacity_map.as_ref())
                .map(|path| asset_server.load(path.clone()));
            material
        });

        parent.spawn((
            PbrBundle {
                mesh: meshes.add(group_to_mesh(group)),
                material,
                ..default()
            },
            GeneratedModel,
            Name::new(group.material.name.clone()),
        ));
    }

    for instance in &descriptor.instances {
        parent.spawn((
            PbrBundle {
                mesh: placeholders.mesh.clone(),
                material: placeholders.material.clone(),
                transform: Transform::from_matrix(instance.transform),
                ..default()
            },
            GeneratedModel,
            InstanceAsset(instance.asset.clone()),
        ));
    }
}

/// Logs scheduler and cache counters when I is pressed.
fn log_bridge_stats(keyboard: Res<Input<KeyCode>>, bridge: Res<GenerationBridge>, materials: Res<MaterialCache>) {
    if !keyboard.just_pressed(KeyCode::I) {
        return;
    }
    let stats = bridge.scheduler.stats();
    let cache = bridge.scheduler.cache().stats();
    info!(
        "submitted {}, rejected {}, superseded {}, completed {}, failed {}, in flight {}",
        stats.submitted, stats.rejected, stats.superseded, stats.completed, stats.failed, stats.in_flight
    );
    info!(
        "cache: {} entries, {} bytes, {} hits, {} misses, {} evictions",
        cache.entries, cache.bytes, cache.hits, cache.misses, cache.evictions
    );
    info!("{} shared materials", materials.len());
}
