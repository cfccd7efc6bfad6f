use procgen_bridge::{BridgeConfig, CoordinateRemap, RulePackageRef};
use procgen_viewer::DemoScene;

fn asset(name: &str) -> String {
    format!("{}/assets/{}", env!("CARGO_MANIFEST_DIR"), name)
}

#[test]
fn shipped_bridge_config_loads() {
    let config = BridgeConfig::load(asset("bridge.ron")).unwrap();
    assert_eq!(config.coordinates, CoordinateRemap::identity());
    assert_eq!(config.max_completions_per_drain, 4);
    assert_eq!(config.cache.capacity, 128);
}

#[test]
fn shipped_scene_lots_validate() {
    let scene = DemoScene::load(&asset("scene.json")).unwrap();
    let package = RulePackageRef::new(scene.rule_package.clone(), scene.rule_version);
    assert_eq!(scene.lots.len(), 4);
    for lot in &scene.lots {
        assert!(lot.to_shape(&package).validate(1e-4).is_ok(), "lot {} should be valid", lot.key);
    }
    assert_eq!(scene.lots[2].start_rule, "Building");
}
