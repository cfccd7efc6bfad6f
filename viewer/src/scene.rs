use bevy::math::DVec3;
use bevy::prelude::*;
use procgen_bridge::{AttributeSet, InitialShape, RulePackageRef, ShapeKey};
use serde::{Deserialize, Serialize};

/// One lot of the demo scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotDescription {
    pub key: u64,
    /// Footprint corners on the ground plane as (x, z).
    pub footprint: Vec<[f64; 2]>,
    #[serde(default)]
    pub seed: i32,
    #[serde(default = "default_start_rule")]
    pub start_rule: String,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub wall_color: Option<String>,
}

fn default_start_rule() -> String {
    "Lot".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoScene {
    pub rule_package: String,
    pub rule_version: u64,
    pub lots: Vec<LotDescription>,
}

impl DemoScene {
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let scene: DemoScene = serde_json::from_str(&content)?;
        Ok(scene)
    }

    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("Failed to load demo scene {}: {}, using the built-in block", path, e);
            Self::default_scene()
        })
    }

    pub fn default_scene() -> Self {
        Self {
            rule_package: "extrude".to_string(),
            rule_version: 1,
            lots: vec![
                LotDescription {
                    key: 1,
                    footprint: vec![[0.0, 0.0], [8.0, 0.0], [8.0, -6.0], [0.0, -6.0]],
                    seed: 1,
                    start_rule: default_start_rule(),
                    height: Some(12.0),
                    wall_color: None,
                },
                LotDescription {
                    key: 2,
                    footprint: vec![[12.0, 0.0], [18.0, 0.0], [18.0, -4.0], [15.0, -8.0], [12.0, -4.0]],
                    seed: 2,
                    start_rule: default_start_rule(),
                    height: Some(7.5),
                    wall_color: Some("#b0c4de".to_string()),
                },
            ],
        }
    }
}

impl LotDescription {
    pub fn to_shape(&self, rule_package: &RulePackageRef) -> InitialShape {
        let vertices = self.footprint.iter().map(|&[x, z]| DVec3::new(x, 0.0, z)).collect();
        InitialShape::new(vertices, rule_package.clone(), self.start_rule.clone())
            .with_seed(self.seed)
            .with_key(ShapeKey(self.key))
    }

    /// Per-lot overrides; names the rule package does not declare are ignored by it.
    pub fn attributes(&self) -> AttributeSet {
        let mut attributes = AttributeSet::new();
        if let Some(height) = self.height {
            if let Err(e) = attributes.set("height", height) {
                warn!("lot {}: {}", self.key, e);
            }
        }
        if let Some(color) = &self.wall_color {
            if let Err(e) = attributes.set("wallColor", color.as_str()) {
                warn!("lot {}: {}", self.key, e);
            }
        }
        attributes
    }
}
