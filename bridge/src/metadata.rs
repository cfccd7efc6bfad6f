//! Editing hints a rule package attaches to its attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attributes::{AttributeSet, AttributeValue};

/// How a host should present and constrain one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeAnnotation {
    /// Numeric bounds; either end may be open.
    Range {
        min: Option<f64>,
        max: Option<f64>,
        step_size: f64,
        restricted: bool,
    },
    /// A fixed list of choices.
    Enum {
        values: Vec<AttributeValue>,
        restricted: bool,
    },
    Color,
    /// An asset path, optionally limited to some extensions (without the dot).
    File { extensions: Vec<String> },
    Directory,
}

impl AttributeAnnotation {
    /// Restricted range with the default step of 0.1.
    pub fn range(min: Option<f64>, max: Option<f64>) -> Self {
        AttributeAnnotation::Range {
            min,
            max,
            step_size: 0.1,
            restricted: true,
        }
    }

    pub fn choices(values: impl IntoIterator<Item = impl Into<AttributeValue>>) -> Self {
        AttributeAnnotation::Enum {
            values: values.into_iter().map(Into::into).collect(),
            restricted: true,
        }
    }

    /// Whether a host may set `value`. Unrestricted annotations accept anything.
    pub fn accepts(&self, value: &AttributeValue) -> bool {
        match self {
            AttributeAnnotation::Range { min, max, restricted: true, .. } => match value.as_float() {
                Some(v) => v.is_finite() && min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m),
                None => false,
            },
            AttributeAnnotation::Enum { values, restricted: true } => values.contains(value),
            AttributeAnnotation::File { extensions } if !extensions.is_empty() => match value.as_str() {
                Some(path) => path
                    .rsplit_once('.')
                    .is_some_and(|(_, ext)| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))),
                None => false,
            },
            _ => true,
        }
    }

    /// Pulls a float into a restricted range. Other values pass through.
    pub fn clamp(&self, value: AttributeValue) -> AttributeValue {
        match (self, &value) {
            (AttributeAnnotation::Range { min, max, restricted: true, .. }, AttributeValue::Float(v)) => {
                let mut v = *v;
                if let Some(min) = min {
                    v = v.max(*min);
                }
                if let Some(max) = max {
                    v = v.min(*max);
                }
                AttributeValue::Float(v)
            }
            _ => value,
        }
    }
}

/// Presentation data for one attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    pub annotation: Option<AttributeAnnotation>,
    pub hidden: bool,
    pub order: Option<i32>,
    /// Nested group path, outermost first.
    pub groups: Vec<String>,
    pub group_order: Option<i32>,
    pub description: Option<String>,
}

impl AttributeMetadata {
    pub fn annotated(annotation: AttributeAnnotation) -> Self {
        Self {
            annotation: Some(annotation),
            ..Default::default()
        }
    }

    pub fn in_group(mut self, group: impl Into<String>, group_order: i32) -> Self {
        self.groups.push(group.into());
        self.group_order = Some(group_order);
        self
    }

    pub fn ordered(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }
}

/// Rule defaults for a shape together with their metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleAttributes {
    pub defaults: AttributeSet,
    pub metadata: BTreeMap<String, AttributeMetadata>,
}

impl RuleAttributes {
    pub fn new(defaults: AttributeSet) -> Self {
        Self {
            defaults,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, name: impl Into<String>, metadata: AttributeMetadata) -> Self {
        self.metadata.insert(name.into(), metadata);
        self
    }

    pub fn metadata(&self, name: &str) -> Option<&AttributeMetadata> {
        self.metadata.get(name)
    }

    /// Attribute names to show, by group order, group path, order, then name.
    /// Unordered entries go last.
    pub fn visible_names(&self) -> Vec<&str> {
        let fallback = AttributeMetadata::default();
        let mut names: Vec<(&str, &AttributeMetadata)> = self
            .defaults
            .iter()
            .map(|(name, _)| (name, self.metadata.get(name).unwrap_or(&fallback)))
            .filter(|(_, meta)| !meta.hidden)
            .collect();
        names.sort_by(|(a, ma), (b, mb)| {
            let rank = |m: &AttributeMetadata| m.group_order.unwrap_or(i32::MAX);
            rank(ma)
                .cmp(&rank(mb))
                .then_with(|| ma.groups.cmp(&mb.groups))
                .then_with(|| ma.order.unwrap_or(i32::MAX).cmp(&mb.order.unwrap_or(i32::MAX)))
                .then_with(|| a.cmp(b))
        });
        names.into_iter().map(|(name, _)| name).collect()
    }

    /// Names in `attributes` whose value a restricted annotation refuses.
    pub fn violations<'a>(&self, attributes: &'a AttributeSet) -> Vec<&'a str> {
        attributes
            .iter()
            .filter(|(name, value)| {
                self.metadata
                    .get(*name)
                    .and_then(|m| m.annotation.as_ref())
                    .is_some_and(|a| !a.accepts(value))
            })
            .map(|(name, _)| name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn building() -> RuleAttributes {
        let defaults = AttributeSet::new()
            .with("height", 10.0)
            .unwrap()
            .with("roofColor", "#6b4e3d")
            .unwrap()
            .with("seedSalt", 0.0)
            .unwrap()
            .with("style", "brick")
            .unwrap();
        RuleAttributes::new(defaults)
            .with_metadata(
                "height",
                AttributeMetadata::annotated(AttributeAnnotation::range(Some(0.0), Some(100.0))).ordered(0),
            )
            .with_metadata(
                "roofColor",
                AttributeMetadata::annotated(AttributeAnnotation::Color).in_group("Roof", 1),
            )
            .with_metadata(
                "seedSalt",
                AttributeMetadata {
                    hidden: true,
                    ..Default::default()
                },
            )
            .with_metadata(
                "style",
                AttributeMetadata::annotated(AttributeAnnotation::choices(["brick", "glass"])).ordered(1),
            )
    }

    #[test]
    fn restricted_range_refuses_and_clamps() {
        let range = AttributeAnnotation::range(Some(0.0), Some(100.0));
        assert!(range.accepts(&AttributeValue::Float(50.0)));
        assert!(!range.accepts(&AttributeValue::Float(150.0)));
        assert!(!range.accepts(&AttributeValue::Float(f64::NAN)));
        assert!(!range.accepts(&AttributeValue::String("50".into())));
        assert_eq!(range.clamp(AttributeValue::Float(-3.0)), AttributeValue::Float(0.0));
        assert_eq!(range.clamp(AttributeValue::Bool(true)), AttributeValue::Bool(true));

        let open = AttributeAnnotation::Range {
            min: Some(1.0),
            max: None,
            step_size: 0.5,
            restricted: false,
        };
        assert!(open.accepts(&AttributeValue::Float(-10.0)));
        assert_eq!(open.clamp(AttributeValue::Float(-10.0)), AttributeValue::Float(-10.0));
    }

    #[test]
    fn file_extensions_are_matched_case_insensitively() {
        let file = AttributeAnnotation::File {
            extensions: vec!["obj".into(), "glb".into()],
        };
        assert!(file.accepts(&AttributeValue::String("assets/window.GLB".into())));
        assert!(!file.accepts(&AttributeValue::String("assets/window".into())));
        assert!(AttributeAnnotation::File { extensions: vec![] }.accepts(&AttributeValue::String("x".into())));
    }

    #[test]
    fn visible_names_skip_hidden_and_follow_order() {
        let attributes = building();
        assert_eq!(attributes.visible_names(), vec!["roofColor", "height", "style"]);
    }

    #[test]
    fn violations_name_refused_values() {
        let attributes = building();
        let input = AttributeSet::new()
            .with("height", 250.0)
            .unwrap()
            .with("style", "wood")
            .unwrap()
            .with("roofColor", "anything")
            .unwrap()
            .with("unknown", 1.0)
            .unwrap();
        assert_eq!(attributes.violations(&input), vec!["height", "style"]);
    }
}
