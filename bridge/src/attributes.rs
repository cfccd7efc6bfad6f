use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AttributeError;
use crate::fingerprint::{Fingerprint, FingerprintHasher};

/// Tagged rule parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Float(f64),
    String(String),
    BoolArray(Vec<bool>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Bool,
    Float,
    String,
    BoolArray,
    FloatArray,
    StringArray,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeKind::Bool => "bool",
            AttributeKind::Float => "float",
            AttributeKind::String => "string",
            AttributeKind::BoolArray => "bool[]",
            AttributeKind::FloatArray => "float[]",
            AttributeKind::StringArray => "string[]",
        };
        f.write_str(name)
    }
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Bool(_) => AttributeKind::Bool,
            AttributeValue::Float(_) => AttributeKind::Float,
            AttributeValue::String(_) => AttributeKind::String,
            AttributeValue::BoolArray(_) => AttributeKind::BoolArray,
            AttributeValue::FloatArray(_) => AttributeKind::FloatArray,
            AttributeValue::StringArray(_) => AttributeKind::StringArray,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(v) => Some(v),
            _ => None,
        }
    }

    fn hash_into(&self, h: &mut FingerprintHasher) {
        // array element order is kept as-is, it is meaningful to the rules
        match self {
            AttributeValue::Bool(v) => {
                h.tag(0).bool(*v);
            }
            AttributeValue::Float(v) => {
                h.tag(1).f64(*v);
            }
            AttributeValue::String(v) => {
                h.tag(2).str(v);
            }
            AttributeValue::BoolArray(vs) => {
                h.tag(3).len(vs.len());
                for v in vs {
                    h.bool(*v);
                }
            }
            AttributeValue::FloatArray(vs) => {
                h.tag(4).len(vs.len());
                for v in vs {
                    h.f64(*v);
                }
            }
            AttributeValue::StringArray(vs) => {
                h.tag(5).len(vs.len());
                for v in vs {
                    h.str(v);
                }
            }
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<Vec<bool>> for AttributeValue {
    fn from(v: Vec<bool>) -> Self {
        AttributeValue::BoolArray(v)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(v: Vec<f64>) -> Self {
        AttributeValue::FloatArray(v)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(v: Vec<String>) -> Self {
        AttributeValue::StringArray(v)
    }
}

/// Rule parameters keyed by name. Iteration is always in name order, which makes
/// the fingerprint independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    values: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`. A name keeps the kind of its first value for the
    /// lifetime of the set; a value of another kind is rejected.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Result<(), AttributeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(AttributeError::EmptyName);
        }
        let value = value.into();
        if let Some(existing) = self.values.get(&name) {
            if existing.kind() != value.kind() {
                return Err(AttributeError::TypeMismatch {
                    name,
                    existing: existing.kind(),
                    attempted: value.kind(),
                });
            }
        }
        self.values.insert(name, value);
        Ok(())
    }

    /// Builder form of [`AttributeSet::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Result<Self, AttributeError> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    /// Value for `name`, falling back to the rule package default. Unknown names are
    /// not an error, they resolve to `None` when neither side has them.
    pub fn resolve<'a>(&'a self, name: &str, defaults: &'a AttributeSet) -> Option<&'a AttributeValue> {
        self.values.get(name).or_else(|| defaults.get(name))
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttributeValue::as_float)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(AttributeValue::as_bool)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// New set with `other` layered on top. Layers are separate sets, so a later
    /// layer may change the kind of a name.
    pub fn overlay(&self, other: &AttributeSet) -> AttributeSet {
        let mut values = self.values.clone();
        for (name, value) in &other.values {
            values.insert(name.clone(), value.clone());
        }
        AttributeSet { values }
    }

    /// New set where names missing from `self` are taken from `defaults`.
    pub fn with_defaults(&self, defaults: &AttributeSet) -> AttributeSet {
        defaults.overlay(self)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut h = FingerprintHasher::new("procgen-attributes-v1");
        h.len(self.values.len());
        for (name, value) in &self.values {
            h.str(name);
            value.hash_into(&mut h);
        }
        h.finish()
    }
}
