//! Key/value parameter bags used by adjustment layers and AI requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pixel::Rgba;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Float(f32),
    Int(i64),
    Bool(bool),
    Color(Rgba),
    /// Curve control points, `(input, output)` in 0..255.
    Points(Vec<(f32, f32)>),
    Text(String),
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<Rgba> for ParamValue {
    fn from(v: Rgba) -> Self {
        ParamValue::Color(v)
    }
}

impl From<Vec<(f32, f32)>> for ParamValue {
    fn from(v: Vec<(f32, f32)>) -> Self {
        ParamValue::Points(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Ordered string → value map. Typed getters fall back to a default when a
/// key is missing or holds a different type; ints and floats convert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamMap(BTreeMap<String, ParamValue>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn f32_or(&self, key: &str, default: f32) -> f32 {
        match self.0.get(key) {
            Some(ParamValue::Float(v)) if v.is_finite() => *v,
            Some(ParamValue::Int(v)) => *v as f32,
            _ => default,
        }
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        match self.0.get(key) {
            Some(ParamValue::Int(v)) => *v,
            Some(ParamValue::Float(v)) if v.is_finite() => v.round() as i64,
            _ => default,
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(ParamValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn color_or(&self, key: &str, default: Rgba) -> Rgba {
        match self.0.get(key) {
            Some(ParamValue::Color(c)) => *c,
            _ => default,
        }
    }

    pub fn points(&self, key: &str) -> Option<&[(f32, f32)]> {
        match self.0.get(key) {
            Some(ParamValue::Points(p)) => Some(p.as_slice()),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(ParamValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_fall_back() {
        let p = ParamMap::new()
            .with("brightness", 20.0f32)
            .with("levels", 4i64)
            .with("mono", true);
        assert_eq!(p.f32_or("brightness", 0.0), 20.0);
        assert_eq!(p.f32_or("levels", 0.0), 4.0);
        assert_eq!(p.i64_or("brightness", 0), 20);
        assert_eq!(p.f32_or("missing", 1.5), 1.5);
        assert!(p.bool_or("mono", false));
        assert!(!p.bool_or("brightness", false));
        assert!(p.points("brightness").is_none());
    }

    #[test]
    fn nan_float_uses_default() {
        let p = ParamMap::new().with("x", f32::NAN);
        assert_eq!(p.f32_or("x", 3.0), 3.0);
    }
}
