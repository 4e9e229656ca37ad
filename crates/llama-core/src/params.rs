//! Open-ended parameter maps passed through to the engine.
//!
//! The bridge never interprets these maps; engines read the keys they know
//! through the typed accessors and ignore the rest. Type checking happens
//! lazily, at the point an engine asks for a value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One parameter value. Mirrors the JSON value space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(Params),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}
impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}
impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}
impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}
impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}
impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}
impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}
impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
impl From<Params> for ParamValue {
    fn from(v: Params) -> Self {
        Self::Map(v)
    }
}
impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// A recognized key held a value of the wrong kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parameter '{key}' must be {expected}, got {found}")]
pub struct ParamError {
    pub key: String,
    pub expected: &'static str,
    pub found: &'static str,
}

/// String-keyed parameter map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.0.remove(key)
    }

    /// Overlay every entry of `other` on top of `self`.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
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

    //  Typed accessors. `null` counts as absent.

    fn typed<'a, T>(
        &'a self,
        key: &str,
        expected: &'static str,
        pick: impl FnOnce(&'a ParamValue) -> Option<T>,
    ) -> Result<Option<T>, ParamError> {
        match self.0.get(key) {
            None | Some(ParamValue::Null) => Ok(None),
            Some(v) => pick(v).map(Some).ok_or_else(|| ParamError {
                key: key.to_owned(),
                expected,
                found: v.type_name(),
            }),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, ParamError> {
        self.typed(key, "a string", ParamValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ParamError> {
        self.typed(key, "a bool", ParamValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ParamError> {
        self.typed(key, "an integer", ParamValue::as_i64)
    }

    pub fn get_i32(&self, key: &str) -> Result<Option<i32>, ParamError> {
        self.typed(key, "a 32-bit integer", |v| {
            v.as_i64().and_then(|n| i32::try_from(n).ok())
        })
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, ParamError> {
        self.typed(key, "a non-negative 32-bit integer", |v| {
            v.as_i64().and_then(|n| u32::try_from(n).ok())
        })
    }

    pub fn get_f32(&self, key: &str) -> Result<Option<f32>, ParamError> {
        self.typed(key, "a number", |v| v.as_f64().map(|f| f as f32))
    }

    /// A list of strings. A bare string is accepted as a one-element list.
    pub fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, ParamError> {
        self.typed(key, "a list of strings", |v| match v {
            ParamValue::String(s) => Some(vec![s.clone()]),
            ParamValue::List(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_owned))
                .collect(),
            _ => None,
        })
    }
}

impl FromIterator<(String, ParamValue)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_map_to_variants() {
        let p = Params::from_json(
            r#"{"n_ctx": 2048, "temperature": 0.7, "use_mmap": true, "stop": ["</s>"],
                "extra": {"nested": null}, "name": "x"}"#,
        )
        .unwrap();
        assert_eq!(p.get("n_ctx"), Some(&ParamValue::Int(2048)));
        assert_eq!(p.get("temperature"), Some(&ParamValue::Float(0.7)));
        assert_eq!(p.get("use_mmap"), Some(&ParamValue::Bool(true)));
        assert!(matches!(p.get("extra"), Some(ParamValue::Map(m)) if m.get("nested") == Some(&ParamValue::Null)));
        assert_eq!(p.get_str("name").unwrap(), Some("x"));
    }

    #[test]
    fn numeric_accessors_coerce() {
        let p = Params::new()
            .with("a", 3)
            .with("b", 4.0)
            .with("c", 0.5)
            .with("neg", -1);
        assert_eq!(p.get_f32("a").unwrap(), Some(3.0));
        assert_eq!(p.get_i64("b").unwrap(), Some(4));
        assert!(p.get_i64("c").is_err());
        assert!(p.get_u32("neg").is_err());
        assert_eq!(p.get_i32("neg").unwrap(), Some(-1));
    }

    #[test]
    fn missing_and_null_are_absent() {
        let p = Params::from_json(r#"{"seed": null}"#).unwrap();
        assert_eq!(p.get_u32("seed").unwrap(), None);
        assert_eq!(p.get_u32("nope").unwrap(), None);
    }

    #[test]
    fn type_mismatch_names_the_key() {
        let p = Params::new().with("prompt", 12);
        let err = p.get_str("prompt").unwrap_err();
        assert_eq!(err.key, "prompt");
        assert_eq!(err.found, "integer");
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn string_lists_accept_a_bare_string() {
        let p = Params::new()
            .with("one", "\n")
            .with("many", vec!["a", "b"])
            .with("bad", vec![ParamValue::Int(1)]);
        assert_eq!(p.get_str_list("one").unwrap(), Some(vec!["\n".to_string()]));
        assert_eq!(
            p.get_str_list("many").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(p.get_str_list("bad").is_err());
    }

    #[test]
    fn merge_overlays_entries() {
        let mut base = Params::new().with("n_ctx", 512).with("n_threads", 4);
        base.merge(&Params::new().with("n_ctx", 4096));
        assert_eq!(base.get_u32("n_ctx").unwrap(), Some(4096));
        assert_eq!(base.get_u32("n_threads").unwrap(), Some(4));
    }
}
