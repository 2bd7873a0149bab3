//! Open-ended operator parameters attached to graph nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String-keyed attribute bag. Ordered so serialized graphs are stable.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Tagged attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strs(Vec<String>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strs(&self) -> Option<&[String]> {
        match self {
            AttrValue::Strs(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttrValue>> {
        match self {
            AttrValue::Map(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        AttrValue::Int(value as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(value: Vec<i64>) -> Self {
        AttrValue::Ints(value)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(value: Vec<f64>) -> Self {
        AttrValue::Floats(value)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(value: Vec<String>) -> Self {
        AttrValue::Strs(value)
    }
}

impl From<BTreeMap<String, AttrValue>> for AttrValue {
    fn from(value: BTreeMap<String, AttrValue>) -> Self {
        AttrValue::Map(value)
    }
}

impl From<BTreeMap<String, String>> for AttrValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        AttrValue::Map(
            value
                .into_iter()
                .map(|(k, v)| (k, AttrValue::Str(v)))
                .collect(),
        )
    }
}
