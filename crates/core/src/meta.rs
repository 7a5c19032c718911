use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::array::DType;
use crate::error::ConfigurationError;
use crate::roi::Shape;

/// Per-axis semantic labels, e.g. `zyxc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisTags(Vec<char>);

impl AxisTags {
    pub fn parse(keys: &str) -> Self {
        Self(keys.chars().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[char] {
        &self.0
    }

    pub fn index_of(&self, key: char) -> Option<usize> {
        self.0.iter().position(|&k| k == key)
    }

    pub fn key(&self, axis: usize) -> Option<char> {
        self.0.get(axis).copied()
    }
}

impl fmt::Display for AxisTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for k in &self.0 {
            write!(f, "{k}")?;
        }
        Ok(())
    }
}

/// Conventional axis labels for an array of `shape`.
///
/// A 3-d array whose last extent is at most 4 is read as a multichannel
/// 2-d image (`yxc`) rather than a volume.
pub fn default_axis_order(shape: &[usize]) -> Result<AxisTags, ConfigurationError> {
    let keys = match shape.len() {
        2 => "yx",
        3 if shape[2] <= 4 => "yxc",
        3 => "zyx",
        4 => "zyxc",
        5 => "tzyxc",
        n => {
            return Err(ConfigurationError::UnsupportedShape(format!(
                "no default axis order for rank {n} (shape {shape:?})"
            )))
        }
    };
    Ok(AxisTags::parse(keys))
}

/// Description of the data a slot produces or accepts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Element type; `None` for non-array values.
    pub dtype: Option<DType>,
    pub shape: Shape,
    pub axistags: Option<AxisTags>,
    /// Free-form descriptive tags.
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    /// Array metadata; axis tags are filled in when a default order exists.
    pub fn array(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype: Some(dtype),
            shape: shape.to_vec(),
            axistags: default_axis_order(shape).ok(),
            tags: BTreeMap::new(),
        }
    }

    /// Metadata for a non-array value of the named kind.
    pub fn scalar(kind: &str) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("kind".to_string(), serde_json::Value::from(kind));
        Self {
            dtype: None,
            shape: Vec::new(),
            axistags: None,
            tags,
        }
    }

    pub fn with_axistags(mut self, axistags: AxisTags) -> Self {
        self.axistags = Some(axistags);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_array(&self) -> bool {
        self.dtype.is_some()
    }

    /// Index of the axis labelled `key`, if tagged.
    pub fn axis_index(&self, key: char) -> Option<usize> {
        self.axistags.as_ref().and_then(|t| t.index_of(key))
    }
}
