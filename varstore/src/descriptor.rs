//! Descriptor loader. A descriptor is a JSON document with the ordered layout
//! tree under `__struct__` and a table of named shortcuts under
//! `__metainfo__`. Key order is kept as written because it is byte order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor file unreadable: {0}")]
    Io(String),
    #[error("descriptor parse failed: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "__struct__")]
    pub layout: Value,
    /// Shortcut name to either a tree path or an inline leaf spec.
    #[serde(rename = "__metainfo__", default)]
    pub shortcuts: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn from_json(text: &str) -> Result<Self, DescriptorError> {
        serde_json::from_str(text).map_err(|e| DescriptorError::Parse(format!("{e}")))
    }

    pub fn from_value(value: Value) -> Result<Self, DescriptorError> {
        serde_json::from_value(value).map_err(|e| DescriptorError::Parse(format!("{e}")))
    }
}

/// Reads and parses a descriptor file.
pub fn load_descriptor(path: impl AsRef<Path>) -> Result<Descriptor, DescriptorError> {
    let raw_json = fs::read_to_string(&path).map_err(|e| DescriptorError::Io(format!("{e}")))?;
    Descriptor::from_json(&raw_json)
}
