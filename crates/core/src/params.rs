//! Hierarchical parameter document: a `common` group plus one group per step.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;

pub const COMMON_GROUP: &str = "common";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterDocument {
    root: Map<String, Value>,
}

impl ParameterDocument {
    pub fn new(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// Load a TOML parameter file. A missing file yields an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Parameter file {} not found, binding no parameters", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read parameter file")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content).context("Failed to parse parameter file")?;
        let value = serde_json::to_value(table).context("Failed to convert parameters")?;
        match value {
            Value::Object(root) => Ok(Self { root }),
            _ => anyhow::bail!("Parameter document must be a table"),
        }
    }

    /// Write the document back, including derived values recorded by steps
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(&self.root).context("Failed to serialize parameters")?;
        std::fs::write(path, content).context("Failed to write parameter file")
    }

    pub fn common(&self) -> Option<&Map<String, Value>> {
        self.group(COMMON_GROUP)
    }

    /// Group of a step; absent or non-table groups are `None`
    pub fn group(&self, name: &str) -> Option<&Map<String, Value>> {
        self.root.get(name).and_then(Value::as_object)
    }

    /// The groups bound for `step`, in binding order
    pub fn groups_for_step(&self, step: &str) -> Vec<(String, Map<String, Value>)> {
        let mut groups = Vec::new();
        if let Some(common) = self.common() {
            groups.push((COMMON_GROUP.to_string(), common.clone()));
        }
        if step != COMMON_GROUP {
            if let Some(own) = self.group(step) {
                groups.push((step.to_string(), own.clone()));
            }
        }
        groups
    }

    /// JSON value covering every group bound for `step`, used for cache keys
    pub fn bound_value(&self, step: &str) -> Value {
        let groups: Map<String, Value> = self
            .groups_for_step(step)
            .into_iter()
            .map(|(name, values)| (name, Value::Object(values)))
            .collect();
        Value::Object(groups)
    }

    /// Store a value derived during a run; an existing key is kept
    pub fn set_derived(&mut self, group: &str, key: &str, value: Value) -> Value {
        let entry = self
            .root
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = entry {
            return map.entry(key.to_string()).or_insert(value).clone();
        }

        // A scalar under the group name is replaced by a table
        let mut map = Map::new();
        map.insert(key.to_string(), value.clone());
        *entry = Value::Object(map);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const PARAMS: &str = r#"
        [common]
        target = "TARGET"

        [preprocess]
        skip_mark = true

        [split_dataset]
        split_test = true
        num_test_objects = 1
    "#;

    #[test]
    fn test_groups_for_step_skips_absent_groups() {
        let doc = ParameterDocument::from_toml_str(PARAMS).unwrap();

        let groups = doc.groups_for_step("preprocess");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "common");
        assert_eq!(groups[1].1.get("skip_mark"), Some(&json!(true)));

        let groups = doc.groups_for_step("train");
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_derived_values_survive_save() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("params.toml");

        let mut doc = ParameterDocument::from_toml_str(PARAMS).unwrap();
        let stored = doc.set_derived("split_dataset", "test_objects", json!(["WELL1"]));
        assert_eq!(stored, json!(["WELL1"]));

        // First value wins
        let stored = doc.set_derived("split_dataset", "test_objects", json!(["WELL2"]));
        assert_eq!(stored, json!(["WELL1"]));

        doc.save(&path).unwrap();
        let reloaded = ParameterDocument::load(&path).unwrap();
        assert_eq!(reloaded, doc);
    }

    #[test]
    fn test_bound_value_changes_with_step_group() {
        let doc = ParameterDocument::from_toml_str(PARAMS).unwrap();
        assert_ne!(doc.bound_value("preprocess"), doc.bound_value("split_dataset"));
        assert_eq!(doc.bound_value("train"), json!({"common": {"target": "TARGET"}}));
    }
}
