//! Charts and values overlays read from a source tree.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::values::merge_layers;
use super::RenderError;
use crate::gitops::source::{normalize_path, SourceTree};

pub const CHART_FILE: &str = "Chart.yaml";
pub const VALUES_FILE: &str = "values.yaml";
pub const TEMPLATES_DIR: &str = "templates";

/// `Chart.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A chart: metadata, default values and templates sorted by path.
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub defaults: Value,
    pub templates: Vec<(String, String)>,
}

impl Chart {
    /// Reads a chart rooted at the tree's top level.
    ///
    /// Files under `templates/` whose name starts with `_` are partials and
    /// are not rendered on their own.
    pub fn from_tree(tree: &SourceTree) -> Result<Self, RenderError> {
        let raw = tree
            .get(CHART_FILE)
            .ok_or_else(|| RenderError::MissingChart(format!("{} not found", CHART_FILE)))?;
        let metadata: ChartMetadata =
            serde_yaml::from_str(raw).map_err(|e| RenderError::InvalidYaml {
                file: CHART_FILE.to_string(),
                message: e.to_string(),
            })?;
        if metadata.name.trim().is_empty() {
            return Err(RenderError::MissingChart(format!(
                "{} has an empty name",
                CHART_FILE
            )));
        }

        let defaults = match tree.get(VALUES_FILE) {
            Some(raw) => parse_values(VALUES_FILE, raw)?,
            None => Value::Object(Map::new()),
        };

        let templates = tree
            .files_under(TEMPLATES_DIR)
            .filter(|(path, _)| is_template(path))
            .map(|(path, contents)| (path.to_string(), contents.to_string()))
            .collect();

        Ok(Self {
            metadata,
            defaults,
            templates,
        })
    }
}

fn is_template(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    (file.ends_with(".yaml") || file.ends_with(".yml")) && !file.starts_with('_')
}

/// Parses a values document; an empty document is an empty map.
fn parse_values(file: &str, raw: &str) -> Result<Value, RenderError> {
    if super::is_blank_document(raw) {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_yaml::from_str(raw).map_err(|e| RenderError::InvalidYaml {
        file: file.to_string(),
        message: e.to_string(),
    })?;
    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(value),
        _ => Err(RenderError::InvalidYaml {
            file: file.to_string(),
            message: "values must be a mapping".to_string(),
        }),
    }
}

/// Environment-specific values applied over the chart defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValuesOverlay {
    files: Vec<(String, Value)>,
    inline: Value,
}

impl ValuesOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `value_files` (relative to the chart) from the tree, in order.
    pub fn from_tree(
        tree: &SourceTree,
        value_files: &[String],
        inline: &Value,
    ) -> Result<Self, RenderError> {
        let mut overlay = Self::new().with_inline(inline.clone());
        for file in value_files {
            let path = normalize_path(file)
                .map_err(|_| RenderError::MissingChart(format!("invalid value file path '{}'", file)))?;
            let raw = tree
                .get(&path)
                .ok_or_else(|| RenderError::MissingChart(format!("value file '{}' not found", file)))?;
            overlay.files.push((path.clone(), parse_values(&path, raw)?));
        }
        Ok(overlay)
    }

    pub fn with_file(mut self, name: impl Into<String>, values: Value) -> Self {
        self.files.push((name.into(), values));
        self
    }

    pub fn with_inline(mut self, values: Value) -> Self {
        self.inline = values;
        self
    }

    /// `defaults` ← each value file ← inline values.
    pub fn merged_over(&self, defaults: &Value) -> Value {
        merge_layers(
            std::iter::once(defaults)
                .chain(self.files.iter().map(|(_, v)| v))
                .chain(std::iter::once(&self.inline)),
        )
    }
}
