//! Rendering: chart + values overlay + revision → desired state.
//!
//! Rendering is a pure function of its inputs. Nothing here reads the
//! clock, the environment or the cluster, so equal inputs produce
//! byte-identical snapshots.

pub mod chart;
pub mod template;
pub mod values;

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde_json::{json, Value};
use thiserror::Error;

use super::manifest::{is_cluster_scoped, Manifest, ResourceKey, INSTANCE_LABEL};
use super::resource::ApplicationSource;
use super::snapshot::{DesiredStateSnapshot, RevisionId};
use super::source::SourceTree;

pub use chart::{Chart, ChartMetadata, ValuesOverlay};
pub use template::{render_template, SECRET_REF_PREFIX};

const MANIFEST_SCHEMA: &str = include_str!("../../../schema/manifest-v1.json");

/// Rendering failures. Each is fatal for the cycle that hit it only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Chart is incomplete: {0}")]
    MissingChart(String),

    #[error("Missing value in {template}:{line}: {message}")]
    MissingValue {
        template: String,
        line: usize,
        message: String,
    },

    #[error("Template syntax error in {template}:{line}: {message}")]
    TemplateSyntax {
        template: String,
        line: usize,
        message: String,
    },

    #[error("Invalid YAML in {file}: {message}")]
    InvalidYaml { file: String, message: String },

    #[error("Document {document} of {template} is not a valid manifest: {errors}")]
    SchemaViolation {
        template: String,
        document: usize,
        errors: String,
    },

    #[error("{key} is rendered by both {first} and {second}")]
    DuplicateResource {
        key: ResourceKey,
        first: String,
        second: String,
    },

    #[error("Manifest schema is invalid: {0}")]
    InvalidSchema(String),
}

/// The release a chart is rendered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Application name; also the value of the tracking label.
    pub name: String,
    /// Namespace given to namespaced manifests that do not set one.
    pub namespace: String,
}

impl Release {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

fn manifest_validator() -> Result<&'static jsonschema::Validator, RenderError> {
    static VALIDATOR: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| {
            let schema: Value = serde_json::from_str(MANIFEST_SCHEMA).map_err(|e| e.to_string())?;
            jsonschema::validator_for(&schema).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| RenderError::InvalidSchema(e.clone()))
}

/// Renders `chart` with `overlay` for `release` at `revision`.
pub fn render(
    chart: &Chart,
    overlay: &ValuesOverlay,
    revision: &RevisionId,
    release: &Release,
) -> Result<DesiredStateSnapshot, RenderError> {
    let validator = manifest_validator()?;
    let context = json!({
        "Values": overlay.merged_over(&chart.defaults),
        "Release": { "Name": release.name, "Namespace": release.namespace },
        "Chart": { "Name": chart.metadata.name, "Version": chart.metadata.version },
        "Revision": revision.as_str(),
    });

    let mut resources = BTreeMap::new();
    let mut origins: HashMap<ResourceKey, String> = HashMap::new();

    for (name, source) in &chart.templates {
        let text = render_template(name, source, &context)?;

        for (index, document) in split_documents(&text).into_iter().enumerate() {
            if is_blank_document(document) {
                continue;
            }
            let value: Value = serde_yaml::from_str(document).map_err(|e| RenderError::InvalidYaml {
                file: name.clone(),
                message: format!("document {}: {}", index + 1, e),
            })?;
            if value.is_null() {
                continue;
            }

            let errors: Vec<String> = validator.iter_errors(&value).map(|e| e.to_string()).collect();
            if !errors.is_empty() {
                return Err(RenderError::SchemaViolation {
                    template: name.clone(),
                    document: index + 1,
                    errors: errors.join("; "),
                });
            }

            let manifest = finalize(Manifest::new(value), release);
            let key = manifest.key();
            if let Some(first) = origins.get(&key) {
                return Err(RenderError::DuplicateResource {
                    key,
                    first: first.clone(),
                    second: name.clone(),
                });
            }
            origins.insert(key.clone(), name.clone());
            resources.insert(key, manifest);
        }
    }

    log::debug!(
        "Rendered {} manifest(s) for {} at {}",
        resources.len(),
        release.name,
        revision.short()
    );
    Ok(DesiredStateSnapshot::new(revision.clone(), resources))
}

/// Reads the chart and overlay of `source` from `tree` and renders it.
pub fn render_source(
    tree: &SourceTree,
    source: &ApplicationSource,
    revision: &RevisionId,
    release: &Release,
) -> Result<DesiredStateSnapshot, RenderError> {
    let chart = Chart::from_tree(tree)?;
    let overlay = ValuesOverlay::from_tree(tree, &source.value_files, &source.values)?;
    render(&chart, &overlay, revision, release)
}

/// Splits a multi-document YAML stream on `---` separator lines.
pub(crate) fn split_documents(text: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed.starts_with("--- ") {
            documents.push(&text[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    documents.push(&text[start..]);
    documents
}

/// True if the document holds only whitespace and comments.
pub(crate) fn is_blank_document(document: &str) -> bool {
    document
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#'))
}

/// Defaults the namespace and adds the tracking label.
fn finalize(mut manifest: Manifest, release: &Release) -> Manifest {
    if is_cluster_scoped(manifest.kind()) {
        manifest.clear_namespace();
    } else if manifest.namespace().is_empty() {
        manifest.set_namespace(&release.namespace);
    }
    manifest.set_label(INSTANCE_LABEL, &release.name);
    manifest
}
