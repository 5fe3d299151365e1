//! Configuration loader for multi-file YAML configurations.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::{GitOpsError, Result};
use super::render::{is_blank_document, split_documents};
use super::resource::{
    AnyResource, ApplicationResource, RepositoryResource, ResourceHeader, ResourceKind,
    ResourceWithPath, SettingsResource, API_VERSION,
};
use super::validation::ConfigValidator;
use crate::config::EngineSettings;

/// Loaded configuration from the config directory.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Engine settings; defaults when no Settings resource exists.
    pub settings: EngineSettings,
    /// Applications, sorted by name.
    pub applications: Vec<ResourceWithPath<ApplicationResource>>,
    /// Repositories, sorted by name.
    pub repositories: Vec<ResourceWithPath<RepositoryResource>>,
}

impl LoadedConfig {
    pub fn application(&self, name: &str) -> Option<&ApplicationResource> {
        self.applications
            .iter()
            .map(|a| &a.resource)
            .find(|a| a.name() == name)
    }

    /// Repository resources, for building a [`GitSource`](super::git::GitSource).
    pub fn repository_resources(&self) -> impl Iterator<Item = &RepositoryResource> {
        self.repositories.iter().map(|r| &r.resource)
    }
}

/// Configuration loader for the engine.
pub struct ConfigLoader {
    /// Root directory for configuration files.
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads, validates and applies environment overrides.
    ///
    /// Files may hold several resources separated by `---`. Hidden files and
    /// directories are skipped.
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.config_dir.exists() {
            return Err(GitOpsError::ConfigDirNotFound(self.config_dir.clone()));
        }

        let mut settings: Option<ResourceWithPath<SettingsResource>> = None;
        let mut applications: Vec<ResourceWithPath<ApplicationResource>> = Vec::new();
        let mut repositories: Vec<ResourceWithPath<RepositoryResource>> = Vec::new();

        let mut paths: Vec<PathBuf> = WalkDir::new(&self.config_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| path.is_file() && self.is_config_file(path))
            .collect();
        paths.sort();

        for path in paths {
            let relative_path = path
                .strip_prefix(&self.config_dir)
                .unwrap_or(&path)
                .to_path_buf();

            let resources = self.load_file(&path).inspect_err(|e| {
                log::warn!("Failed to load {}: {}", path.display(), e);
            })?;

            for resource in resources {
                match resource {
                    AnyResource::Settings(r) => {
                        if settings.is_some() {
                            return Err(GitOpsError::DuplicateName {
                                kind: "Settings".to_string(),
                                name: r.metadata.name.clone(),
                            });
                        }
                        settings = Some(ResourceWithPath::new(r, relative_path.clone()));
                    }
                    AnyResource::Application(r) => {
                        if applications
                            .iter()
                            .any(|a| a.resource.metadata.name == r.metadata.name)
                        {
                            return Err(GitOpsError::DuplicateName {
                                kind: "Application".to_string(),
                                name: r.metadata.name.clone(),
                            });
                        }
                        applications.push(ResourceWithPath::new(r, relative_path.clone()));
                    }
                    AnyResource::Repository(r) => {
                        if repositories
                            .iter()
                            .any(|repo| repo.resource.metadata.name == r.metadata.name)
                        {
                            return Err(GitOpsError::DuplicateName {
                                kind: "Repository".to_string(),
                                name: r.metadata.name.clone(),
                            });
                        }
                        repositories.push(ResourceWithPath::new(r, relative_path.clone()));
                    }
                }
            }
        }

        let mut settings = match settings {
            Some(s) => s.resource.spec,
            None => {
                log::info!(
                    "No Settings resource in {}, using defaults",
                    self.config_dir.display()
                );
                EngineSettings::default()
            }
        };
        settings.apply_env_overrides();

        applications.sort_by(|a, b| a.resource.metadata.name.cmp(&b.resource.metadata.name));
        repositories.sort_by(|a, b| a.resource.metadata.name.cmp(&b.resource.metadata.name));

        let config = LoadedConfig {
            settings,
            applications,
            repositories,
        };
        ConfigValidator::new().validate(&config)?;

        log::info!(
            "Loaded {} application(s) and {} repository(ies) from {}",
            config.applications.len(),
            config.repositories.len(),
            self.config_dir.display()
        );
        Ok(config)
    }

    fn is_config_file(&self, path: &Path) -> bool {
        // Skip files in hidden directories or hidden files themselves
        if let Ok(relative) = path.strip_prefix(&self.config_dir) {
            let has_hidden_component = relative.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .map(|s| s.starts_with('.'))
                    .unwrap_or(false)
            });
            if has_hidden_component {
                return false;
            }
        }
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }

    /// Loads every resource of one file.
    pub fn load_file(&self, path: &Path) -> Result<Vec<AnyResource>> {
        let content = fs::read_to_string(path).map_err(|e| GitOpsError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        split_documents(&content)
            .into_iter()
            .filter(|doc| !is_blank_document(doc))
            .map(|doc| self.parse_resource(doc, path))
            .collect()
    }

    /// Parses a single resource from YAML content.
    pub fn parse_resource(&self, content: &str, path: &Path) -> Result<AnyResource> {
        let parse_error = |e: serde_yaml::Error| GitOpsError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        // First, parse the header to determine the kind
        let header: ResourceHeader = serde_yaml::from_str(content).map_err(parse_error)?;

        if header.api_version != API_VERSION {
            return Err(GitOpsError::InvalidApiVersion {
                version: header.api_version,
                expected: API_VERSION.to_string(),
            });
        }

        Ok(match header.kind {
            ResourceKind::Settings => {
                AnyResource::Settings(serde_yaml::from_str(content).map_err(parse_error)?)
            }
            ResourceKind::Application => {
                AnyResource::Application(serde_yaml::from_str(content).map_err(parse_error)?)
            }
            ResourceKind::Repository => {
                AnyResource::Repository(serde_yaml::from_str(content).map_err(parse_error)?)
            }
        })
    }
}
