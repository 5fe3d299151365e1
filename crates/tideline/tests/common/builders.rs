//! Builders for Applications and charts.

#![allow(dead_code)]

use tideline::gitops::{
    ApplicationDestination, ApplicationResource, ApplicationSource, ApplicationSpec, ResourceKind,
    RetryPolicy, SyncMode, SyncPolicy,
};

/// Repository every harness commit goes to.
pub const REPO: &str = "mem://deploy";
pub const BRANCH: &str = "main";

pub const NAMESPACE_TEMPLATE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: {{ .Release.Namespace }}
"#;

pub const CONFIG_MAP_TEMPLATE: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ .Release.Name }}-config
data:
  greeting: {{ .Values.greeting | quote }}
"#;

pub const SERVICE_TEMPLATE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: {{ .Release.Name }}
spec:
  ports:
    - port: 80
"#;

pub const DEPLOYMENT_TEMPLATE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ .Release.Name }}
spec:
  replicas: {{ .Values.replicas }}
  template:
    spec:
      containers:
        - name: app
          image: "nginx:{{ .Values.tag }}"
"#;

/// Builder for `ApplicationResource`s.
pub struct ApplicationBuilder {
    name: String,
    repo_url: String,
    path: String,
    target_revision: String,
    namespace: String,
    policy: SyncPolicy,
}

impl ApplicationBuilder {
    /// A manual Application reading chart `name` from the shared repository.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            repo_url: REPO.to_string(),
            path: name.to_string(),
            target_revision: BRANCH.to_string(),
            namespace: "prod".to_string(),
            policy: SyncPolicy::default(),
        }
    }

    pub fn repo(mut self, url: &str) -> Self {
        self.repo_url = url.to_string();
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn automatic(mut self) -> Self {
        self.policy.mode = SyncMode::Automatic;
        self
    }

    pub fn manual(mut self) -> Self {
        self.policy.mode = SyncMode::Manual;
        self
    }

    pub fn prune(mut self, prune: bool) -> Self {
        self.policy.prune = prune;
        self
    }

    pub fn self_heal(mut self, self_heal: bool) -> Self {
        self.policy.self_heal = self_heal;
        self
    }

    pub fn retry(mut self, limit: u32, backoff_ms: u64) -> Self {
        self.policy.retry = Some(RetryPolicy { limit, backoff_ms });
        self
    }

    pub fn build(self) -> ApplicationResource {
        ApplicationResource::new(
            ResourceKind::Application,
            self.name,
            ApplicationSpec {
                source: ApplicationSource {
                    repo_url: self.repo_url,
                    path: self.path,
                    target_revision: self.target_revision,
                    value_files: Vec::new(),
                    values: serde_json::Value::Null,
                },
                destination: ApplicationDestination {
                    server: "in-cluster".to_string(),
                    namespace: self.namespace,
                },
                sync_policy: self.policy,
            },
        )
    }
}

/// Builder for the files of one chart directory.
#[derive(Clone)]
pub struct ChartBuilder {
    dir: String,
    values: String,
    templates: Vec<(String, String)>,
}

impl ChartBuilder {
    /// An empty chart stored under `dir/`.
    pub fn new(dir: &str) -> Self {
        Self {
            dir: dir.to_string(),
            values: String::new(),
            templates: Vec::new(),
        }
    }

    /// Namespace, ConfigMap, Service and Deployment.
    pub fn standard(dir: &str, greeting: &str) -> Self {
        Self::new(dir)
            .values(&format!("greeting: {greeting}\nreplicas: 2\ntag: \"1.27\"\n"))
            .template("namespace.yaml", NAMESPACE_TEMPLATE)
            .template("config.yaml", CONFIG_MAP_TEMPLATE)
            .template("service.yaml", SERVICE_TEMPLATE)
            .template("deployment.yaml", DEPLOYMENT_TEMPLATE)
    }

    pub fn values(mut self, values: &str) -> Self {
        self.values = values.to_string();
        self
    }

    pub fn template(mut self, file: &str, content: &str) -> Self {
        self.templates.retain(|(f, _)| f != file);
        self.templates.push((file.to_string(), content.to_string()));
        self
    }

    pub fn without(mut self, file: &str) -> Self {
        self.templates.retain(|(f, _)| f != file);
        self
    }

    /// Repository paths and contents.
    pub fn files(&self) -> Vec<(String, String)> {
        let mut files = vec![
            (
                format!("{}/Chart.yaml", self.dir),
                format!("name: {}\nversion: 0.1.0\n", self.dir),
            ),
            (format!("{}/values.yaml", self.dir), self.values.clone()),
        ];
        for (file, content) in &self.templates {
            files.push((format!("{}/templates/{}", self.dir, file), content.clone()));
        }
        files
    }
}
