//! Table-driven tests for loading engine configuration, plus an engine
//! wired end to end from a configuration directory and a local chart.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tideline::gitops::{ConfigLoader, GitOpsError, HealthStatus, MemoryCluster, ResourceKey, SyncPhase};
use tideline::{Engine, TidelineError};

/// A single configuration directory test case.
struct ConfigTestCase {
    /// Test case name for identification.
    name: &'static str,
    /// Files written to the config directory.
    files: &'static [(&'static str, &'static str)],
    /// Whether loading should succeed.
    should_succeed: bool,
    /// Expected error substring (if should_succeed is false).
    expected_error: Option<&'static str>,
}

const WEB_APP: &str = r#"apiVersion: tideline.io/v1
kind: Application
metadata:
  name: web
spec:
  source:
    repoUrl: https://example.com/org/deploy.git
    targetRevision: main
    path: charts/web
  destination:
    namespace: prod
  syncPolicy:
    mode: automatic
    prune: true
"#;

const CONFIG_TESTS: &[ConfigTestCase] = &[
    ConfigTestCase {
        name: "single_application",
        files: &[("web.yaml", WEB_APP)],
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "empty_directory",
        files: &[],
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "settings_and_repository",
        files: &[
            ("web.yaml", WEB_APP),
            (
                "settings.yaml",
                r#"apiVersion: tideline.io/v1
kind: Settings
metadata:
  name: engine
spec:
  refreshIntervalSecs: 30
  retry:
    maxRetries: 5
"#,
            ),
            (
                "repos/deploy.yaml",
                r#"apiVersion: tideline.io/v1
kind: Repository
metadata:
  name: deploy
spec:
  url: https://example.com/org/deploy.git
  auth:
    type: token
    tokenFile: /run/secrets/deploy-token
"#,
            ),
        ],
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "wrong_api_version",
        files: &[(
            "web.yaml",
            "apiVersion: tideline.io/v2\nkind: Application\nmetadata:\n  name: web\nspec: {}\n",
        )],
        should_succeed: false,
        expected_error: Some("tideline.io/v2"),
    },
    ConfigTestCase {
        name: "uppercase_application_name",
        files: &[(
            "web.yaml",
            r#"apiVersion: tideline.io/v1
kind: Application
metadata:
  name: Web
spec:
  source:
    repoUrl: https://example.com/org/deploy.git
  destination:
    namespace: prod
"#,
        )],
        should_succeed: false,
        expected_error: Some("DNS-1123"),
    },
    ConfigTestCase {
        name: "missing_destination_namespace",
        files: &[(
            "web.yaml",
            r#"apiVersion: tideline.io/v1
kind: Application
metadata:
  name: web
spec:
  source:
    repoUrl: https://example.com/org/deploy.git
  destination:
    namespace: ""
"#,
        )],
        should_succeed: false,
        expected_error: Some("destination.namespace"),
    },
    ConfigTestCase {
        name: "path_escapes_repository",
        files: &[(
            "web.yaml",
            r#"apiVersion: tideline.io/v1
kind: Application
metadata:
  name: web
spec:
  source:
    repoUrl: https://example.com/org/deploy.git
    path: charts/../../etc
  destination:
    namespace: prod
"#,
        )],
        should_succeed: false,
        expected_error: Some("Path traversal"),
    },
    ConfigTestCase {
        name: "zero_refresh_interval",
        files: &[
            ("web.yaml", WEB_APP),
            (
                "settings.yaml",
                "apiVersion: tideline.io/v1\nkind: Settings\nmetadata:\n  name: engine\nspec:\n  refreshIntervalSecs: 0\n",
            ),
        ],
        should_succeed: false,
        expected_error: Some("refreshIntervalSecs"),
    },
    ConfigTestCase {
        name: "token_auth_without_source",
        files: &[(
            "repo.yaml",
            r#"apiVersion: tideline.io/v1
kind: Repository
metadata:
  name: deploy
spec:
  url: https://example.com/org/deploy.git
  auth:
    type: token
    tokenEnvVar: ""
"#,
        )],
        should_succeed: false,
        expected_error: Some("token auth requires"),
    },
    ConfigTestCase {
        name: "duplicate_application",
        files: &[("a.yaml", WEB_APP), ("b.yaml", WEB_APP)],
        should_succeed: false,
        expected_error: Some("web"),
    },
    ConfigTestCase {
        name: "malformed_yaml",
        files: &[("web.yaml", "apiVersion: tideline.io/v1\nkind: [Application\n")],
        should_succeed: false,
        expected_error: None,
    },
];

fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

#[test]
fn test_config_loading() {
    for test_case in CONFIG_TESTS {
        let dir = TempDir::new().unwrap();
        write_files(dir.path(), test_case.files);
        let result = ConfigLoader::new(dir.path()).load();

        if test_case.should_succeed {
            assert!(
                result.is_ok(),
                "Test '{}': Expected success but got error: {:?}",
                test_case.name,
                result.err()
            );
        } else {
            assert!(
                result.is_err(),
                "Test '{}': Expected failure but loading succeeded",
                test_case.name
            );
            if let Some(expected) = test_case.expected_error {
                let message = result.unwrap_err().to_string();
                assert!(
                    message.contains(expected),
                    "Test '{}': Expected error containing '{}', got '{}'",
                    test_case.name,
                    expected,
                    message
                );
            }
        }
    }
}

#[test]
fn test_loaded_values() {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), CONFIG_TESTS[2].files);
    let config = ConfigLoader::new(dir.path()).load().unwrap();

    assert_eq!(config.settings.refresh_interval_secs, 30);
    assert_eq!(config.settings.retry.max_retries, 5);
    assert_eq!(config.settings.retry.base_delay_ms, 2000);
    let web = config.application("web").unwrap();
    assert_eq!(web.spec.source.path, "charts/web");
    assert!(web.spec.sync_policy.prune);
    assert_eq!(config.repository_resources().count(), 1);
}

/// Config directory with one Application reading a chart from a local directory.
fn local_engine_fixture() -> (TempDir, std::path::PathBuf) {
    let root = TempDir::new().unwrap();
    let charts = root.path().join("charts");
    let config = root.path().join("config");

    let chart = common::ChartBuilder::standard("web", "hello");
    let files: Vec<(String, String)> = chart.files();
    for (path, content) in &files {
        let path = charts.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    let app = format!(
        r#"apiVersion: tideline.io/v1
kind: Application
metadata:
  name: web
spec:
  source:
    repoUrl: file://{}
    path: web
  destination:
    namespace: prod
  syncPolicy:
    mode: automatic
    refreshIntervalSecs: 3600
"#,
        charts.display()
    );
    write_files(&config, &[("web.yaml", app.as_str())]);
    (root, config)
}

#[tokio::test]
async fn test_engine_reconciles_local_chart() {
    let (_root, config) = local_engine_fixture();
    let cluster = Arc::new(MemoryCluster::new());
    let engine = Engine::load(&config, cluster.clone()).unwrap();

    let outcome = engine.reconciler().refresh("web").await.unwrap();
    assert_eq!(outcome.phase, SyncPhase::Synced);
    assert_eq!(outcome.health, HealthStatus::Healthy);
    assert_eq!(cluster.len(), 4);
    let config_map = cluster
        .object(&ResourceKey::new("ConfigMap", "prod", "web-config"))
        .unwrap();
    assert_eq!(config_map.object.as_value()["data"]["greeting"], json!("hello"));
}

#[tokio::test]
async fn test_engine_start_and_shutdown() {
    let (_root, config) = local_engine_fixture();
    let cluster = Arc::new(MemoryCluster::new());
    let mut engine = Engine::load(&config, cluster.clone()).unwrap();
    engine.start();

    let mut synced = false;
    for _ in 0..500 {
        if engine
            .reconciler()
            .status("web")
            .map(|s| s.phase == SyncPhase::Synced)
            .unwrap_or(false)
        {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(synced, "scheduler never synced 'web'");
    assert_eq!(cluster.len(), 4);

    engine.shutdown().await;
    assert!(engine.scheduler().is_stopped());
}

#[test]
fn test_engine_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), &[("a.yaml", WEB_APP), ("b.yaml", WEB_APP)]);
    let result = Engine::load(dir.path(), Arc::new(MemoryCluster::new()));
    assert!(matches!(
        result,
        Err(TidelineError::Config(GitOpsError::DuplicateName { .. }))
    ));
}
