//! Source credential resolution.
//!
//! Repository tokens can be given three ways, checked in this order:
//!
//! 1. inline (`token:`), for local experiments
//! 2. a file (`tokenFile: /run/secrets/deploy-token`), for mounted secrets
//! 3. an environment variable (`tokenEnvVar: DEPLOY_TOKEN`)
//!
//! Resolved values are wrapped in [`SecretString`] and never logged.

use secrecy::SecretString;
use std::fs;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No credential source configured (need an inline value, a file or an env var)")]
    NoSourceProvided,

    #[error("Failed to read credential file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Resolves a credential from the first non-empty source.
///
/// File contents and env var values are trimmed.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        return fs::read_to_string(&expanded)
            .map(|content| SecretString::from(content.trim().to_string()))
            .map_err(|source| SecretError::FileReadError {
                path: expanded,
                source,
            });
    }

    if let Some(name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// True if at least one source is configured. Does not check that it resolves.
pub fn has_secret_source(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> bool {
    [direct, file_path, env_var]
        .into_iter()
        .any(|s| s.is_some_and(|s| !s.is_empty()))
}

/// Expands a leading `~` or `~/`. `~user` is not supported.
fn expand_home(path: &str) -> String {
    if path != "~" && !path.starts_with("~/") {
        return path.to_string();
    }
    match dirs::home_dir() {
        Some(home) => path.replacen('~', &home.to_string_lossy(), 1),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_inline_value_takes_priority() {
        std::env::set_var("TIDELINE_TEST_TOKEN_1", "from-env");
        let token = resolve_secret(Some("inline"), None, Some("TIDELINE_TEST_TOKEN_1")).unwrap();
        assert_eq!(token.expose_secret(), "inline");
        std::env::remove_var("TIDELINE_TEST_TOKEN_1");
    }

    #[test]
    #[serial]
    fn test_file_takes_priority_over_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        std::env::set_var("TIDELINE_TEST_TOKEN_2", "from-env");

        let token = resolve_secret(
            None,
            Some(file.path().to_str().unwrap()),
            Some("TIDELINE_TEST_TOKEN_2"),
        )
        .unwrap();
        assert_eq!(token.expose_secret(), "from-file");
        std::env::remove_var("TIDELINE_TEST_TOKEN_2");
    }

    #[test]
    #[serial]
    fn test_empty_sources_fall_through_to_env() {
        std::env::set_var("TIDELINE_TEST_TOKEN_3", "from-env\n");
        let token = resolve_secret(Some(""), Some(""), Some("TIDELINE_TEST_TOKEN_3")).unwrap();
        assert_eq!(token.expose_secret(), "from-env");
        std::env::remove_var("TIDELINE_TEST_TOKEN_3");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            resolve_secret(None, None, None),
            Err(SecretError::NoSourceProvided)
        ));
        assert!(matches!(
            resolve_secret(None, Some("/nonexistent/tideline/token"), None),
            Err(SecretError::FileReadError { .. })
        ));
        assert!(matches!(
            resolve_secret(None, None, Some("TIDELINE_DEFINITELY_UNSET_VAR")),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_has_secret_source() {
        assert!(has_secret_source(None, Some("/run/secrets/token"), None));
        assert!(has_secret_source(None, None, Some("TOKEN")));
        assert!(!has_secret_source(Some(""), None, Some("")));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/token"), "/etc/token");
        assert_eq!(expand_home("~other/token"), "~other/token");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/token"), format!("{}/token", home.to_string_lossy()));
        }
    }
}
