//! Credentials for git subprocesses.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::gitops::error::{GitOpsError, Result};
use crate::gitops::resource::{GitAuthSettings, GitAuthType};

/// Escapes a value for a single-quoted POSIX shell string.
pub fn shell_escape(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Deletes the askpass script when the git command is done with it.
#[derive(Debug, Default)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove askpass script {}: {}", path.display(), e);
            }
        }
    }
}

/// Environment for one git invocation. Keep it alive until the child exits.
#[derive(Debug, Default)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    _cleanup: AskpassCleanup,
}

impl AuthEnv {
    /// Prompts are disabled in every mode so a missing credential fails fast.
    fn base() -> Vec<(String, String)> {
        vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]
    }
}

/// Builds the environment for the configured authentication mode.
pub fn build_auth_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    match auth.auth_type {
        GitAuthType::None => Ok(AuthEnv {
            env_vars: AuthEnv::base(),
            ..Default::default()
        }),
        GitAuthType::Token => token_env(&resolve_token(auth)?),
        GitAuthType::SshKey => ssh_env(&auth.ssh_key_path),
    }
}

fn resolve_token(auth: &GitAuthSettings) -> Result<SecretString> {
    let env_var = Some(auth.token_env_var.as_str()).filter(|v| !v.is_empty());
    crate::secrets::resolve_secret(
        auth.token_insecure.as_deref(),
        auth.token_file.as_deref(),
        env_var,
    )
    .map_err(|e| {
        GitOpsError::GitAuthFailed(format!(
            "Failed to resolve git token: {}. Configure token, tokenFile, or tokenEnvVar.",
            e
        ))
    })
}

/// Writes a one-shot `GIT_ASKPASS` script that prints the token.
fn token_env(token: &SecretString) -> Result<AuthEnv> {
    let path = std::env::temp_dir().join(format!(".tideline-askpass-{}.sh", uuid::Uuid::new_v4()));
    let script = format!("#!/bin/sh\necho '{}'\n", shell_escape(token.expose_secret()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&path)?;
        std::io::Write::write_all(&mut file, script.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&path, &script)?;

    let cleanup = AskpassCleanup {
        path: Some(path.clone()),
    };
    let askpass = path
        .to_str()
        .ok_or_else(|| {
            GitOpsError::GitAuthFailed("Temp directory path is not valid UTF-8".to_string())
        })?
        .to_string();

    let mut env_vars = AuthEnv::base();
    env_vars.push(("GIT_ASKPASS".to_string(), askpass));
    Ok(AuthEnv {
        env_vars,
        _cleanup: cleanup,
    })
}

fn ssh_env(configured: &str) -> Result<AuthEnv> {
    let key_path = if configured.is_empty() {
        expand_home("~/.ssh/id_ed25519")
    } else {
        expand_home(configured)
    };
    if !key_path.exists() {
        return Err(GitOpsError::GitAuthFailed(format!(
            "SSH key file not found: {}",
            key_path.display()
        )));
    }

    let escaped = shell_escape(&key_path.display().to_string());
    let quoted = if escaped.starts_with('-') {
        format!("'./{}'", escaped)
    } else {
        format!("'{}'", escaped)
    };

    let mut env_vars = AuthEnv::base();
    env_vars.push((
        "GIT_SSH_COMMAND".to_string(),
        format!("ssh -i {} -o StrictHostKeyChecking=accept-new -o BatchMode=yes", quoted),
    ));
    Ok(AuthEnv {
        env_vars,
        ..Default::default()
    })
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None if path == "~" => dirs::home_dir().unwrap_or_default(),
        None => PathBuf::from(path),
    }
}
