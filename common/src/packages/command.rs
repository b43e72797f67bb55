use super::PackageManager;
use crate::errors::PackageError;
use crate::telemetry::DEPS;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Package manager driven by two external commands.
///
/// `install_command` is an argv prefix that receives the package names as
/// trailing arguments; `list_command` prints one installed package per line.
/// Both run with the variables added through [`with_env`](Self::with_env).
#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    install_command: Vec<String>,
    list_command: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandPackageManager {
    pub fn new(install_command: Vec<String>, list_command: Vec<String>) -> Result<Self, PackageError> {
        if install_command.is_empty() {
            return Err(PackageError::InvalidCommand("install_command".to_string()));
        }
        if list_command.is_empty() {
            return Err(PackageError::InvalidCommand("list_command".to_string()));
        }

        Ok(Self {
            install_command,
            list_command,
            envs: Vec::new(),
        })
    }

    /// Set an environment variable for every invocation
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    async fn invoke(&self, argv: &[String], extra: &[String]) -> Result<String, PackageError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PackageError::InvalidCommand(argv.join(" ")))?;

        let rendered = argv.iter().chain(extra).cloned().collect::<Vec<_>>().join(" ");
        debug!(target: DEPS, command = %rendered, "Invoking package manager");

        let output = Command::new(program)
            .args(args)
            .args(extra)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PackageError::Spawn {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let combined = if stderr.is_empty() {
                stdout
            } else {
                format!("{}{}", stdout, stderr)
            };
            return Err(PackageError::NonZeroExit {
                code: output.status.code(),
                output: combined,
            });
        }

        if !stderr.is_empty() {
            debug!(target: DEPS, command = %rendered, stderr = %stderr, "Package manager wrote to stderr");
        }

        Ok(stdout)
    }
}

#[async_trait]
impl PackageManager for CommandPackageManager {
    #[instrument(skip(self))]
    async fn install(&self, packages: &[String]) -> Result<String, PackageError> {
        self.invoke(&self.install_command, packages).await
    }

    #[instrument(skip(self))]
    async fn list_installed(&self) -> Result<String, PackageError> {
        self.invoke(&self.list_command, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string(), "pkg".to_string()]
    }

    #[test]
    fn test_rejects_empty_commands() {
        assert!(CommandPackageManager::new(vec![], sh("true")).is_err());
        assert!(CommandPackageManager::new(sh("true"), vec![]).is_err());
    }

    #[tokio::test]
    async fn test_install_passes_packages_as_arguments() {
        let manager = CommandPackageManager::new(sh("echo installing \"$@\""), sh("true")).unwrap();
        let log = manager
            .install(&["flask".to_string(), "requests".to_string()])
            .await
            .unwrap();
        assert_eq!(log.trim(), "installing flask requests");
    }

    #[tokio::test]
    async fn test_configured_env_reaches_both_commands() {
        let echo_dir = sh("echo \"$MODULE_DIR\"");
        let manager = CommandPackageManager::new(echo_dir.clone(), echo_dir)
            .unwrap()
            .with_env("MODULE_DIR", "/srv/modules");
        let log = manager.install(&["flask".to_string()]).await.unwrap();
        assert_eq!(log.trim(), "/srv/modules");
        let listing = manager.list_installed().await.unwrap();
        assert_eq!(listing.trim(), "/srv/modules");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_install_error() {
        let manager =
            CommandPackageManager::new(sh("echo \"no package $1\" >&2; exit 3"), sh("true")).unwrap();
        let result = manager.install(&["nope".to_string()]).await;
        match result {
            Err(PackageError::NonZeroExit { code, output }) => {
                assert_eq!(code, Some(3));
                assert!(output.contains("no package nope"));
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let manager = CommandPackageManager::new(
            vec!["definitely-not-a-package-manager".to_string()],
            vec!["true".to_string()],
        )
        .unwrap();
        let result = manager.install(&["x".to_string()]).await;
        assert!(matches!(result, Err(PackageError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_list_installed_returns_stdout() {
        let manager = CommandPackageManager::new(sh("true"), sh("printf 'a==1\\n\\nb==2\\n'")).unwrap();
        let listing = manager.list_installed().await.unwrap();
        assert_eq!(listing, "a==1\n\nb==2\n");
    }
}
