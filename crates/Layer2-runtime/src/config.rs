//! Runtime configuration
//!
//! Persisted per workspace, tagged by backend kind:
//!
//! ```json
//! { "type": "docker", "image": "ubuntu:22.04", "containerName": "anvil-app-feat-1a2b3c4d" }
//! ```

use crate::runtime::RuntimeKind;
use anvil_foundation::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default remote root for SSH workspaces
pub const DEFAULT_SSH_SRC_DIR: &str = "~/anvil/src";

/// Backend-specific workspace descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeConfig {
    /// Commands run directly in the project directory
    Local,

    /// One `git worktree` per workspace
    #[serde(rename_all = "camelCase")]
    Worktree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_dir: Option<PathBuf>,
    },

    /// Remote host reached through the system ssh client
    #[serde(rename_all = "camelCase")]
    Ssh {
        /// `user@host` or `host`
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity_file: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_dir: Option<String>,
    },

    /// One container per workspace
    #[serde(rename_all = "camelCase")]
    Docker {
        image: String,
        /// Derived from project + workspace name; absent in legacy configs
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_name: Option<String>,
    },
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::Worktree { src_dir: None }
    }
}

impl RuntimeConfig {
    pub fn kind(&self) -> RuntimeKind {
        match self {
            Self::Local => RuntimeKind::Local,
            Self::Worktree { .. } => RuntimeKind::Worktree,
            Self::Ssh { .. } => RuntimeKind::Ssh,
            Self::Docker { .. } => RuntimeKind::Docker,
        }
    }

    pub fn docker(image: impl Into<String>) -> Self {
        Self::Docker {
            image: image.into(),
            container_name: None,
        }
    }

    pub fn ssh(host: impl Into<String>) -> Self {
        Self::Ssh {
            host: host.into(),
            port: None,
            identity_file: None,
            src_dir: None,
        }
    }

    /// Recompute identity-derived fields for `workspace_name`.
    ///
    /// Never copy a Docker config between workspaces without this; the
    /// container name belongs to exactly one workspace.
    pub fn for_workspace(&self, project_path: &Path, workspace_name: &str) -> Self {
        match self {
            Self::Docker { image, .. } => Self::Docker {
                image: image.clone(),
                container_name: Some(container_name_for(project_path, workspace_name)),
            },
            other => other.clone(),
        }
    }

    /// Docker container name, computing it if the config predates the field
    pub fn resolved_container_name(
        &self,
        project_path: &Path,
        workspace_name: &str,
    ) -> Option<String> {
        match self {
            Self::Docker {
                container_name: Some(name),
                ..
            } => Some(name.clone()),
            Self::Docker { .. } => Some(container_name_for(project_path, workspace_name)),
            _ => None,
        }
    }
}

impl FromStr for RuntimeConfig {
    type Err = Error;

    /// `local`, `worktree`, `ssh:<user@host[:port]>`, `docker[:<image>]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (s, None),
        };

        match (kind.trim().to_ascii_lowercase().as_str(), rest) {
            ("local", None) => Ok(Self::Local),
            ("worktree", None) => Ok(Self::Worktree { src_dir: None }),
            ("docker", None) => Ok(Self::docker("ubuntu:22.04")),
            ("docker", Some(image)) if !image.is_empty() => Ok(Self::docker(image)),
            ("ssh", Some(target)) if !target.is_empty() => {
                let (host, port) = match target.rsplit_once(':') {
                    Some((host, port)) => match port.parse::<u16>() {
                        Ok(port) => (host.to_string(), Some(port)),
                        Err(_) => {
                            return Err(Error::invalid_input(format!(
                                "invalid ssh port in {:?}",
                                target
                            )))
                        }
                    },
                    None => (target.to_string(), None),
                };
                Ok(Self::Ssh {
                    host,
                    port,
                    identity_file: None,
                    src_dir: None,
                })
            }
            _ => Err(Error::invalid_input(format!(
                "unknown runtime {:?} (expected local, worktree, ssh:<host>, docker[:<image>])",
                s
            ))),
        }
    }
}

// ============================================================================
// Identity helpers
// ============================================================================

/// Lowercase alphanumerics separated by single hyphens, at most 24 chars
pub fn slugify(raw: &str) -> String {
    let mut out = String::new();
    let mut prev_hyphen = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_hyphen = false;
        } else if !prev_hyphen {
            out.push('-');
            prev_hyphen = true;
        }
    }

    let trimmed: String = out.trim_matches('-').chars().take(24).collect();
    let trimmed = trimmed.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 32-bit FNV-1a; stable across toolchains, unlike `DefaultHasher`
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// `anvil-<project-slug>-<workspace-slug>-<hash>`
pub fn container_name_for(project_path: &Path, workspace_name: &str) -> String {
    let project = crate::runtime::project_name(project_path);
    let key = format!("{}\0{}", project_path.to_string_lossy(), workspace_name);
    format!(
        "anvil-{}-{}-{:08x}",
        slugify(&project),
        slugify(workspace_name),
        fnv1a(key.as_bytes())
    )
}

/// Stable directory key for a project: `<project-slug>-<hash>`
pub fn project_key(project_path: &Path) -> String {
    let project = crate::runtime::project_name(project_path);
    format!(
        "{}-{:08x}",
        slugify(&project),
        fnv1a(project_path.to_string_lossy().as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_strings() {
        assert_eq!("local".parse::<RuntimeConfig>().unwrap(), RuntimeConfig::Local);
        assert_eq!(
            "docker:node:20".parse::<RuntimeConfig>().unwrap(),
            RuntimeConfig::docker("node:20")
        );
        assert_eq!(
            "ssh:dev@build.local:2222".parse::<RuntimeConfig>().unwrap(),
            RuntimeConfig::Ssh {
                host: "dev@build.local".into(),
                port: Some(2222),
                identity_file: None,
                src_dir: None,
            }
        );
        assert_eq!(
            "ssh:build.local".parse::<RuntimeConfig>().unwrap(),
            RuntimeConfig::ssh("build.local")
        );
        assert!("ssh:".parse::<RuntimeConfig>().is_err());
        assert!("ssh:host:notaport".parse::<RuntimeConfig>().is_err());
        assert!("podman".parse::<RuntimeConfig>().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let config = RuntimeConfig::Docker {
            image: "ubuntu:22.04".into(),
            container_name: Some("anvil-x".into()),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "docker");
        assert_eq!(json["containerName"], "anvil-x");

        let legacy: RuntimeConfig =
            serde_json::from_str(r#"{"type":"docker","image":"ubuntu:22.04"}"#).unwrap();
        assert_eq!(legacy, RuntimeConfig::docker("ubuntu:22.04"));

        let local: RuntimeConfig = serde_json::from_str(r#"{"type":"local"}"#).unwrap();
        assert_eq!(local, RuntimeConfig::Local);
    }

    #[test]
    fn test_for_workspace_recomputes_container_name() {
        let project = Path::new("/code/My App");
        let source = RuntimeConfig::docker("ubuntu:22.04").for_workspace(project, "main");
        let forked = source.for_workspace(project, "feature/login");

        let name = |c: &RuntimeConfig| match c {
            RuntimeConfig::Docker { container_name, .. } => container_name.clone().unwrap(),
            _ => unreachable!(),
        };
        assert_ne!(name(&source), name(&forked));
        assert!(name(&forked).starts_with("anvil-my-app-feature-login-"));
        // deterministic
        assert_eq!(
            name(&forked),
            container_name_for(project, "feature/login")
        );
    }

    #[test]
    fn test_for_workspace_keeps_other_kinds() {
        let ssh = RuntimeConfig::ssh("h");
        assert_eq!(ssh.for_workspace(Path::new("/p"), "w"), ssh);
    }

    #[test]
    fn test_project_key_distinguishes_paths() {
        let a = project_key(Path::new("/home/a/app"));
        let b = project_key(Path::new("/home/b/app"));
        assert!(a.starts_with("app-"));
        assert_ne!(a, b);
        assert_eq!(a, project_key(Path::new("/home/a/app")));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Feature/Login Page"), "feature-login-page");
        assert_eq!(slugify("--"), "x");
        assert_eq!(slugify("a".repeat(40).as_str()).len(), 24);
    }
}
