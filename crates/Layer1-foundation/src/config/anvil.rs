//! Anvil Config - 통합 설정
//!
//! 글로벌 설정 + 프로젝트 설정을 병합해서 사용

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 설정 파일명
pub const ANVIL_CONFIG_FILE: &str = "config.json";

/// Default ignore-sync file at the project root
pub const DEFAULT_IGNORE_SYNC_FILE: &str = ".anvilinclude";

/// Default init hook, relative to the workspace root
pub const DEFAULT_INIT_HOOK: &str = ".anvil/init";

// ============================================================================
// Anvil Config (통합)
// ============================================================================

/// anvil 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnvilConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Worktree / remote workspace root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_dir: Option<PathBuf>,

    /// Per-workspace session documents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,

    #[serde(default)]
    pub exec: ExecSettings,

    #[serde(default)]
    pub prompts: PromptSettings,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub ignore_sync: IgnoreSyncSettings,

    #[serde(default)]
    pub init_hook: InitHookSettings,
}

impl AnvilConfig {
    pub fn new() -> Self {
        Self {
            version: default_version(),
            ..Self::default()
        }
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load(project_root: &Path) -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<AnvilConfig>(ANVIL_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        let project = JsonStore::project(project_root);
        if let Some(project_config) = project.load_optional::<AnvilConfig>(ANVIL_CONFIG_FILE)? {
            config.merge(project_config);
        }

        Ok(config)
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        let store = JsonStore::global()?;
        store.save(ANVIL_CONFIG_FILE, self)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self, project_root: &Path) -> Result<()> {
        JsonStore::project(project_root).save(ANVIL_CONFIG_FILE, self)
    }

    // ========================================================================
    // Resolved paths
    // ========================================================================

    fn anvil_home() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".anvil")
    }

    /// Root under which worktree workspaces are created
    pub fn src_dir(&self) -> PathBuf {
        self.src_dir
            .clone()
            .unwrap_or_else(|| Self::anvil_home().join("src"))
    }

    /// Root of the per-workspace session directories
    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| Self::anvil_home().join("sessions"))
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: AnvilConfig) {
        if other.src_dir.is_some() {
            self.src_dir = other.src_dir;
        }
        if other.sessions_dir.is_some() {
            self.sessions_dir = other.sessions_dir;
        }

        self.exec.merge(other.exec);
        self.prompts.merge(other.prompts);
        self.ssh.merge(other.ssh);
        self.docker.merge(other.docker);
        self.ignore_sync.merge(other.ignore_sync);
        self.init_hook.merge(other.init_hook);
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn src_dir_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.src_dir = Some(dir.into());
        self
    }

    pub fn sessions_dir_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = Some(dir.into());
        self
    }
}

// ============================================================================
// Exec
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

impl ExecSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs.unwrap_or(600))
    }

    fn merge(&mut self, other: ExecSettings) {
        if other.default_timeout_secs.is_some() {
            self.default_timeout_secs = other.default_timeout_secs;
        }
    }
}

// ============================================================================
// Prompts
// ============================================================================

/// Interactive prompt policy defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_host_key: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_credential: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_secs: Option<u64>,
}

impl PromptSettings {
    pub fn allow_host_key(&self) -> bool {
        self.allow_host_key.unwrap_or(true)
    }

    pub fn allow_credential(&self) -> bool {
        self.allow_credential.unwrap_or(true)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs.unwrap_or(120))
    }

    fn merge(&mut self, other: PromptSettings) {
        if other.allow_host_key.is_some() {
            self.allow_host_key = other.allow_host_key;
        }
        if other.allow_credential.is_some() {
            self.allow_credential = other.allow_credential;
        }
        if other.response_timeout_secs.is_some() {
            self.response_timeout_secs = other.response_timeout_secs;
        }
    }
}

// ============================================================================
// SSH
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(15))
    }

    fn merge(&mut self, other: SshSettings) {
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
    }
}

// ============================================================================
// Docker
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
}

impl DockerSettings {
    pub fn default_image(&self) -> String {
        self.default_image
            .clone()
            .unwrap_or_else(|| "ubuntu:22.04".to_string())
    }

    fn merge(&mut self, other: DockerSettings) {
        if other.default_image.is_some() {
            self.default_image = other.default_image;
        }
    }
}

// ============================================================================
// Ignore sync / init hook
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreSyncSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl IgnoreSyncSettings {
    pub fn file_name(&self) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| DEFAULT_IGNORE_SYNC_FILE.to_string())
    }

    fn merge(&mut self, other: IgnoreSyncSettings) {
        if other.file_name.is_some() {
            self.file_name = other.file_name;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitHookSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Disable the hook entirely
    #[serde(default)]
    pub disabled: bool,
}

impl InitHookSettings {
    pub fn path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| DEFAULT_INIT_HOOK.to_string())
    }

    fn merge(&mut self, other: InitHookSettings) {
        if other.path.is_some() {
            self.path = other.path;
        }
        self.disabled = self.disabled || other.disabled;
    }
}

fn default_version() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AnvilConfig::new();
        assert_eq!(config.version, 1);
        assert!(config.prompts.allow_host_key());
        assert!(config.prompts.allow_credential());
        assert_eq!(config.prompts.response_timeout(), Duration::from_secs(120));
        assert_eq!(config.ignore_sync.file_name(), ".anvilinclude");
        assert_eq!(config.init_hook.path(), ".anvil/init");
        assert!(config.src_dir().ends_with(".anvil/src"));
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = AnvilConfig::new().src_dir_path("/base/src");
        let mut other = AnvilConfig::new();
        other.prompts.allow_credential = Some(false);
        other.docker.default_image = Some("alpine:3.20".into());

        base.merge(other);
        assert_eq!(base.src_dir(), PathBuf::from("/base/src"));
        assert!(!base.prompts.allow_credential());
        assert!(base.prompts.allow_host_key());
        assert_eq!(base.docker.default_image(), "alpine:3.20");
    }

    #[test]
    fn test_project_round_trip_uses_camel_case() {
        let dir = tempdir().unwrap();
        let mut config = AnvilConfig::new();
        config.exec.default_timeout_secs = Some(30);
        config.save_project(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(".anvil/config.json")).unwrap();
        assert!(raw.contains("defaultTimeoutSecs"));

        let store = JsonStore::project(dir.path());
        let loaded: AnvilConfig = store.load(ANVIL_CONFIG_FILE).unwrap();
        assert_eq!(loaded.exec.default_timeout(), Duration::from_secs(30));
    }
}
