//! Prompt Types - 인터랙티브 프롬프트 데이터 모델

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Prompt Kind
// ============================================================================

/// Kind of interactive prompt raised by an SSH client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptKind {
    /// Unknown or changed host key (yes/no/fingerprint)
    HostKey,
    /// Password or passphrase
    Credential,
}

impl PromptKind {
    /// Host-key prompts mention "continue connecting"; everything else is a credential
    pub fn classify(prompt: &str) -> Self {
        if prompt.to_ascii_lowercase().contains("continue connecting") {
            Self::HostKey
        } else {
            Self::Credential
        }
    }

    /// Answer used when a prompt of this kind is dismissed
    pub fn dismiss_response(&self) -> &'static str {
        match self {
            Self::HostKey => "no",
            Self::Credential => "",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostKey => "host-key",
            Self::Credential => "credential",
        }
    }
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Prompt Request
// ============================================================================

/// A prompt waiting for an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub request_id: String,
    pub session_id: String,
    pub kind: PromptKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub prompt: String,
    /// Input should not be echoed
    pub secret: bool,
}

impl PromptRequest {
    pub fn new(session_id: impl Into<String>, kind: PromptKind, prompt: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            kind,
            host: None,
            key_type: None,
            fingerprint: None,
            prompt: prompt.into(),
            secret: kind == PromptKind::Credential,
        }
    }

    pub fn with_host_key(mut self, details: super::HostKeyDetails) -> Self {
        self.host = details.host;
        self.key_type = details.key_type;
        self.fingerprint = details.fingerprint;
        self
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Why a prompt resolved the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionReason {
    UserResponse,
    Timeout,
    PolicyDenied,
    Deduped,
}

/// Final answer handed back to the blocked subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResolution {
    pub response: String,
    pub reason: ResolutionReason,
}

impl PromptResolution {
    pub fn new(response: impl Into<String>, reason: ResolutionReason) -> Self {
        Self {
            response: response.into(),
            reason,
        }
    }

    /// Empty answer; the subprocess sees a non-interactive failure
    pub fn empty(reason: ResolutionReason) -> Self {
        Self::new(String::new(), reason)
    }
}

/// Audit entry kept for every resolved prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub kind: PromptKind,
    pub reason: ResolutionReason,
    pub response: String,
}

/// Placeholder stored instead of secret answers
pub const REDACTED: &str = "<redacted>";

// ============================================================================
// Policy
// ============================================================================

/// Which prompt kinds a session may surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPolicy {
    pub allow_host_key: bool,
    pub allow_credential: bool,
    pub response_timeout: Duration,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            allow_host_key: true,
            allow_credential: true,
            response_timeout: Duration::from_secs(120),
        }
    }
}

impl PromptPolicy {
    /// Fail closed on every kind
    pub fn deny_all() -> Self {
        Self {
            allow_host_key: false,
            allow_credential: false,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &crate::config::PromptSettings) -> Self {
        Self {
            allow_host_key: settings.allow_host_key(),
            allow_credential: settings.allow_credential(),
            response_timeout: settings.response_timeout(),
        }
    }

    pub fn allows(&self, kind: PromptKind) -> bool {
        match kind {
            PromptKind::HostKey => self.allow_host_key,
            PromptKind::Credential => self.allow_credential,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

// ============================================================================
// Events
// ============================================================================

/// Queue change pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptEvent {
    Added(PromptRequest),
    Removed {
        request_id: String,
        reason: ResolutionReason,
    },
}
