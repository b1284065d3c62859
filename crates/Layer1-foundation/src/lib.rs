//! # anvil-foundation
//!
//! Foundation layer for anvil:
//! - Error: 공통 에러 타입
//! - Config: 통합 설정 (AnvilConfig)
//! - Cancel: 외부 abort signal 브리징
//! - Storage: 워크스페이스별 락 + 원자적 JSON 저장 + stale-write 차단
//! - Prompt: SSH 호스트 키 / 자격 증명 프롬프트 중재
//!
//! ## 아키텍처
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Layer4-cli        anvil binary                      │
//! │  Layer3-workspace  fork orchestration, service       │
//! │  Layer2-runtime    local / worktree / ssh / docker   │
//! │  Layer2-process    disposable process, exec          │
//! │  Layer1-foundation (this crate)                      │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod prompt;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Cancel
// ============================================================================
pub use cancel::{abortable, AbortScope, AbortSignal};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    AnvilConfig, DockerSettings, ExecSettings, IgnoreSyncSettings, InitHookSettings,
    PromptSettings, SshSettings, ANVIL_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{
    validate_workspace_id, write_atomic, ComputeTicket, JsonStore, KeyGuard, KeyedLock,
    SequenceGate, SequencedStore, SessionFileStore,
};

// ============================================================================
// Prompt (프롬프트 중재)
// ============================================================================
pub use prompt::{
    PromptBroker, PromptEvent, PromptInput, PromptKind, PromptPolicy, PromptQueue, PromptRecord,
    PromptRequest, PromptResolution, PromptSession, PromptTransport, ResolutionReason,
};
