//! Prompt Mediation - SSH 호스트 키 / 자격 증명 프롬프트 중재
//!
//! - `PromptBroker`: 장기 실행 큐 + 이벤트 채널
//! - `PromptSession`: 정책, 중복 제거, 기록
//! - `PromptQueue`: UI 쪽 소비자 모델

mod parse;
mod queue;
mod service;
mod types;

pub use parse::{parse_host_key_details, HostKeyDetails};
pub use queue::{PromptQueue, PromptTransport};
pub use service::{PromptBroker, PromptInput, PromptSession, PromptStartedHook};
pub use types::{
    PromptEvent, PromptKind, PromptPolicy, PromptRecord, PromptRequest, PromptResolution,
    ResolutionReason, REDACTED,
};
