//! Storage module for anvil
//!
//! - `json`: 설정 파일 저장/로드 (JsonStore)
//! - `session`: workspace 단위 JSON 문서 (keyed lock + atomic write)
//! - `sequence`: 동시 재계산 결과의 stale write 차단

mod atomic;
mod json;
mod lock;
mod sequence;
mod session;

pub use atomic::{temp_path_for, write_atomic, write_atomic_sync};
pub use json::JsonStore;
pub use lock::{KeyGuard, KeyedLock};
pub use sequence::{ComputeTicket, SequenceGate, SequencedStore};
pub use session::{validate_workspace_id, SessionFileStore};
