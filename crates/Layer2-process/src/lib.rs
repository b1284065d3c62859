//! # anvil-process
//!
//! Process primitives for anvil runtimes:
//! - `DisposableProcess` - 프로세스 그룹 단위 종료 + 정리 콜백
//! - `spawn_exec` / `exec_buffered` - timeout / abort 감시 실행
//! - `classify_stream_error` - broken pipe 등 무시 가능한 스트림 에러 분류

pub mod disposable;
pub mod exec;
pub mod stream_error;

pub use disposable::{DisposableProcess, DisposeOutcome, ExitInfo, ProcessPipes};
pub use exec::{
    collect_output, exec_buffered, feed_stdin, spawn_exec, DeadlineExtender, ExecHandle,
    ExecOutput, ExecRequest, ExecStatus, EXIT_CODE_ABORTED, EXIT_CODE_TIMEOUT,
};
pub use stream_error::{classify_stream_error, is_ignorable_stream_error, StreamErrorKind};
