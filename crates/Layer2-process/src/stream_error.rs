//! Stream error classification
//!
//! A reader that went away (broken pipe, reset) is normal when a process is
//! torn down mid-write. Anything else on a process stream is surfaced.

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Peer closed the stream; treat as a no-op
    Ignorable,
    Unexpected,
}

pub fn classify_stream_error(err: &io::Error) -> StreamErrorKind {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => StreamErrorKind::Ignorable,
        _ => StreamErrorKind::Unexpected,
    }
}

pub fn is_ignorable_stream_error(err: &io::Error) -> bool {
    classify_stream_error(err) == StreamErrorKind::Ignorable
}
