//! Classification of routine socket errors.
//!
//! Miners drop connections constantly; resets and broken pipes are part of
//! normal operation and must not be logged as errors.

use std::io;

/// Linux errnos treated as routine disconnects.
const IGNORED_ERRNOS: &[i32] = &[
    32,  // EPIPE
    103, // ECONNABORTED
    104, // ECONNRESET
    110, // ETIMEDOUT
    125, // ECANCELED
];

/// True when the error is an expected peer disconnect rather than a fault.
pub fn is_routine_disconnect(err: &io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        if IGNORED_ERRNOS.contains(&code) {
            return true;
        }
    }
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_set_matches() {
        for code in [32, 103, 104, 110, 125] {
            assert!(is_routine_disconnect(&io::Error::from_raw_os_error(code)));
        }
    }

    #[test]
    fn other_errors_are_not_routine() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_routine_disconnect(&err));
    }
}
