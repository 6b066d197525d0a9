//! Transient-error classification for retry and reconnect logic.
//!
//! [`is_retryable`] decides whether a failed network operation is worth
//! another attempt. It only inspects the error and its sources.

use std::error::Error;
use std::io;

/// Aborted marks an operation the caller gave up on. Errors carrying it
/// anywhere in their source chain are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Aborted {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// should_retry classifies the outcome of an operation. `Ok` means there is
/// nothing to retry.
pub fn should_retry<T, E>(result: &Result<T, E>) -> bool
where
    E: Error + 'static,
{
    match result {
        Ok(_) => false,
        Err(err) => is_retryable(err),
    }
}

/// is_retryable reports whether `err` represents a transient failure.
///
/// Cancellation and end-of-stream are final. Everything else, including
/// any raw OS error and errors with no `io::Error` in their chain, is
/// retryable.
pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
    if is_cancellation(err) {
        return false;
    }

    find_io_error(err).is_none_or(|io_err| io_err.kind() != io::ErrorKind::UnexpectedEof)
}

fn is_cancellation(err: &(dyn Error + 'static)) -> bool {
    if err.is::<Aborted>() || err.is::<tokio::time::error::Elapsed>() {
        return true;
    }

    if let Some(join_err) = err.downcast_ref::<tokio::task::JoinError>() {
        if join_err.is_cancelled() {
            return true;
        }
    }

    // io::Error::source skips the error it wraps, so look inside explicitly
    if let Some(inner) = err.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
        if is_cancellation(inner) {
            return true;
        }
    }

    err.source().is_some_and(is_cancellation)
}

fn find_io_error<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a io::Error> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn classify(err: &anyhow::Error) -> bool {
        let err: &(dyn Error + 'static) = err.as_ref();
        is_retryable(err)
    }

    #[test]
    fn ok_is_not_retryable() {
        let result: Result<(), io::Error> = Ok(());
        assert!(!should_retry(&result));
    }

    #[test]
    fn end_of_stream_is_not_retryable() {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(!is_retryable(&eof));

        let wrapped = anyhow::Error::new(eof).context("reading request");
        assert!(!classify(&wrapped));
    }

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!is_retryable(&Aborted::Cancelled));
        assert!(!is_retryable(&Aborted::DeadlineExceeded));

        // Wrapped in io::Error and in anyhow context
        let wrapped = io::Error::new(io::ErrorKind::TimedOut, Aborted::DeadlineExceeded);
        assert!(!is_retryable(&wrapped));

        let with_context = anyhow::Error::new(Aborted::Cancelled).context("dialing");
        assert!(!classify(&with_context));
    }

    #[tokio::test]
    async fn elapsed_timeout_is_not_retryable() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(!is_retryable(&elapsed));

        // Kept as the source of an io::Error it is still recognised
        let as_io = io::Error::new(io::ErrorKind::TimedOut, elapsed);
        assert!(!is_retryable(&as_io));
    }

    #[tokio::test]
    async fn cancelled_task_is_not_retryable() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let join_err = handle.await.unwrap_err();
        assert!(!is_retryable(&join_err));
    }

    #[test]
    fn transient_errnos_are_retryable() {
        for code in [
            libc::ECONNRESET,
            libc::EPIPE,
            libc::ECONNABORTED,
            libc::ETIMEDOUT,
            libc::ECONNREFUSED,
            libc::EHOSTUNREACH,
            libc::ENETUNREACH,
        ] {
            let err = io::Error::from_raw_os_error(code);
            assert!(is_retryable(&err), "errno {code} should be retryable");

            let wrapped = anyhow::Error::new(io::Error::from_raw_os_error(code)).context("relay");
            assert!(classify(&wrapped), "wrapped errno {code} should be retryable");
        }
    }

    #[test]
    fn unlisted_errnos_are_retryable() {
        for code in [libc::EMFILE, libc::ENFILE, libc::EACCES, libc::EBADF] {
            let err = io::Error::from_raw_os_error(code);
            assert!(is_retryable(&err), "errno {code} should be retryable");
        }

        // Same answer as the equivalent kind
        assert!(is_retryable(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn network_kinds_are_retryable() {
        assert!(is_retryable(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_retryable(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_retryable(&io::Error::other("session dropped")));
    }

    #[test]
    fn unclassified_errors_are_retryable() {
        let err = anyhow::anyhow!("handshake rejected by peer");
        assert!(classify(&err));

        let parse_err = "x".parse::<u16>().unwrap_err();
        assert!(is_retryable(&parse_err));
    }
}
