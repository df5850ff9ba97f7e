use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// An error surfaced by [`Resolver::resolve`](crate::Resolver::resolve).
///
/// Outcomes are broadcast to every caller attached to the same in-flight
/// computation, so this type is cheap to clone and carries rendered messages
/// rather than borrowed sources.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// The computation failed.
    ///
    /// Propagated when there is no previously stored value to fall back to,
    /// swallowed otherwise.
    #[error("computation failed: {0}")]
    Computation(String),

    /// A failure that reaches the caller even when a stored fallback exists.
    #[error(transparent)]
    Forced(#[from] ForcedFailure),

    /// The task hosting the computation was torn down before it settled.
    #[error("computation channel dropped")]
    Interrupted,
}

impl ResolveError {
    /// Captures an arbitrary error as an ordinary computation failure.
    pub fn from_std_error<E: Error>(e: E) -> Self {
        Self::Computation(e.to_string())
    }
}

/// Wraps an error so that it always propagates.
///
/// An ordinary computation failure is swallowed whenever the caller was
/// already served a previously stored value. Wrapping the error in a
/// `ForcedFailure` overrides that: the failure is published to every waiter
/// regardless of available fallback data. The wrapped error's rendered
/// message is preserved, and the error itself stays reachable through
/// [`original`](Self::original) and [`Error::source`].
#[derive(Debug, Clone)]
pub struct ForcedFailure {
    message: String,
    original: Arc<dyn Error + Send + Sync>,
}

impl ForcedFailure {
    /// Wraps `original`, capturing its rendered message.
    pub fn new<E>(original: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        ForcedFailure {
            message: original.to_string(),
            original: Arc::new(original),
        }
    }

    /// The error this failure was created from.
    pub fn original(&self) -> &(dyn Error + 'static) {
        self.original.as_ref()
    }
}

impl fmt::Display for ForcedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "forced failure: {}", self.message)
    }
}

impl Error for ForcedFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.original.as_ref())
    }
}

// Wrapped originals are shared, not cloned, so identity comparison is exact.
impl PartialEq for ForcedFailure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.original, &other.original)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn forced_failure_preserves_original() {
        let original = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let forced = ForcedFailure::new(original);

        assert_eq!(forced.to_string(), "forced failure: disk on fire");
        assert!(forced.original().downcast_ref::<io::Error>().is_some());

        let err = ResolveError::from(forced);
        assert_eq!(err.to_string(), "forced failure: disk on fire");

        let source = err.source().expect("forced failures have a source");
        assert_eq!(source.to_string(), "disk on fire");
    }

    #[test]
    fn clones_compare_equal() {
        let forced = ForcedFailure::new(io::Error::new(io::ErrorKind::Other, "oh no"));
        let err = ResolveError::Forced(forced.clone());

        assert_eq!(err, err.clone());
        assert_eq!(err, ResolveError::Forced(forced));
        assert_ne!(err, ResolveError::Interrupted);
    }

    #[test]
    fn from_std_error_renders_message() {
        let err = ResolveError::from_std_error(io::Error::new(io::ErrorKind::Other, "oh no"));
        assert_eq!(err, ResolveError::Computation("oh no".into()));
    }
}
