use crate::{
    runtime::Runtime,
    suppression::{CapturedException, SuppressionRegistry},
};
use std::{fmt, sync::Arc};

/// The error of an operation executed via
/// [`Correlator::perform_risky_operation`]
#[derive(Debug)]
pub enum RiskyError<E> {
    /// An exception from a managed runtime was correlated with the operation.
    /// This takes precedence over whatever error the operation itself
    /// returned, as it is the actual cause.
    Captured(CapturedException),
    /// The error returned by the operation
    Operation(E),
}

impl<E> RiskyError<E> {
    #[inline]
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Captured(_))
    }

    #[inline]
    pub fn into_captured(self) -> Option<CapturedException> {
        match self {
            Self::Captured(exc) => Some(exc),
            Self::Operation(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RiskyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Captured(exc) => fmt::Display::fmt(exc, f),
            Self::Operation(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RiskyError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Captured(_) => None,
            Self::Operation(err) => err.source(),
        }
    }
}

/// Handle to the suppression registry of an installed
/// [`crate::PanicHandler`], cheap to clone and share between threads
#[derive(Clone)]
pub struct Correlator {
    runtime: Arc<dyn Runtime>,
    registry: Arc<SuppressionRegistry>,
}

impl Correlator {
    #[inline]
    pub(crate) fn new(runtime: Arc<dyn Runtime>, registry: Arc<SuppressionRegistry>) -> Self {
        Self { runtime, registry }
    }

    #[inline]
    pub fn registry(&self) -> &SuppressionRegistry {
        &self.registry
    }

    /// Executes an operation that may cause a managed runtime exception that
    /// would otherwise terminate the process.
    ///
    /// If such an exception is correlated with the operation while it is
    /// running, and the operation fails, the exception is returned as
    /// [`RiskyError::Captured`] instead of the operation's own error. The
    /// suppression window is closed on every exit path, including unwinding.
    pub fn perform_risky_operation<T, E, F>(&self, operation: F) -> Result<T, RiskyError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let guard = self.registry.guard(self.runtime.current_thread_id());
        let result = operation();
        let captured = guard.finish();

        match (result, captured) {
            (Ok(value), _) => Ok(value),
            (Err(_), Some(exc)) => Err(RiskyError::Captured(exc)),
            (Err(err), None) => Err(RiskyError::Operation(err)),
        }
    }
}
