//! [`PanicHandler`] observes a process for uncaught native exceptions, turning
//! each one into a symbolized [`PanicRecord`] that is handed to a single
//! user-provided [`PanicSink`].
//!
//! # Runtimes
//!
//! Exception delivery, stack unwinding, symbolization and native function
//! interception are provided by a [`Runtime`]. This crate ships
//! [`NativeRuntime`] for Linux and Android, other hosts, eg. a dynamic
//! instrumentation toolkit, can provide their own implementation.
//!
//! # Risky operations
//!
//! Some exceptions are only fatal because nobody is there to catch them. A
//! managed runtime layered on top of the process, such as Objective-C, throws
//! an exception and, when it is not caught, calls `abort` from its terminate
//! routine. If the runtime allows intercepting native functions, the origin
//! bridge watches both the throw and the abort, and when the abort is caused
//! by an uncaught exception on a thread that is currently executing
//! [`Correlator::perform_risky_operation`], the exception is returned from
//! that operation as a normal error instead of being reported as a panic.
//!
//! ```no_run
//! use panic_handler::{PanicHandler, Runtime, make_panic_sink};
//! use std::sync::Arc;
//!
//! # #[cfg(any(target_os = "linux", target_os = "android"))]
//! # {
//! let runtime: Arc<dyn Runtime> = Arc::new(panic_handler::NativeRuntime::new());
//! let handler = PanicHandler::install(
//!     runtime,
//!     make_panic_sink(|record| eprint!("{record}")),
//! )
//! .expect("failed to install panic handler");
//!
//! let res = handler.perform_risky_operation(|| Ok::<_, std::io::Error>(42));
//! assert_eq!(res.unwrap(), 42);
//! # }
//! ```
//!
//! # Linux
//!
//! [`NativeRuntime`] handles [signals](https://man7.org/linux/man-pages/man7/signal.7.html),
//! namely `SIGABRT`, `SIGBUS`, `SIGFPE`, `SIGILL`, `SIGSEGV`, and `SIGTRAP`.
//! The sink is invoked from within the signal handler, ie. in a compromised
//! context, after which the previously installed handlers are restored and
//! the signal is raised again. Execution never resumes after a panic.
//!
//! The signal handler runs on an [alternate signal stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! that is large enough to unwind and symbolize the faulting thread. It is
//! only installed for the thread that installs the [`PanicHandler`], faults on
//! other threads are handled on whatever alternate stack they have, if any.

#![allow(unsafe_code)]

mod bridge;
mod builder;
mod error;
mod handler;
mod risky;
mod runtime;
mod suppression;

pub use bridge::OriginSignature;
pub use builder::RecordBuilder;
pub use error::Error;
pub use handler::{Config, PanicHandler};
pub use panic_record::{Frame, PanicRecord, RULE, Stack, format};
pub use risky::{Correlator, RiskyError};
pub use runtime::{
    Address, CpuContext, ExceptionHandler, HookId, Invocation, InvocationHook, NativeException,
    Platform, Runtime, ThreadId,
};
pub use suppression::{
    CapturedException, Suppression, SuppressionGuard, SuppressionRegistry, WindowToken,
};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len() as _);
    }
}

/// User implemented trait receiving every panic that was not correlated with
/// a risky operation.
///
/// Depending on the [`Runtime`], [`Self::on_panic`] may be called from a
/// compromised context, eg. from within a signal handler for
/// [`NativeRuntime`], so it is advised to do as _little_ as possible, and to
/// never expect to be able to resume the thread that panicked.
pub trait PanicSink: Send + Sync {
    /// Method invoked exactly once for each panic
    fn on_panic(&self, record: PanicRecord);
}

/// Creates a [`PanicSink`] using the supplied closure as the implementation.
#[inline]
pub fn make_panic_sink<F>(closure: F) -> Box<dyn PanicSink>
where
    F: Send + Sync + Fn(PanicRecord) + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    impl<F> PanicSink for Wrapper<F>
    where
        F: Send + Sync + Fn(PanicRecord),
    {
        fn on_panic(&self, record: PanicRecord) {
            (self.inner)(record);
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{NativeRuntime, Signal};
    }
}
