//! The capabilities this crate consumes from the host that is actually
//! delivering exceptions and intercepting native code.

use crate::Error;
use panic_record::Frame;
use serde::Serialize;

/// An address in the process' address space
pub type Address = u64;
/// The runtime's identifier for a native thread
pub type ThreadId = u64;

/// The platform a [`Runtime`] is running on
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Android,
    /// macOS, iOS and friends
    Darwin,
    Windows,
    Other,
}

impl Platform {
    /// The platform this crate was compiled for
    pub const fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_vendor = "apple") {
            Self::Darwin
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// The subset of the machine state that is needed to unwind the stack of the
/// thread it was captured on
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CpuContext {
    /// Program counter
    pub pc: Address,
    /// Stack pointer
    pub sp: Address,
    /// Frame pointer
    pub fp: Address,
}

/// An uncaught native exception, as delivered to the process wide exception
/// handler
#[derive(Clone, Debug)]
pub struct NativeException {
    /// Human readable summary, eg. "access violation accessing 0x0"
    pub message: String,
    /// The raw details of the exception, forwarded untouched as the details
    /// of the resulting [`panic_record::PanicRecord`]
    pub payload: serde_json::Value,
    /// The state of the faulting thread
    pub context: CpuContext,
}

/// A single call of an intercepted native function, as seen on entry
#[derive(Clone, Debug)]
pub struct Invocation {
    /// The state of the calling thread on entry
    pub context: CpuContext,
    /// The raw arguments of the call
    pub args: Vec<Address>,
}

/// Identifies a hook attached with [`Runtime::attach`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

/// Invoked by the runtime for every uncaught native exception
pub type ExceptionHandler = Box<dyn Fn(&NativeException) + Send + Sync>;
/// Invoked by the runtime on entry of an intercepted function, on the thread
/// that called it
pub type InvocationHook = Box<dyn Fn(&Invocation) + Send + Sync>;

/// The host instrumentation runtime.
///
/// Every callback registered with a runtime is invoked synchronously on the
/// native thread that triggered it.
pub trait Runtime: Send + Sync {
    fn platform(&self) -> Platform;

    /// The identifier of the calling thread
    fn current_thread_id(&self) -> ThreadId;

    /// Registers the process wide handler for uncaught native exceptions.
    ///
    /// # Errors
    ///
    /// [`Error::HandlerAlreadyInstalled`] if a handler is already registered
    fn set_exception_handler(&self, handler: ExceptionHandler) -> Result<(), Error>;

    /// Removes the handler registered via [`Self::set_exception_handler`], if any
    fn clear_exception_handler(&self);

    /// Unwinds the stack described by the context, returning the return
    /// address of each frame, innermost first
    fn backtrace(&self, context: &CpuContext) -> Vec<Address>;

    /// Resolves an address to a symbol, falling back to
    /// [`Frame::Unresolved`]
    fn symbolicate(&self, address: Address) -> Frame;

    /// Finds an exported symbol in a loaded module. A missing module or
    /// export is a normal outcome, not an error.
    fn find_export(&self, module: &str, name: &str) -> Option<Address>;

    /// Intercepts calls to the function at the specified address.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] if the runtime can't intercept native code at
    /// all, or [`Error::HookFailed`] if this particular function couldn't be
    /// intercepted
    fn attach(&self, target: Address, hook: InvocationHook) -> Result<HookId, Error>;

    /// Removes a hook previously attached with [`Self::attach`]
    fn detach(&self, hook: HookId);

    /// Describes the object at the specified address, used to turn the
    /// object thrown by a managed runtime into a readable description
    fn describe_object(&self, object: Address) -> String;
}
