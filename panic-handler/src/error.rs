/// An error that can occur when installing or detaching a [`crate::PanicHandler`],
/// or when a [`crate::Runtime`] fails to provide one of its capabilities
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// For simplicity sake, only one exception handler can be registered
    /// with a runtime at any one time.
    #[error("an exception handler is already installed")]
    HandlerAlreadyInstalled,
    /// The runtime does not provide the named capability
    #[error("the runtime does not support {0}")]
    Unsupported(&'static str),
    /// The runtime was unable to intercept the function at the address
    #[error("unable to hook function at 0x{address:x}: {reason}")]
    HookFailed { address: u64, reason: String },
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
