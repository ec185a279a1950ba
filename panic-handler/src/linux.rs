mod state;

use crate::{
    Error,
    runtime::{
        Address, CpuContext, ExceptionHandler, HookId, InvocationHook, Platform, Runtime, ThreadId,
    },
};
use panic_record::Frame;
use std::ffi::{CStr, CString, c_void};

/// The signals that are reported as native exceptions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

impl Signal {
    #[inline]
    pub fn from_raw(signal: i32) -> Option<Self> {
        Some(match signal {
            libc::SIGABRT => Self::Abort,
            libc::SIGBUS => Self::Bus,
            libc::SIGFPE => Self::Fpe,
            libc::SIGILL => Self::Illegal,
            libc::SIGSEGV => Self::Segv,
            libc::SIGTRAP => Self::Trap,
            _ => return None,
        })
    }

    /// The exception type reported in the payload of the native exception
    #[inline]
    pub fn kind(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Bus => "bus-error",
            Self::Fpe => "arithmetic",
            Self::Illegal => "illegal-instruction",
            Self::Segv => "access-violation",
            Self::Trap => "breakpoint",
        }
    }
}

/// A [`Runtime`] for the current Linux/Android process.
///
/// Uncaught native exceptions are signals, stacks are unwound and symbolized
/// in process. Intercepting native functions is not supported, so the origin
/// bridge is never active with this runtime.
#[derive(Default)]
pub struct NativeRuntime {
    _priv: (),
}

impl NativeRuntime {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Runtime for NativeRuntime {
    #[inline]
    fn platform(&self) -> Platform {
        Platform::current()
    }

    #[inline]
    fn current_thread_id(&self) -> ThreadId {
        // SAFETY: syscall
        unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
    }

    fn set_exception_handler(&self, handler: ExceptionHandler) -> Result<(), Error> {
        state::attach(handler)
    }

    fn clear_exception_handler(&self) {
        state::detach();
    }

    fn backtrace(&self, context: &CpuContext) -> Vec<Address> {
        let mut faulting = Vec::new();
        let mut everything = Vec::new();

        if context.pc != 0 {
            faulting.push(context.pc);
        }

        // The signal handler and us run on the alternate stack, which can be
        // mapped anywhere relative to the faulting stack. Without one, the
        // handler frames are the ones below the faulting stack pointer.
        let alt_stack = state::executing_alt_stack();
        let is_handler_frame = |sp: Address| match &alt_stack {
            Some(range) => range.contains(&sp),
            None => sp <= context.sp,
        };

        backtrace::trace(|frame| {
            let ip = frame.ip() as Address;
            let sp = frame.sp() as Address;

            everything.push(ip);

            // The faulting frame itself is already the pc
            if !is_handler_frame(sp) && ip != context.pc && ip != context.pc.wrapping_add(1) {
                faulting.push(ip);
            }

            true
        });

        // No faulting context, the caller wants the current stack
        if context.sp == 0 {
            return everything;
        }

        // The unwinder can't tell us the stack pointer of each frame, so we
        // can't separate the faulting frames from our own
        if faulting.len() <= usize::from(context.pc != 0) {
            faulting.extend(everything);
        }

        faulting
    }

    fn symbolicate(&self, address: Address) -> Frame {
        let module = module_name(address);

        let mut resolved = None;
        backtrace::resolve(address as *mut c_void, |symbol| {
            if resolved.is_some() {
                return;
            }

            if let Some(name) = symbol.name() {
                let offset = symbol
                    .addr()
                    .map_or(0, |start| address.saturating_sub(start as Address));
                resolved = Some((name.to_string(), offset));
            }
        });

        match resolved {
            Some((symbol, offset)) => Frame::Resolved {
                address,
                module: module.unwrap_or_else(|| "<unknown>".to_owned()),
                symbol,
                offset,
            },
            None => Frame::Unresolved { address, module },
        }
    }

    fn find_export(&self, module: &str, name: &str) -> Option<Address> {
        let module = CString::new(module).ok()?;
        let name = CString::new(name).ok()?;

        // SAFETY: syscalls, we never load a module that isn't already loaded
        unsafe {
            let handle = libc::dlopen(module.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD);
            if handle.is_null() {
                return None;
            }

            let symbol = libc::dlsym(handle, name.as_ptr());
            libc::dlclose(handle);

            (!symbol.is_null()).then_some(symbol as Address)
        }
    }

    fn attach(&self, _target: Address, _hook: InvocationHook) -> Result<HookId, Error> {
        Err(Error::Unsupported("native function interception"))
    }

    fn detach(&self, _hook: HookId) {}

    fn describe_object(&self, object: Address) -> String {
        format!("object at 0x{object:x}")
    }
}

/// Retrieves the file name of the module containing the address
fn module_name(address: Address) -> Option<String> {
    // SAFETY: dladdr only inspects the loaded module list
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(address as *const c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return None;
        }

        let path = CStr::from_ptr(info.dli_fname).to_string_lossy();
        let name = path.rsplit('/').next().unwrap_or_default();

        (!name.is_empty()).then(|| name.to_owned())
    }
}
