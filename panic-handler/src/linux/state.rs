use super::Signal;
use crate::{
    Error,
    runtime::{CpuContext, ExceptionHandler, NativeException},
};
use std::{mem, ptr};

/// The various signals we attempt to handle
const EXCEPTION_SIGNALS: [Signal; 6] = [
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Trap,
];

/// We define these constants ourselves rather than use libc as they are
/// missing from eg. Android
const FPE_INTDIV: i32 = 1;
const FPE_INTOVF: i32 = 2;

/// The size of the alternate stack that is mapped for the attaching thread.
///
/// Building a record unwinds and symbolizes the faulting thread from within
/// the signal handler, which needs far more than the minimal `SIGSTKSZ`
/// stacks that eg. the Rust runtime installs. The memory is only committed
/// when a signal is actually handled.
const SIG_STACK_SIZE: usize = if libc::SIGSTKSZ > 512 * 1024 {
    libc::SIGSTKSZ
} else {
    512 * 1024
};

struct StackSave {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
    /// The guard page in front of `new`, part of the same mapping
    guard_size: usize,
}

unsafe impl Send for StackSave {}

static STACK_SAVE: parking_lot::Mutex<Option<StackSave>> = parking_lot::const_mutex(None);

static OLD_HANDLERS: parking_lot::Mutex<Option<[libc::sigaction; 6]>> =
    parking_lot::const_mutex(None);

static HANDLER: parking_lot::Mutex<Option<ExceptionHandler>> = parking_lot::const_mutex(None);

/// Creates an alternate stack for the calling thread to run the signal handler
/// on, unless it already has one that is large enough
unsafe fn install_sigaltstack() -> Result<(), Error> {
    unsafe {
        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            return Ok(());
        }

        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let ptr = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        // Everything but the guard page is usable stack
        let stack_ptr = (ptr as usize + guard_size) as *mut libc::c_void;
        if libc::mprotect(
            stack_ptr,
            SIG_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        ) == -1
        {
            let err = std::io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(err.into());
        }

        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) == -1 {
            let err = std::io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(err.into());
        }

        *STACK_SAVE.lock() = Some(StackSave {
            old: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
            new: new_stack,
            guard_size,
        });

        Ok(())
    }
}

/// Restores the alternate stack that was active before
/// [`install_sigaltstack`], if the calling thread is still using ours
unsafe fn restore_sigaltstack() {
    let mut ssl = STACK_SAVE.lock();

    let Some(ss) = &*ssl else {
        return;
    };

    unsafe {
        let mut current_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current_stack) == -1 {
            return;
        }

        // Another thread attached, or somebody replaced our stack, either
        // way it can't be unmapped from here
        if current_stack.ss_sp != ss.new.ss_sp {
            return;
        }

        let restored = match ss.old {
            Some(old) => libc::sigaltstack(&old, ptr::null_mut()),
            None => {
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                libc::sigaltstack(&disable, ptr::null_mut())
            }
        };

        if restored == -1 {
            return;
        }

        libc::munmap(
            (ss.new.ss_sp as usize - ss.guard_size) as *mut libc::c_void,
            ss.new.ss_size + ss.guard_size,
        );
    }

    ssl.take();
}

/// The address range of the alternate stack the calling thread is currently
/// executing on, if it is executing on one.
///
/// Only uses `sigaltstack`, so it is safe to call from the signal handler.
pub(super) fn executing_alt_stack() -> Option<std::ops::Range<u64>> {
    // SAFETY: syscall
    unsafe {
        let mut current: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current) == -1
            || current.ss_flags & libc::SS_ONSTACK == 0
        {
            return None;
        }

        let start = current.ss_sp as u64;
        Some(start..start + current.ss_size as u64)
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
unsafe fn install_default_handler(sig: Signal) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig as i32,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig as i32, libc::SIG_DFL);
            }
        }
    }
}

/// Restores all of the signal handlers back to their previous values, or the
/// default if the previous value cannot be restored
unsafe fn restore_handlers() {
    let mut ohl = OLD_HANDLERS.lock();

    if let Some(old) = &*ohl {
        unsafe {
            for (sig, action) in EXCEPTION_SIGNALS.into_iter().zip(old.iter()) {
                if libc::sigaction(sig as i32, action, ptr::null_mut()) == -1 {
                    install_default_handler(sig);
                }
            }
        }
    }

    ohl.take();
}

unsafe fn install_handlers() -> Result<(), Error> {
    let mut ohl = OLD_HANDLERS.lock();

    if ohl.is_some() {
        return Ok(());
    }

    unsafe {
        // Store all of the current handlers so we can restore them later
        let mut old_handlers: [libc::sigaction; 6] = mem::zeroed();

        for (sig, old) in EXCEPTION_SIGNALS.iter().zip(old_handlers.iter_mut()) {
            if libc::sigaction(*sig as i32, ptr::null(), old) == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all exception signals when we're handling one of them.
        for sig in EXCEPTION_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for sig in EXCEPTION_SIGNALS {
            // At this point it is impractical to back out changes, and so failure to
            // install a signal is intentionally ignored.
            let _ = libc::sigaction(sig as i32, &sa, ptr::null_mut());
        }

        *ohl = Some(old_handlers);
    }

    Ok(())
}

pub(super) fn attach(handler: ExceptionHandler) -> Result<(), Error> {
    let mut lock = HANDLER.lock();

    if lock.is_some() {
        return Err(Error::HandlerAlreadyInstalled);
    }

    // SAFETY: syscalls
    unsafe {
        install_sigaltstack()?;
        if let Err(err) = install_handlers() {
            restore_sigaltstack();
            return Err(err);
        }
    }

    *lock = Some(handler);

    Ok(())
}

/// Detaches our signal handlers, restoring the previously installed or default
/// handlers
pub(super) fn detach() {
    let mut lock = HANDLER.lock();
    if lock.take().is_some() {
        // SAFETY: syscalls
        unsafe {
            restore_sigaltstack();
            restore_handlers();
        }
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(sig: i32, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    let Some(signal) = Signal::from_raw(sig) else {
        return;
    };

    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as *const () as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                libc::sigemptyset(&mut cur_handler.sa_mask);
                libc::sigaddset(&mut cur_handler.sa_mask, sig);

                cur_handler.sa_sigaction = signal_handler as *const () as usize;
                cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    install_default_handler(signal);
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        let info = &*info;

        {
            let handler = HANDLER.lock();

            if let Some(handler) = &*handler {
                debug_print!("reporting native exception");
                handler(&native_exception(signal, info, uc));
            }
        }

        // Execution never resumes after a panic, so whoever had the signal
        // before us gets it next, which is usually the default action of
        // terminating the process
        debug_print!("restoring handlers");
        restore_handlers();

        if info.si_code <= 0 || signal == Signal::Abort {
            // This signal was triggered by somebody sending us the signal with kill().
            // In order to retrigger it, we have to queue a new signal by calling
            // kill() ourselves.  The special case (si_pid == 0 && sig == SIGABRT) is
            // due to the kernel sending a SIGABRT from a user request via SysRQ.
            let tid = libc::syscall(libc::SYS_gettid) as i32;
            if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                // If we failed to kill ourselves (e.g. because a sandbox disallows us
                // to do so), we instead resort to terminating our process. This will
                // result in an incorrect exit code.
                libc::_exit(1);
            }
        } else {
            // This was a synchronous signal triggered by a hard fault (e.g. SIGSEGV).
            // No need to reissue the signal. It will automatically trigger again,
            // when we return from the signal handler.
        }
    }
}

/// Describes the signal as a native exception
unsafe fn native_exception(
    signal: Signal,
    info: &libc::siginfo_t,
    uc: *mut libc::c_void,
) -> NativeException {
    let code = info.si_code;
    // SAFETY: the fault address is part of a union, but every signal we
    // handle is either a fault that fills it in, or doesn't look at it
    let address = unsafe { info.si_addr() } as u64;

    let message = match signal {
        Signal::Abort => "abort was called".to_owned(),
        Signal::Bus => format!("bus error accessing 0x{address:x}"),
        Signal::Fpe if code == FPE_INTDIV => "divide by zero".to_owned(),
        Signal::Fpe if code == FPE_INTOVF => "integer overflow".to_owned(),
        Signal::Fpe => "arithmetic error".to_owned(),
        Signal::Illegal => "illegal instruction".to_owned(),
        Signal::Segv => format!("access violation accessing 0x{address:x}"),
        Signal::Trap => "breakpoint triggered".to_owned(),
    };

    NativeException {
        message,
        payload: serde_json::json!({
            "type": signal.kind(),
            "signal": signal as i32,
            "code": code,
            "address": format!("0x{address:x}"),
        }),
        context: unsafe { cpu_context(uc) },
    }
}

/// Reads the registers needed for unwinding from the `ucontext_t` the signal
/// was delivered with.
///
/// Note that we use [`crash_context::ucontext_t`] instead of [`libc::ucontext_t`]
/// as libc's differs between glibc and musl, even though the layout the kernel
/// delivers is only arch specific
#[cfg(target_arch = "x86_64")]
unsafe fn cpu_context(uc: *mut libc::c_void) -> CpuContext {
    const REG_RBP: usize = 10;
    const REG_RSP: usize = 15;
    const REG_RIP: usize = 16;

    if uc.is_null() {
        return CpuContext::default();
    }

    let uc = unsafe { &*uc.cast::<crash_context::ucontext_t>() };
    let gregs = &uc.uc_mcontext.gregs;

    CpuContext {
        pc: gregs[REG_RIP] as u64,
        sp: gregs[REG_RSP] as u64,
        fp: gregs[REG_RBP] as u64,
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn cpu_context(uc: *mut libc::c_void) -> CpuContext {
    if uc.is_null() {
        return CpuContext::default();
    }

    let uc = unsafe { &*uc.cast::<crash_context::ucontext_t>() };
    let mcontext = &uc.uc_mcontext;

    CpuContext {
        pc: mcontext.pc,
        sp: mcontext.sp,
        // x29 is the frame pointer
        fp: mcontext.regs[29],
    }
}

/// We only unwind from a signal context on 64-bit targets, elsewhere the
/// stack is unwound from the signal handler without a faulting context
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn cpu_context(_uc: *mut libc::c_void) -> CpuContext {
    CpuContext::default()
}
