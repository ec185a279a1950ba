//! Deliberately raises native faults, so that tests can check they are
//! reported as panics.
//!
//! Every function here terminates the process unless a handler catches the
//! fault and never returns control.

use std::arch::asm;

/// The address [`SadnessFlavor::Segfault`] reads from. It is not `null` so
/// that tests can tell the reported fault address apart from a zeroed one.
pub const SEGFAULT_ADDRESS: usize = 0x10;

/// The ways in which the process can be made sad
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SadnessFlavor {
    /// `SIGABRT`
    Abort,
    /// `SIGSEGV`, reading from [`SEGFAULT_ADDRESS`]
    Segfault,
    /// `SIGFPE`, integer division by zero
    DivideByZero,
    /// `SIGILL`
    Illegal,
    /// `SIGTRAP`
    Trap,
}

impl SadnessFlavor {
    /// Raises the fault.
    ///
    /// # Safety
    ///
    /// Not actually unsafe, but the process is in an undefined state if
    /// anything tries to resume after the fault.
    pub unsafe fn make_sad(self) {
        match self {
            Self::Abort => raise_abort(),
            Self::Segfault => raise_segfault(),
            Self::DivideByZero => raise_divide_by_zero(),
            Self::Illegal => raise_illegal_instruction(),
            Self::Trap => raise_trap(),
        }
    }
}

/// Raises `SIGABRT`
pub fn raise_abort() -> ! {
    std::process::abort();
}

/// Raises `SIGSEGV` by reading from [`SEGFAULT_ADDRESS`]
pub fn raise_segfault() {
    let value = unsafe { std::ptr::read_volatile(SEGFAULT_ADDRESS as *const u32) };

    println!("we are crashing by reading from a bad address: {value}");
}

/// Raises `SIGFPE` with an integer division by zero.
///
/// Integer division by zero doesn't trap on aarch64, so the signal is raised
/// directly there instead.
pub fn raise_divide_by_zero() {
    #[cfg(target_arch = "x86_64")]
    let quotient = unsafe {
        let mut divisor: u32;
        asm!(
            "mov eax, 1",
            "cdq",
            "mov {div:e}, 0",
            "idiv {div:e}",
            div = out(reg) divisor,
            out("eax") _,
            out("edx") _,
        );
        divisor
    };

    #[cfg(not(target_arch = "x86_64"))]
    let quotient = unsafe { libc::raise(libc::SIGFPE) };

    println!("we are crashing by dividing by zero: {quotient}");
}

/// Raises `SIGILL`
pub fn raise_illegal_instruction() {
    unsafe {
        #[cfg(target_arch = "x86_64")]
        asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        asm!("udf #0");
    }
}

/// Raises `SIGTRAP`
pub fn raise_trap() {
    unsafe {
        #[cfg(target_arch = "x86_64")]
        asm!("int3");
        #[cfg(target_arch = "aarch64")]
        asm!("brk #0");
    }
}
