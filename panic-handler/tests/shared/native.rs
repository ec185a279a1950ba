use panic_handler::{NativeRuntime, PanicHandler, PanicRecord, Runtime, make_panic_sink};
pub use sadness_generator::SadnessFlavor;
use std::sync::Arc;

/// Checks the record of a real fault, the sink runs inside the signal handler
/// so a mismatch is reported via the exit code rather than a panic
fn verify(flavor: SadnessFlavor, record: &PanicRecord) -> Result<(), String> {
    let (message, kind) = match flavor {
        SadnessFlavor::Abort => ("abort was called".to_owned(), "abort"),
        SadnessFlavor::Segfault => (
            format!(
                "access violation accessing 0x{:x}",
                sadness_generator::SEGFAULT_ADDRESS
            ),
            "access-violation",
        ),
        SadnessFlavor::DivideByZero => ("divide by zero".to_owned(), "arithmetic"),
        SadnessFlavor::Illegal => ("illegal instruction".to_owned(), "illegal-instruction"),
        SadnessFlavor::Trap => ("breakpoint triggered".to_owned(), "breakpoint"),
    };

    if record.message() != message {
        return Err(format!("unexpected message '{}'", record.message()));
    }

    if record.details()["type"] != kind {
        return Err(format!("unexpected details {}", record.details()));
    }

    let native = &record.stack().native;

    if native.is_empty() {
        return Err("native stack is empty".to_owned());
    }

    // Only the faulting thread's frames are reported, never the signal
    // handler that observed the fault or the unwinding it did
    if let Some(frame) = native.iter().find(|frame| {
        frame.symbol().is_some_and(|sym| {
            sym.contains("panic_handler::")
                || sym.contains("signal_handler")
                || sym.starts_with("backtrace::")
                || sym.contains("__restore_rt")
        })
    }) {
        return Err(format!("handler frame in native stack: {frame}"));
    }

    // The innermost frame is where the fault happened, which is always
    // below the call into sadness-generator
    if !native
        .iter()
        .any(|frame| frame.symbol().is_some_and(|sym| sym.contains("handles_panic::indirect")))
    {
        return Err("faulting call path is missing from native stack".to_owned());
    }

    // The sink is always reached via the signal handler
    if record.stack().logical.is_empty() {
        return Err("logical stack is empty".to_owned());
    }

    Ok(())
}

pub fn handles_panic(flavor: SadnessFlavor) {
    let runtime: Arc<dyn Runtime> = Arc::new(NativeRuntime::new());

    let handler = PanicHandler::install(
        runtime,
        make_panic_sink(move |record| {
            let code = match verify(flavor, &record) {
                Ok(()) => 0,
                Err(reason) => {
                    eprintln!("{reason}\n{record}");
                    1
                }
            };

            // Execution never resumes after a panic, and we only have 1 test
            // per binary, so just exit with the verdict
            #[allow(clippy::exit)]
            std::process::exit(code);
        }),
    )
    .unwrap();

    assert!(
        !handler.is_bridge_active(),
        "native runtime can't intercept functions"
    );

    #[inline(never)]
    unsafe fn indirect(flavor: SadnessFlavor) {
        unsafe { flavor.make_sad() };
    }

    unsafe {
        indirect(flavor);
    }

    panic!("this should be impossible");
}
