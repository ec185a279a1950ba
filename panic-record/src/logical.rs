/// Captures the current Rust level call stack, one line per symbol, innermost
/// first.
///
/// Frames belonging to the capture machinery itself are skipped so the first
/// line is the caller of this function, or of [`crate::PanicRecord::new`].
pub fn capture_logical_stack() -> Vec<String> {
    let bt = backtrace::Backtrace::new();

    let mut lines = Vec::new();
    let mut skipping = true;

    for frame in bt.frames() {
        for symbol in frame.symbols() {
            let name = symbol
                .name()
                .map_or_else(|| "<unknown>".to_owned(), |name| name.to_string());

            // Everything up to and including our own frames is noise
            if skipping {
                if is_capture_frame(&name) {
                    continue;
                }

                skipping = false;
            }

            let line = match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => format!("{name} ({}:{line})", file.display()),
                (Some(file), None) => format!("{name} ({})", file.display()),
                _ => name,
            };

            lines.push(line);
        }
    }

    lines
}

#[inline]
fn is_capture_frame(name: &str) -> bool {
    name.starts_with("backtrace::")
        || name.contains("capture_logical_stack")
        || name.contains("PanicRecord::new")
}
