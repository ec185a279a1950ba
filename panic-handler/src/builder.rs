use crate::runtime::{CpuContext, Runtime};
use panic_record::{Frame, PanicRecord};

/// Turns raw exceptions into symbolized [`PanicRecord`]s using the stack
/// unwinding and symbolization of a [`Runtime`]
pub struct RecordBuilder<'rt> {
    runtime: &'rt dyn Runtime,
}

impl<'rt> RecordBuilder<'rt> {
    #[inline]
    pub fn new(runtime: &'rt dyn Runtime) -> Self {
        Self { runtime }
    }

    /// Resolves the native stack of the context, oldest caller first.
    ///
    /// This never returns an empty stack, if the runtime is unable to unwind
    /// the context at all, the program counter is used as the only frame.
    pub fn native_stack(&self, context: &CpuContext) -> Vec<Frame> {
        let mut addresses = self.runtime.backtrace(context);

        if addresses.is_empty() {
            addresses.push(context.pc);
        }

        addresses
            .into_iter()
            .rev()
            .map(|address| self.runtime.symbolicate(address))
            .collect()
    }

    /// Builds a record, capturing the logical stack of the caller
    pub fn build(
        &self,
        message: impl Into<String>,
        details: serde_json::Value,
        context: &CpuContext,
    ) -> PanicRecord {
        PanicRecord::new(message, details, self.native_stack(context))
    }
}
