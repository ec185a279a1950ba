//! Correlates exceptions thrown by a managed runtime layered on top of the
//! process (eg. Objective-C) with the process abort they eventually cause
//! when nobody catches them.
//!
//! Two native functions are intercepted. The runtime's throw function, where
//! the thrown object is still available and can be described, and the
//! process' abort function. When abort is reached via the runtime's
//! "unhandled exception" terminate routine, the exception recorded at throw
//! time on the same thread is either handed to the risky operation that
//! thread is executing, or reported as a panic.

use crate::{
    Error, PanicSink,
    builder::RecordBuilder,
    runtime::{Address, HookId, Invocation, Platform, Runtime, ThreadId},
    suppression::{CapturedException, SuppressionRegistry},
};
use panic_record::PanicRecord;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

/// Describes the managed runtime whose exceptions are correlated, and the
/// native functions and symbols that identify its throw and terminate paths
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OriginSignature {
    /// The only platform the runtime exists on
    pub platform: Platform,
    /// Name of the runtime, used in panic messages
    pub origin: &'static str,
    /// The module the runtime is implemented in
    pub runtime_module: &'static str,
    /// The export in [`Self::runtime_module`] called for every throw
    pub raise_export: &'static str,
    /// The symbol in [`Self::runtime_module`] that is on the stack when an
    /// uncaught exception terminates the process
    pub terminate_symbol: &'static str,
    /// The module exporting the process abort function
    pub abort_module: &'static str,
    /// The process abort function
    pub abort_export: &'static str,
}

impl OriginSignature {
    /// Objective-C exceptions on Apple platforms
    pub const OBJECTIVE_C: Self = Self {
        platform: Platform::Darwin,
        origin: "Objective-C",
        runtime_module: "libobjc.A.dylib",
        raise_export: "objc_exception_throw",
        terminate_symbol: "_objc_terminate()",
        abort_module: "libsystem_c.dylib",
        abort_export: "abort",
    };

    /// The message of the panic reported for an uncaught exception
    #[inline]
    pub fn panic_message(&self, description: &str) -> String {
        format!("Unhandled {} exception: {description}", self.origin)
    }
}

/// The maximum number of threads a pending throw is remembered for.
///
/// Most throws are caught, and threads exit, without ever reaching the
/// terminate routine, so pending throws are evicted oldest first once this
/// many threads have one.
const MAX_CANDIDATES: usize = 32;

/// The most recent throw observed on a thread
struct Candidate {
    description: String,
    record: PanicRecord,
}

/// Pending throws keyed by thread, bounded to [`MAX_CANDIDATES`]
#[derive(Default)]
struct Candidates {
    slots: HashMap<ThreadId, (u64, Candidate)>,
    next_seq: u64,
}

impl Candidates {
    /// Replaces the thread's pending throw, evicting the oldest one of some
    /// other thread if there are too many
    fn insert(&mut self, thread_id: ThreadId, candidate: Candidate) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.slots.insert(thread_id, (seq, candidate));

        if self.slots.len() > MAX_CANDIDATES {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(tid, _)| *tid);

            if let Some(tid) = oldest {
                log::debug!("forgetting pending exception of thread {tid}");
                self.slots.remove(&tid);
            }
        }
    }

    #[inline]
    fn take(&mut self, thread_id: ThreadId) -> Option<Candidate> {
        self.slots.remove(&thread_id).map(|(_, candidate)| candidate)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

pub(crate) struct OriginBridge {
    signature: OriginSignature,
    runtime: Weak<dyn Runtime>,
    sink: Arc<dyn PanicSink>,
    registry: Arc<SuppressionRegistry>,
    /// Keyed by thread so that concurrent throws on different threads are
    /// never confused with each other
    candidates: Mutex<Candidates>,
}

impl OriginBridge {
    /// Attaches the throw and abort hooks, returning their ids.
    ///
    /// If the runtime is not present, or the host runtime is unable to
    /// intercept native code, no hooks are attached and an empty list is
    /// returned, leaving only the generic exception handler active.
    pub(crate) fn install(
        runtime: &Arc<dyn Runtime>,
        signature: OriginSignature,
        sink: Arc<dyn PanicSink>,
        registry: Arc<SuppressionRegistry>,
    ) -> Result<Vec<HookId>, Error> {
        if runtime.platform() != signature.platform {
            log::debug!(
                "{} exceptions don't exist on {:?}, skipping origin bridge",
                signature.origin,
                runtime.platform()
            );
            return Ok(Vec::new());
        }

        let Some(raise) = runtime.find_export(signature.runtime_module, signature.raise_export)
        else {
            log::debug!(
                "{}!{} not found, skipping origin bridge",
                signature.runtime_module,
                signature.raise_export
            );
            return Ok(Vec::new());
        };

        let Some(abort) = runtime.find_export(signature.abort_module, signature.abort_export)
        else {
            log::warn!(
                "{}!{} not found, {} exceptions will be reported as generic faults",
                signature.abort_module,
                signature.abort_export,
                signature.origin
            );
            return Ok(Vec::new());
        };

        let bridge = Arc::new(Self {
            signature,
            runtime: Arc::downgrade(runtime),
            sink,
            registry,
            candidates: Mutex::new(Candidates::default()),
        });

        let entries: [(Address, fn(&Self, &Invocation)); 2] =
            [(raise, Self::on_raise), (abort, Self::on_terminate)];

        let mut hooks = Vec::with_capacity(entries.len());

        for (target, on_entry) in entries {
            let bridge = bridge.clone();

            match runtime.attach(
                target,
                Box::new(move |invocation: &Invocation| on_entry(&bridge, invocation)),
            ) {
                Ok(id) => hooks.push(id),
                Err(err) => {
                    // Don't leave half a bridge behind
                    for id in hooks {
                        runtime.detach(id);
                    }

                    return if let Error::Unsupported(what) = err {
                        log::warn!(
                            "runtime does not support {what}, {} exceptions will be reported as generic faults",
                            signature.origin
                        );
                        Ok(Vec::new())
                    } else {
                        Err(err)
                    };
                }
            }
        }

        log::debug!(
            "attached {} origin bridge to 0x{raise:x} and 0x{abort:x}",
            signature.origin
        );

        Ok(hooks)
    }

    /// Records the thrown object as the pending candidate of the thread
    fn on_raise(&self, invocation: &Invocation) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };

        let Some(&object) = invocation.args.first() else {
            log::warn!("{} called without an exception object", self.signature.raise_export);
            return;
        };

        let description = runtime.describe_object(object);
        let record = RecordBuilder::new(&*runtime).build(
            self.signature.panic_message(&description),
            serde_json::json!({}),
            &invocation.context,
        );

        log::trace!("{} exception thrown: {description}", self.signature.origin);

        self.candidates
            .lock()
            .insert(runtime.current_thread_id(), Candidate { description, record });
    }

    /// Decides whether this abort was caused by an uncaught exception, and
    /// if so who receives it
    fn on_terminate(&self, invocation: &Invocation) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };

        let signature = &self.signature;

        let is_uncaught_exception = runtime
            .backtrace(&invocation.context)
            .into_iter()
            .map(|address| runtime.symbolicate(address))
            .any(|frame| {
                frame.module() == Some(signature.runtime_module)
                    && frame.symbol() == Some(signature.terminate_symbol)
            });

        // Some other abort, none of our business
        if !is_uncaught_exception {
            return;
        }

        let thread_id = runtime.current_thread_id();

        let candidate = self.candidates.lock().take(thread_id);
        let candidate = candidate.unwrap_or_else(|| {
            log::warn!(
                "thread {thread_id} is terminating due to an uncaught {} exception that was never observed being thrown",
                signature.origin
            );

            let description = "<unknown>".to_owned();
            let record = RecordBuilder::new(&*runtime).build(
                signature.panic_message(&description),
                serde_json::json!({}),
                &invocation.context,
            );

            Candidate {
                description,
                record,
            }
        });

        let exception = CapturedException {
            origin: signature.origin.to_owned(),
            description: candidate.description,
        };

        if !self.registry.resolve(thread_id, exception) {
            self.sink.on_panic(candidate.record);
        }
    }
}
