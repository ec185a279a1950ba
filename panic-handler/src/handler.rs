use crate::{
    Error, PanicSink,
    bridge::{OriginBridge, OriginSignature},
    builder::RecordBuilder,
    risky::{Correlator, RiskyError},
    runtime::{HookId, NativeException, Runtime},
    suppression::SuppressionRegistry,
};
use std::sync::Arc;

/// Options for [`PanicHandler::install_with`]
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// The managed runtime whose uncaught exceptions are correlated with
    /// risky operations, or `None` to only install the generic exception
    /// handler
    pub origin: Option<OriginSignature>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: Some(OriginSignature::OBJECTIVE_C),
        }
    }
}

impl Config {
    #[inline]
    pub fn without_bridge() -> Self {
        Self { origin: None }
    }
}

/// The installed process wide panic handler.
///
/// Every uncaught native exception is turned into a [`panic_record::PanicRecord`]
/// and handed to the sink, unless it was correlated with a risky operation
/// executed via [`Self::perform_risky_operation`].
pub struct PanicHandler {
    runtime: Arc<dyn Runtime>,
    correlator: Correlator,
    hooks: Vec<HookId>,
    installed: bool,
}

impl PanicHandler {
    /// Installs the handler with the default [`Config`].
    ///
    /// # Errors
    ///
    /// See [`Self::install_with`]
    #[inline]
    pub fn install(runtime: Arc<dyn Runtime>, sink: Box<dyn PanicSink>) -> Result<Self, Error> {
        Self::install_with(runtime, sink, Config::default())
    }

    /// Registers the process wide exception handler with the runtime, and,
    /// if the runtime supports it, the origin bridge described by the config.
    ///
    /// # Errors
    ///
    /// - [`Error::HandlerAlreadyInstalled`] if the runtime already has an
    ///   exception handler
    /// - [`Error::HookFailed`] if the origin bridge's functions exist but
    ///   could not be intercepted
    pub fn install_with(
        runtime: Arc<dyn Runtime>,
        sink: Box<dyn PanicSink>,
        config: Config,
    ) -> Result<Self, Error> {
        let sink: Arc<dyn PanicSink> = Arc::from(sink);

        let weak_runtime = Arc::downgrade(&runtime);
        let exception_sink = sink.clone();

        runtime.set_exception_handler(Box::new(move |exception: &NativeException| {
            let Some(runtime) = weak_runtime.upgrade() else {
                return;
            };

            let record = RecordBuilder::new(&*runtime).build(
                exception.message.clone(),
                exception.payload.clone(),
                &exception.context,
            );

            exception_sink.on_panic(record);
        }))?;

        let registry = Arc::new(SuppressionRegistry::new());

        let hooks = match config.origin {
            Some(signature) => {
                match OriginBridge::install(&runtime, signature, sink, registry.clone()) {
                    Ok(hooks) => hooks,
                    Err(err) => {
                        runtime.clear_exception_handler();
                        return Err(err);
                    }
                }
            }
            None => Vec::new(),
        };

        Ok(Self {
            correlator: Correlator::new(runtime.clone(), registry),
            runtime,
            hooks,
            installed: true,
        })
    }

    /// True if exceptions from a managed runtime are being correlated with
    /// risky operations
    #[inline]
    pub fn is_bridge_active(&self) -> bool {
        !self.hooks.is_empty()
    }

    /// Retrieves a handle that can be used to perform risky operations on
    /// any thread
    #[inline]
    pub fn correlator(&self) -> Correlator {
        self.correlator.clone()
    }

    /// See [`Correlator::perform_risky_operation`]
    #[inline]
    pub fn perform_risky_operation<T, E, F>(&self, operation: F) -> Result<T, RiskyError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.correlator.perform_risky_operation(operation)
    }

    /// Detaches the handler.
    ///
    /// This is done automatically when this [`PanicHandler`] is dropped.
    #[inline]
    pub fn detach(mut self) {
        self.uninstall();
    }

    fn uninstall(&mut self) {
        if !self.installed {
            return;
        }

        for hook in self.hooks.drain(..) {
            self.runtime.detach(hook);
        }

        self.runtime.clear_exception_handler();
        self.installed = false;
    }
}

impl Drop for PanicHandler {
    fn drop(&mut self) {
        self.uninstall();
    }
}
