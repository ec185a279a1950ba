#![allow(dead_code)]

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod native;

use panic_handler::{
    Address, CpuContext, Error, ExceptionHandler, Frame, HookId, Invocation, InvocationHook,
    NativeException, PanicRecord, PanicSink, Platform, Runtime, ThreadId, make_panic_sink,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

pub const OBJC: &str = "libobjc.A.dylib";
pub const LIBC: &str = "libsystem_c.dylib";
pub const APP: &str = "app";

pub const OBJC_EXCEPTION_THROW: Address = 0x1000;
pub const OBJC_TERMINATE: Address = 0x1800;
pub const ABORT: Address = 0x2000;
pub const CXX_TERMINATE: Address = 0x3000;
pub const APP_MAIN: Address = 0x4000;
pub const APP_COMPUTE: Address = 0x4100;
pub const APP_DIVIDE: Address = 0x4200;
pub const APP_BAIL: Address = 0x4300;
pub const APP_ACCESS_ARRAY: Address = 0x4400;
pub const UNSYMBOLIZED: Address = 0x9999;

/// Stacks are identified by the stack pointer of the contexts that refer to
/// them
pub const GENERIC_STACK: Address = 0x7000_0000;
pub const THROW_STACK: Address = 0x7100_0000;
pub const TERMINATE_STACK: Address = 0x7200_0000;
pub const UNRELATED_ABORT_STACK: Address = 0x7300_0000;

/// The object thrown by `-[NSArray objectAtIndex:]`
pub const INDEX_EXCEPTION: Address = 0xdead_0001;
pub const INDEX_DESCRIPTION: &str = "Index out of bounds";

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: ThreadId = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

type SharedHook = Arc<dyn Fn(&Invocation) + Send + Sync>;
type SharedHandler = Arc<dyn Fn(&NativeException) + Send + Sync>;

/// A scripted [`Runtime`] where exceptions and calls of intercepted
/// functions are triggered by the test itself
pub struct SimulatedRuntime {
    platform: Platform,
    can_intercept: bool,
    failing_hooks: Vec<Address>,
    exports: HashMap<(String, String), Address>,
    symbols: HashMap<Address, Frame>,
    stacks: HashMap<Address, Vec<Address>>,
    objects: HashMap<Address, String>,
    handler: Mutex<Option<SharedHandler>>,
    hooks: Mutex<HashMap<Address, Vec<(HookId, SharedHook)>>>,
    next_hook: AtomicU64,
}

impl SimulatedRuntime {
    pub fn new(platform: Platform) -> Self {
        let mut rt = Self {
            platform,
            can_intercept: true,
            failing_hooks: Vec::new(),
            exports: HashMap::new(),
            symbols: HashMap::new(),
            stacks: HashMap::new(),
            objects: HashMap::new(),
            handler: Mutex::new(None),
            hooks: Mutex::new(HashMap::new()),
            next_hook: AtomicU64::new(1),
        };

        rt.add_symbol(APP_MAIN, APP, "main", 0x24);
        rt.add_symbol(APP_COMPUTE, APP, "compute", 0x10);
        rt.add_symbol(APP_DIVIDE, APP, "divide", 0x8);
        rt.add_symbol(APP_BAIL, APP, "bail", 0x4);
        rt.add_symbol(APP_ACCESS_ARRAY, APP, "-[Table accessRow:]", 0x3c);

        rt.stacks.insert(GENERIC_STACK, vec![APP_DIVIDE, APP_COMPUTE, APP_MAIN]);
        rt.stacks.insert(UNRELATED_ABORT_STACK, vec![ABORT, APP_BAIL, APP_MAIN]);

        rt
    }

    /// An Apple platform with the Objective-C runtime loaded
    pub fn darwin() -> Self {
        let mut rt = Self::new(Platform::Darwin);

        rt.exports.insert(
            (OBJC.to_owned(), "objc_exception_throw".to_owned()),
            OBJC_EXCEPTION_THROW,
        );
        rt.exports
            .insert((LIBC.to_owned(), "abort".to_owned()), ABORT);

        rt.add_symbol(OBJC_EXCEPTION_THROW, OBJC, "objc_exception_throw", 0);
        rt.add_symbol(OBJC_TERMINATE, OBJC, "_objc_terminate()", 0x70);
        rt.add_symbol(ABORT, LIBC, "abort", 0);
        rt.add_symbol(CXX_TERMINATE, "libc++abi.dylib", "std::__terminate(void (*)())", 0x10);

        rt.stacks.insert(
            THROW_STACK,
            vec![OBJC_EXCEPTION_THROW, APP_ACCESS_ARRAY, APP_MAIN],
        );
        rt.stacks.insert(
            TERMINATE_STACK,
            vec![ABORT, OBJC_TERMINATE, CXX_TERMINATE, APP_ACCESS_ARRAY, APP_MAIN],
        );

        rt.objects
            .insert(INDEX_EXCEPTION, INDEX_DESCRIPTION.to_owned());

        rt
    }

    /// The runtime is unable to intercept native functions
    pub fn without_interception(mut self) -> Self {
        self.can_intercept = false;
        self
    }

    /// Attaching to the specified function fails
    pub fn failing_hook(mut self, target: Address) -> Self {
        self.failing_hooks.push(target);
        self
    }

    pub fn without_export(mut self, module: &str, name: &str) -> Self {
        self.exports.remove(&(module.to_owned(), name.to_owned()));
        self
    }

    pub fn add_symbol(&mut self, address: Address, module: &str, symbol: &str, offset: u64) {
        self.symbols.insert(
            address,
            Frame::Resolved {
                address,
                module: module.to_owned(),
                symbol: symbol.to_owned(),
                offset,
            },
        );
    }

    pub fn add_object(&mut self, object: Address, description: &str) {
        self.objects.insert(object, description.to_owned());
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Delivers an uncaught native exception, returning false if there was no
    /// handler
    pub fn raise(&self, message: &str, payload: serde_json::Value, context: CpuContext) -> bool {
        let handler = self.handler.lock().clone();

        let Some(handler) = handler else {
            return false;
        };

        handler(&NativeException {
            message: message.to_owned(),
            payload,
            context,
        });

        true
    }

    /// Calls a native function, running every hook attached to it on the
    /// calling thread. Returns the number of hooks that ran.
    pub fn call(&self, target: Address, context: CpuContext, args: &[Address]) -> usize {
        let hooks: Vec<SharedHook> = self
            .hooks
            .lock()
            .get(&target)
            .map(|hooks| hooks.iter().map(|(_, hook)| hook.clone()).collect())
            .unwrap_or_default();

        let invocation = Invocation {
            context,
            args: args.to_vec(),
        };

        for hook in &hooks {
            hook(&invocation);
        }

        hooks.len()
    }

    /// `@throw` of the specified object
    pub fn throw_objc(&self, object: Address) -> usize {
        self.call(
            OBJC_EXCEPTION_THROW,
            context(THROW_STACK, OBJC_EXCEPTION_THROW),
            &[object],
        )
    }

    /// `abort` called from `_objc_terminate`, as happens when nobody catches
    /// an Objective-C exception
    pub fn terminate_uncaught(&self) -> usize {
        self.call(ABORT, context(TERMINATE_STACK, ABORT), &[])
    }

    /// `abort` called directly by application code
    pub fn abort_unrelated(&self) -> usize {
        self.call(ABORT, context(UNRELATED_ABORT_STACK, ABORT), &[])
    }

    pub fn attached_hooks(&self) -> usize {
        self.hooks.lock().values().map(Vec::len).sum()
    }

    pub fn has_exception_handler(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl Runtime for SimulatedRuntime {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn current_thread_id(&self) -> ThreadId {
        THREAD_ID.with(|id| *id)
    }

    fn set_exception_handler(&self, handler: ExceptionHandler) -> Result<(), Error> {
        let mut lock = self.handler.lock();

        if lock.is_some() {
            return Err(Error::HandlerAlreadyInstalled);
        }

        *lock = Some(Arc::from(handler));
        Ok(())
    }

    fn clear_exception_handler(&self) {
        self.handler.lock().take();
    }

    fn backtrace(&self, context: &CpuContext) -> Vec<Address> {
        self.stacks.get(&context.sp).cloned().unwrap_or_default()
    }

    fn symbolicate(&self, address: Address) -> Frame {
        self.symbols
            .get(&address)
            .cloned()
            .unwrap_or(Frame::Unresolved {
                address,
                module: None,
            })
    }

    fn find_export(&self, module: &str, name: &str) -> Option<Address> {
        self.exports
            .get(&(module.to_owned(), name.to_owned()))
            .copied()
    }

    fn attach(&self, target: Address, hook: InvocationHook) -> Result<HookId, Error> {
        if !self.can_intercept {
            return Err(Error::Unsupported("native function interception"));
        }

        if self.failing_hooks.contains(&target) {
            return Err(Error::HookFailed {
                address: target,
                reason: "function is too short to hook".to_owned(),
            });
        }

        let id = HookId(self.next_hook.fetch_add(1, Ordering::Relaxed));
        self.hooks
            .lock()
            .entry(target)
            .or_default()
            .push((id, Arc::from(hook)));

        Ok(id)
    }

    fn detach(&self, hook: HookId) {
        let mut hooks = self.hooks.lock();

        for attached in hooks.values_mut() {
            attached.retain(|(id, _)| *id != hook);
        }

        hooks.retain(|_, attached| !attached.is_empty());
    }

    fn describe_object(&self, object: Address) -> String {
        self.objects
            .get(&object)
            .cloned()
            .unwrap_or_else(|| format!("<object 0x{object:x}>"))
    }
}

/// A context whose stack is one of the scripted stacks
pub fn context(stack: Address, pc: Address) -> CpuContext {
    CpuContext {
        pc,
        sp: stack,
        fp: stack + 0x10,
    }
}

/// Collects every record handed to the sink
#[derive(Clone, Default)]
pub struct Recorder {
    records: Arc<Mutex<Vec<PanicRecord>>>,
}

impl Recorder {
    pub fn sink(&self) -> Box<dyn PanicSink> {
        let records = self.records.clone();
        make_panic_sink(move |record| records.lock().push(record))
    }

    pub fn records(&self) -> Vec<PanicRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// The rendered native stack of a record, one string per frame
pub fn native_lines(record: &PanicRecord) -> Vec<String> {
    record
        .stack()
        .native
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Upcasts for [`panic_handler::PanicHandler::install`]
pub fn as_runtime(rt: &Arc<SimulatedRuntime>) -> Arc<dyn Runtime> {
    rt.clone()
}
