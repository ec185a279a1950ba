//! Bookkeeping of the threads that are currently inside a risky operation.
//!
//! Each thread owns a stack of suppression windows, the innermost one being
//! the window of the most deeply nested risky operation. Only the owning
//! thread opens and closes its windows, but the origin bridge resolves them
//! from within intercepted calls, so every operation is a single critical
//! section over the whole map.

use crate::runtime::ThreadId;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// An exception raised by a managed runtime layered on top of the process,
/// captured while a risky operation was in flight
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedException {
    /// The runtime the exception originated from, eg. "Objective-C"
    pub origin: String,
    /// The description of the thrown object
    pub description: String,
}

impl std::fmt::Display for CapturedException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for CapturedException {}

/// Identifies a single suppression window opened with
/// [`SuppressionRegistry::begin`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WindowToken {
    thread_id: ThreadId,
    id: u64,
}

impl WindowToken {
    /// The thread that opened the window
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

/// A snapshot of the innermost window of a thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suppression {
    pub token: WindowToken,
    pub captured: Option<CapturedException>,
}

struct Window {
    id: u64,
    captured: Option<CapturedException>,
}

/// Thread keyed store of the suppression windows of in flight risky
/// operations
#[derive(Default)]
pub struct SuppressionRegistry {
    windows: Mutex<HashMap<ThreadId, Vec<Window>>>,
    next_id: AtomicU64,
}

impl SuppressionRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new window for the thread, nested inside any window the
    /// thread already has open
    pub fn begin(&self, thread_id: ThreadId) -> WindowToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.windows
            .lock()
            .entry(thread_id)
            .or_default()
            .push(Window { id, captured: None });

        WindowToken { thread_id, id }
    }

    /// Retrieves the innermost window of the thread, if it has one open
    pub fn lookup(&self, thread_id: ThreadId) -> Option<Suppression> {
        let windows = self.windows.lock();
        let window = windows.get(&thread_id)?.last()?;

        Some(Suppression {
            token: WindowToken {
                thread_id,
                id: window.id,
            },
            captured: window.captured.clone(),
        })
    }

    /// Hands an exception to the innermost window of the thread.
    ///
    /// Returns `false` if the thread has no open window, ie. nobody is waiting
    /// on the exception and it needs to be treated as a panic instead. A
    /// window only ever keeps the first exception it was handed.
    pub fn resolve(&self, thread_id: ThreadId, exception: CapturedException) -> bool {
        let mut windows = self.windows.lock();

        let Some(window) = windows.get_mut(&thread_id).and_then(|stack| stack.last_mut()) else {
            return false;
        };

        if window.captured.is_none() {
            window.captured = Some(exception);
        } else {
            log::debug!(
                "thread {thread_id} already captured an exception, dropping '{}'",
                exception.description
            );
        }

        true
    }

    /// Closes the window, returning the exception it captured, if any.
    ///
    /// Closing a window that is already closed is a no-op.
    pub fn end(&self, token: WindowToken) -> Option<CapturedException> {
        let mut windows = self.windows.lock();

        let stack = windows.get_mut(&token.thread_id)?;
        let index = stack.iter().rposition(|window| window.id == token.id)?;
        let window = stack.remove(index);

        if stack.is_empty() {
            windows.remove(&token.thread_id);
        }

        window.captured
    }

    /// Opens a window that is closed when the returned guard is dropped
    #[inline]
    pub fn guard(&self, thread_id: ThreadId) -> SuppressionGuard<'_> {
        SuppressionGuard {
            registry: self,
            token: Some(self.begin(thread_id)),
        }
    }

    /// The number of windows the thread currently has open
    pub fn active_windows(&self, thread_id: ThreadId) -> usize {
        self.windows.lock().get(&thread_id).map_or(0, Vec::len)
    }

    /// True if no thread has a window open
    pub fn is_empty(&self) -> bool {
        self.windows.lock().is_empty()
    }
}

/// Scoped suppression window, closed on every exit path, including unwinding
pub struct SuppressionGuard<'reg> {
    registry: &'reg SuppressionRegistry,
    token: Option<WindowToken>,
}

impl SuppressionGuard<'_> {
    /// The window this guard keeps open
    #[inline]
    pub fn token(&self) -> Option<WindowToken> {
        self.token
    }

    /// Closes the window, returning the exception it captured, if any
    pub fn finish(mut self) -> Option<CapturedException> {
        self.token.take().and_then(|token| self.registry.end(token))
    }
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.registry.end(token);
        }
    }
}
