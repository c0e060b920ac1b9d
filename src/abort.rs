use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use crate::types::RequestId;

/// One-shot cancellation callback registered by an adapter once its
/// backend call has started.
pub struct AbortHandle(Box<dyn FnOnce() + Send>);

impl AbortHandle {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Run the handle. Panics raised by it are swallowed: closing an already
    /// closed stream is allowed to fail.
    pub fn invoke(self) {
        if catch_unwind(AssertUnwindSafe(self.0)).is_err() {
            tracing::debug!("abort handle panicked; ignoring");
        }
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}

/// `id -> abort handle` table shared by all in-flight requests.
///
/// Internally synchronized; callers never see the lock. A handle is moved
/// out of the table before it runs, so it fires at most once no matter how
/// `invoke` and `remove` interleave.
#[derive(Default)]
pub struct AbortRegistry {
    handles: Mutex<HashMap<RequestId, AbortHandle>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the handle for `id`, replacing (and dropping) any earlier one.
    pub fn register(&self, id: RequestId, handle: AbortHandle) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if handles.insert(id.clone(), handle).is_some() {
            tracing::debug!(request_id = %id, "replaced abort handle");
        }
    }

    /// Run and remove the handle for `id`. No-op when absent.
    pub fn invoke(&self, id: &RequestId) {
        let handle = self.take(id);
        if let Some(handle) = handle {
            handle.invoke();
        }
    }

    /// Drop the handle for `id` without running it. No-op when absent.
    pub fn remove(&self, id: &RequestId) {
        drop(self.take(id));
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The lock is released before the handle runs.
    fn take(&self, id: &RequestId) -> Option<AbortHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }
}
