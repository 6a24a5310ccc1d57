use std::sync::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// A cleanup callback that runs at most once, however many times and from
/// however many tasks it is fired.
pub struct ShutdownHook {
    callback: Mutex<Option<Callback>>,
}

impl ShutdownHook {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// A hook with nothing to run.
    pub fn noop() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    /// Run the callback if it has not run yet. Returns whether this call ran it.
    pub fn fire(&self) -> bool {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl std::fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHook")
            .field("fired", &self.has_fired())
            .finish()
    }
}
