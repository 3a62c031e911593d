//! Subscription handles returned by `subscribe` and `on_ready`

use core::fmt;

type Cancel = Box<dyn FnOnce() + Send>;

/// Handle that removes a registered callback when `unsubscribe` is called
///
/// Dropping the handle leaves the callback registered for the lifetime of
/// its store.
pub struct Subscription {
    cancel: Option<Cancel>,
}

impl Subscription {
    /// Create a handle that runs `cancel` on unsubscribe
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Remove the callback
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
