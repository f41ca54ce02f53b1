//! # Cursor Notification
//!
//! Open cursors hold locators, not pointers, so a page can be freed while
//! a cursor still points at it. Before a bucket is returned to the
//! allocator, the engine publishes the locator through the registry; each
//! listener (typically a cursor) checks whether it is positioned on that
//! bucket and repositions itself before the page dies.
//!
//! Listeners are held weakly: a dropped cursor unregisters itself by
//! going away, and dead entries are pruned on the next notification.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::storage::Locator;

/// Implemented by anything that must observe bucket deallocation.
pub trait BucketDeletionListener: Send + Sync {
    fn about_to_delete_bucket(&self, loc: Locator);
}

#[derive(Default)]
pub struct CursorRegistry {
    listeners: Mutex<Vec<Weak<dyn BucketDeletionListener>>>,
}

impl CursorRegistry {
    pub fn new() -> CursorRegistry {
        CursorRegistry::default()
    }

    pub fn register(&self, listener: &Arc<dyn BucketDeletionListener>) {
        self.listeners.lock().push(Arc::downgrade(listener));
    }

    /// Notify every live listener that `loc` is about to be deallocated.
    pub fn inform_about_to_delete_bucket(&self, loc: Locator) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                listener.about_to_delete_bucket(loc);
                true
            }
            None => false,
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
