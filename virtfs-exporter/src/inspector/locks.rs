//! In-process exclusion over disk image locations.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Set of disk locations currently opened by a sandbox.
#[derive(Debug, Default)]
pub struct ImageLocks {
    held: Mutex<HashSet<String>>,
}

impl ImageLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire every location or none of them.
    ///
    /// Returns `None` if any location is already held.
    pub fn try_acquire<'a, I>(self: &Arc<Self>, locations: I) -> Option<ImageLockGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: Vec<String> = locations.into_iter().map(str::to_string).collect();
        let mut held = self.held.lock();
        if wanted.iter().any(|loc| held.contains(loc)) {
            return None;
        }
        held.extend(wanted.iter().cloned());
        Some(ImageLockGuard {
            locks: Arc::clone(self),
            locations: wanted,
        })
    }

    pub fn is_held(&self, location: &str) -> bool {
        self.held.lock().contains(location)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Releases its locations on drop.
#[derive(Debug)]
pub struct ImageLockGuard {
    locks: Arc<ImageLocks>,
    locations: Vec<String>,
}

impl Drop for ImageLockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for loc in &self.locations {
            held.remove(loc);
        }
    }
}
