//! Navigation host for running without a browser.

use std::sync::{Mutex, MutexGuard};

use loyalty_spin::{Location, NavigationHost, Notifier};

/// Keeps the current location in memory and logs prompts and warnings.
#[derive(Debug)]
pub struct HeadlessHost {
    location: Mutex<Location>,
    prompt_installed: Mutex<bool>,
}

impl HeadlessHost {
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            location: Mutex::new(Location::new(start)),
            prompt_installed: Mutex::new(false),
        }
    }

    /// Move to `location` as a router would.
    pub fn navigate(&self, location: Location) {
        tracing::debug!(to = %location, "Headless navigation");
        *lock(&self.location) = location;
    }

    pub fn location(&self) -> Location {
        lock(&self.location).clone()
    }

    pub fn prompt_installed(&self) -> bool {
        *lock(&self.prompt_installed)
    }
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new("/")
    }
}

impl NavigationHost for HeadlessHost {
    fn install_unload_prompt(&self) {
        *lock(&self.prompt_installed) = true;
        tracing::info!("Unload confirmation enabled");
    }

    fn remove_unload_prompt(&self) {
        *lock(&self.prompt_installed) = false;
        tracing::info!("Unload confirmation disabled");
    }

    fn current_location(&self) -> Location {
        self.location()
    }

    fn restore_location(&self, location: &Location) {
        tracing::info!(to = %location, "History navigation undone");
        *lock(&self.location) = location.clone();
    }
}

impl Notifier for HeadlessHost {
    fn warn(&self, message: &str) {
        tracing::warn!(message, "User warning");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
