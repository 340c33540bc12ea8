//! Integration tests for `NavigationGuard` following a live controller.

use std::sync::{Arc, Mutex};

use loyalty_core::{ManualClock, StateStore};
use loyalty_spin::{
    Location, NavigationDecision, NavigationGuard, NavigationHost, Notifier, SpinLockConfig,
    SpinLockController, UnloadDecision,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// In-memory browser: a current location, an unload prompt flag, and a
/// log of shown warnings.
struct FakeBrowser {
    location: Mutex<Location>,
    prompt_installed: Mutex<bool>,
    restores: Mutex<usize>,
    warnings: Mutex<Vec<String>>,
}

impl FakeBrowser {
    fn at(path: &str) -> Self {
        Self {
            location: Mutex::new(Location::new(path)),
            prompt_installed: Mutex::new(false),
            restores: Mutex::new(0),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// The user pressed back or forward; the location already changed.
    fn history_move(&self, path: &str) {
        *self.location.lock().unwrap() = Location::new(path);
    }

    fn location(&self) -> Location {
        self.location.lock().unwrap().clone()
    }

    fn prompt_installed(&self) -> bool {
        *self.prompt_installed.lock().unwrap()
    }

    fn warning_count(&self) -> usize {
        self.warnings.lock().unwrap().len()
    }
}

impl NavigationHost for FakeBrowser {
    fn install_unload_prompt(&self) {
        *self.prompt_installed.lock().unwrap() = true;
    }

    fn remove_unload_prompt(&self) {
        *self.prompt_installed.lock().unwrap() = false;
    }

    fn current_location(&self) -> Location {
        self.location()
    }

    fn restore_location(&self, location: &Location) {
        *self.restores.lock().unwrap() += 1;
        *self.location.lock().unwrap() = location.clone();
    }
}

impl Notifier for FakeBrowser {
    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }
}

struct Fixture {
    controller: SpinLockController,
    guard: Arc<NavigationGuard>,
    browser: Arc<FakeBrowser>,
}

fn fixture() -> Fixture {
    let (_store, writer) = StateStore::with_lock_writer();
    let controller = SpinLockController::new(
        writer,
        Arc::new(ManualClock::at_epoch()),
        SpinLockConfig::default(),
    );
    let browser = Arc::new(FakeBrowser::at("/roulette"));
    let guard = Arc::new(NavigationGuard::new(
        controller.watch(),
        browser.clone(),
        browser.clone(),
    ));
    Fixture {
        controller,
        guard,
        browser,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition was not reached");
}

async fn spin_started(fx: &Fixture) {
    assert!(fx.controller.acquire_with_reason(8000, "roulette"));
    wait_until(|| fx.browser.prompt_installed()).await;
}

// ---------------------------------------------------------------------------
// Intercept lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unload_prompt_follows_lock_transitions() {
    let fx = fixture();
    let _follow = fx.guard.follow();

    spin_started(&fx).await;
    assert_eq!(fx.guard.before_unload(), UnloadDecision::Confirm);

    fx.controller.release();
    wait_until(|| !fx.browser.prompt_installed()).await;
    assert_eq!(fx.guard.before_unload(), UnloadDecision::Allow);
    assert!(!fx.guard.is_armed());
}

#[tokio::test]
async fn nothing_is_intercepted_after_unlock() {
    let fx = fixture();
    let _follow = fx.guard.follow();
    spin_started(&fx).await;
    fx.controller.release();

    fx.browser.history_move("/coupons");

    assert_eq!(fx.guard.on_history_navigation(), NavigationDecision::Allow);
    assert_eq!(
        fx.guard.request_navigation(&Location::new("/check-ins")),
        NavigationDecision::Allow
    );
    assert_eq!(fx.browser.location(), Location::new("/coupons"));
    assert_eq!(fx.browser.warning_count(), 0);
}

// ---------------------------------------------------------------------------
// History and in-app navigation while locked
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_back_restores_location_and_warns_once() {
    let fx = fixture();
    let _follow = fx.guard.follow();
    spin_started(&fx).await;

    for target in ["/home", "/coupons", "/home"] {
        fx.browser.history_move(target);
        assert_eq!(fx.guard.on_history_navigation(), NavigationDecision::Block);
        assert_eq!(fx.browser.location(), Location::new("/roulette"));
    }

    assert_eq!(*fx.browser.restores.lock().unwrap(), 3);
    assert_eq!(fx.browser.warning_count(), 1);
}

#[tokio::test]
async fn back_press_right_after_acquire_restores_spin_location() {
    let fx = fixture();
    fx.controller.observe(fx.guard.clone());
    let _follow = fx.guard.follow();

    // No yield between acquire and the history move: the follower task
    // has not run yet.
    assert!(fx.controller.acquire(8000));
    fx.browser.history_move("/home");

    assert_eq!(fx.guard.on_history_navigation(), NavigationDecision::Block);
    assert_eq!(fx.browser.location(), Location::new("/roulette"));
    assert!(fx.browser.prompt_installed());
}

#[tokio::test]
async fn observed_guard_and_follower_arm_once() {
    let fx = fixture();
    fx.controller.observe(fx.guard.clone());
    let _follow = fx.guard.follow();

    spin_started(&fx).await;
    tokio::task::yield_now().await;
    fx.browser.history_move("/home");
    fx.guard.on_history_navigation();

    assert_eq!(fx.browser.location(), Location::new("/roulette"));
    fx.controller.release();
    assert!(!fx.browser.prompt_installed());
    assert!(!fx.guard.is_armed());
}

#[tokio::test]
async fn in_app_navigation_shares_the_episode_warning() {
    let fx = fixture();
    let _follow = fx.guard.follow();
    spin_started(&fx).await;

    assert_eq!(
        fx.guard.request_navigation(&Location::new("/coupons")),
        NavigationDecision::Block
    );
    fx.browser.history_move("/home");
    fx.guard.on_history_navigation();
    fx.guard.request_navigation(&Location::new("/profile"));

    assert_eq!(fx.browser.warning_count(), 1);
}

#[tokio::test]
async fn warning_flag_resets_for_next_episode() {
    let fx = fixture();
    let _follow = fx.guard.follow();

    spin_started(&fx).await;
    fx.guard.request_navigation(&Location::new("/home"));
    fx.controller.release();
    wait_until(|| !fx.browser.prompt_installed()).await;

    spin_started(&fx).await;
    fx.guard.request_navigation(&Location::new("/home"));

    assert_eq!(fx.browser.warning_count(), 2);
}
