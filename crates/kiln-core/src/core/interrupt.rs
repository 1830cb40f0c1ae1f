use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

static STATE: LazyLock<InterruptState> = LazyLock::new(InterruptState::default);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Interrupt and terminate flags plus the waiters parked on them.
#[derive(Debug, Default)]
struct InterruptState {
    interrupted: AtomicBool,
    terminate: AtomicBool,
    notify: Notify,
}

impl InterruptState {
    /// Sets the interrupt flag. Returns true if it was already set.
    fn trigger(&self) -> bool {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.notify.notify_waiters();
        false
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    async fn wait_until(&self, flag: impl Fn(&Self) -> bool) {
        loop {
            // Registered before the flag check so a trigger in between is not lost.
            let notified = self.notify.notified();
            if flag(self) {
                return;
            }
            notified.await;
        }
    }
}

/// Installs the Ctrl+C handler.
///
/// The handler only flips the interrupt flag and wakes waiters; the task
/// monitor decides what to cancel. Calling this more than once is a no-op.
///
/// # Errors
/// Returns an error if the handler cannot be registered (for instance when
/// another handler already owns SIGINT).
pub fn init() -> Result<(), ctrlc::Error> {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    ctrlc::set_handler(trigger_ctrl_c).inspect_err(|_| {
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
    })
}

/// Triggers an interrupt via Ctrl+C, force-exiting on a second Ctrl+C.
pub fn trigger_ctrl_c() {
    if STATE.trigger() {
        // Second interrupt before anyone acknowledged the first.
        std::process::exit(130);
    }
}

/// Checks if an interrupt has been requested.
pub fn is_interrupted() -> bool {
    STATE.is_interrupted()
}

/// Marks the process as terminating (SIGTERM or an explicit shutdown).
pub fn request_terminate() {
    STATE.request_terminate();
}

/// Checks if a terminate request was received.
///
/// Unlike `is_interrupted()`, this always means "quit now".
pub fn should_terminate() -> bool {
    STATE.should_terminate()
}

/// Waits until an interrupt is triggered.
pub async fn wait_for_interrupt() {
    STATE.wait_until(InterruptState::is_interrupted).await;
}

/// Waits until termination is requested.
pub async fn wait_for_terminate() {
    STATE.wait_until(InterruptState::should_terminate).await;
}

/// Resets the interrupt flag.
pub fn reset() {
    STATE.reset();
}
