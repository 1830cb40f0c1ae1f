//! Session identity shared between the host process and its sandbox.

use uuid::Uuid;

/// Carries the session id into the sandbox.
pub const SESSION_ENV: &str = "KILN_SESSION_ID";
/// Set inside the sandbox container.
pub const SANDBOX_MARKER_ENV: &str = "KILN_IN_SANDBOX";

/// Generates a short opaque session token (8 hex chars).
pub fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Returns the inherited session id, or a fresh one.
pub fn current_session_id() -> String {
    std::env::var(SESSION_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(new_session_id)
}

/// True when running inside a kiln sandbox container.
pub fn in_sandbox() -> bool {
    std::env::var_os(SANDBOX_MARKER_ENV).is_some()
}
