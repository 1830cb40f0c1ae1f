//! Lifecycle hooks.
//!
//! Hooks run synchronously on the scheduler thread, in registration order.
//! A panicking hook is logged and skipped; it never changes the task's status.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use enum_map::{Enum, EnumMap};

use super::model::TaskInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum TaskEvent {
    Create,
    Start,
    Finish,
    Fail,
    Cancel,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Finish => "finish",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

pub type Hook = Arc<dyn Fn(&TaskInfo) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<EnumMap<TaskEvent, Vec<Hook>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(TaskEvent, usize)> = match self.hooks.read() {
            Ok(hooks) => hooks.iter().map(|(event, list)| (event, list.len())).collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    pub fn register(&self, event: TaskEvent, hook: Hook) {
        let mut hooks = self
            .hooks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        hooks[event].push(hook);
    }

    /// Fires every hook registered for `event`.
    pub fn fire(&self, event: TaskEvent, task: &TaskInfo) {
        // Clone the list so hooks may register further hooks without deadlocking.
        let hooks: Vec<Hook> = {
            let guard = self
                .hooks
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard[event].clone()
        };

        for hook in hooks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(task))) {
                tracing::error!(
                    task_id = %task.spec.id,
                    %event,
                    panic = panic_message(panic.as_ref()),
                    "task hook panicked"
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
