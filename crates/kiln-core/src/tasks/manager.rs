//! Bounded-concurrency task engine.
//!
//! A `TaskManager` owns one background thread hosting a current-thread tokio
//! runtime. Callers on any thread hand work to it through the runtime
//! handle; results come back through a per-task `watch` channel, so the
//! scheduler never touches caller state and callers never touch task state.
//!
//! Ordering per task: spec persisted -> `create` -> permit acquired ->
//! `start` -> work -> result persisted -> `finish|fail|cancel` -> waiters wake.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::hooks::{HookRegistry, TaskEvent, panic_message};
use super::model::{TaskInfo, TaskResult, TaskSpec, TaskStatus, TaskStore};
use crate::core::interrupt;

/// How long shutdown waits for cancelled tasks to record their results.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A deferred unit of work.
pub enum Work {
    /// Natively asynchronous work, polled on the scheduler thread.
    Async(Box<dyn FnOnce() -> BoxFuture<'static, Result<Value>> + Send>),
    /// CPU-bound or blocking work, run on the worker pool.
    Blocking(Box<dyn FnOnce() -> Result<Value> + Send>),
}

impl Work {
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::Async(Box::new(move || f().boxed()))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        Self::Blocking(Box::new(f))
    }

    /// Runs the work while holding `permit`. Async work gives it back when
    /// its future ends or is dropped; blocking work only when the closure
    /// returns, since cancelling the caller cannot stop the worker thread.
    async fn run(self, permit: OwnedSemaphorePermit) -> Result<Value> {
        match self {
            Work::Async(factory) => {
                let _permit = permit;
                AssertUnwindSafe(async move { factory().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(anyhow!("task panicked: {}", panic_message(panic.as_ref())))
                    })
            }
            Work::Blocking(f) => match tokio::task::spawn_blocking(move || {
                let _permit = permit;
                f()
            })
            .await
            {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let panic = e.into_panic();
                    Err(anyhow!("task panicked: {}", panic_message(panic.as_ref())))
                }
                Err(e) => Err(anyhow!("worker stopped before finishing: {e}")),
            },
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Async(_) => f.write_str("Work::Async"),
            Work::Blocking(_) => f.write_str("Work::Blocking"),
        }
    }
}

struct TaskSlot {
    cancel: CancellationToken,
    state: watch::Sender<TaskInfo>,
}

impl TaskSlot {
    fn snapshot(&self) -> TaskInfo {
        self.state.borrow().clone()
    }
}

struct Shared {
    store: TaskStore,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, Arc<TaskSlot>>>,
    hooks: HookRegistry,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskSlot>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_all(&self) -> usize {
        let slots: Vec<Arc<TaskSlot>> = self.tasks().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| !slot.state.borrow().status.is_terminal())
            .inspect(|slot| slot.cancel.cancel())
            .count()
    }

    fn mark_running(&self, slot: &TaskSlot) -> TaskInfo {
        slot.state.send_modify(|info| {
            info.status = TaskStatus::Running;
            info.spec.start_time = Some(Utc::now());
        });
        slot.snapshot()
    }

    /// Records the terminal state, then wakes waiters.
    fn finish(&self, slot: &TaskSlot, result: TaskResult) {
        let mut info = slot.snapshot();
        info.spec.end_time = Some(Utc::now());
        info.status = result.status;

        if let Err(e) = self.store.save_spec(&info.spec) {
            tracing::error!(task_id = %info.spec.id, error = %format!("{e:#}"), "failed to persist task spec");
        }
        if let Err(e) = self.store.save_result(&info.spec, &result) {
            tracing::error!(task_id = %info.spec.id, error = %format!("{e:#}"), "failed to persist task result");
        }
        info.result = Some(result);

        let event = match info.status {
            TaskStatus::Completed => TaskEvent::Finish,
            TaskStatus::Failed => TaskEvent::Fail,
            _ => TaskEvent::Cancel,
        };
        tracing::info!(
            task_id = %info.spec.id,
            name = %info.spec.name,
            status = %info.status,
            "task finished"
        );
        self.hooks.fire(event, &info);
        slot.state.send_replace(info);
    }
}

async fn run_task(shared: Arc<Shared>, slot: Arc<TaskSlot>, work: Work) {
    let permit = tokio::select! {
        biased;
        () = slot.cancel.cancelled() => None,
        permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
    };
    let Some(permit) = permit else {
        shared.finish(&slot, TaskResult::cancelled());
        return;
    };

    let running = shared.mark_running(&slot);
    tracing::debug!(task_id = %running.spec.id, name = %running.spec.name, "task started");
    shared.hooks.fire(TaskEvent::Start, &running);

    let result = tokio::select! {
        biased;
        () = slot.cancel.cancelled() => TaskResult::cancelled(),
        // A cancelled async future drops its permit here; `finish` publishes the
        // terminal state before the scheduler thread can hand the permit on.
        outcome = work.run(permit) => match outcome {
            Ok(output) => TaskResult::completed(output),
            Err(e) => TaskResult::failed(format!("{e:#}")),
        },
    };
    shared.finish(&slot, result);
}

#[cfg(unix)]
type TerminateSignal = tokio::signal::unix::Signal;
#[cfg(not(unix))]
type TerminateSignal = ();

#[cfg(unix)]
fn terminate_signal() -> Option<TerminateSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    signal(SignalKind::terminate())
        .inspect_err(|e| tracing::debug!(error = %e, "SIGTERM handler not installed"))
        .ok()
}

#[cfg(not(unix))]
fn terminate_signal() -> Option<TerminateSignal> {
    None
}

async fn recv_terminate(signal: &mut Option<TerminateSignal>) {
    #[cfg(unix)]
    if let Some(signal) = signal
        && signal.recv().await.is_some()
    {
        return;
    }
    #[cfg(not(unix))]
    let _ = signal;
    std::future::pending::<()>().await;
}

/// Watches for shutdown and signals; cancels outstanding work on the way out.
async fn monitor(shared: Arc<Shared>, shutdown: CancellationToken, tracker: TaskTracker) {
    let mut terminate = terminate_signal();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = interrupt::wait_for_interrupt() => {
                let cancelled = shared.cancel_all();
                tracing::info!(cancelled, "interrupt received, cancelling outstanding tasks");
                interrupt::reset();
            }
            () = recv_terminate(&mut terminate) => {
                tracing::info!("terminate signal received, stopping task scheduler");
                interrupt::request_terminate();
                break;
            }
        }
    }

    let cancelled = shared.cancel_all();
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!(cancelled, "tasks still running at scheduler shutdown");
    }
}

struct Scheduler {
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

/// Runs deferred work with bounded parallelism on a dedicated thread.
pub struct TaskManager {
    shared: Arc<Shared>,
    max_concurrency: usize,
    scheduler: Mutex<Option<Scheduler>>,
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("store", &self.shared.store)
            .field("max_concurrency", &self.max_concurrency)
            .field("tasks", &self.shared.tasks().len())
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    /// Creates a manager persisting into `store`. Nothing runs until
    /// [`TaskManager::initialize`] or the first [`TaskManager::create_task`].
    pub fn new(store: TaskStore, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            shared: Arc::new(Shared {
                store,
                permits: Arc::new(Semaphore::new(max_concurrency)),
                tasks: Mutex::new(HashMap::new()),
                hooks: HookRegistry::default(),
            }),
            max_concurrency,
            scheduler: Mutex::new(None),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn store(&self) -> &TaskStore {
        &self.shared.store
    }

    fn scheduler(&self) -> MutexGuard<'_, Option<Scheduler>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the background scheduler thread. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn initialize(&self) -> Result<()> {
        let mut scheduler = self.scheduler();
        if scheduler.is_none() {
            *scheduler = Some(self.spawn_scheduler()?);
        }
        Ok(())
    }

    fn spawn_scheduler(&self) -> Result<Scheduler> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let workers = self.max_concurrency;

        let thread = std::thread::Builder::new()
            .name("kiln-tasks".to_string())
            .spawn({
                let shared = Arc::clone(&self.shared);
                let shutdown = shutdown.clone();
                let tracker = tracker.clone();
                move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .max_blocking_threads(workers)
                        .thread_name("kiln-task-worker")
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(runtime.handle().clone()));
                    runtime.block_on(monitor(shared, shutdown, tracker));
                    runtime.shutdown_timeout(SHUTDOWN_GRACE);
                }
            })
            .context("spawn task scheduler thread")?;

        let handle = ready_rx
            .recv()
            .context("task scheduler exited during startup")?
            .context("build task scheduler runtime")?;

        if let Err(e) = interrupt::init() {
            tracing::debug!(error = %e, "Ctrl+C handler not installed");
        }
        tracing::debug!(workers, "task scheduler started");

        Ok(Scheduler {
            handle,
            tracker,
            shutdown,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Persists a spec for `work` and schedules it. Returns the task id
    /// immediately.
    ///
    /// # Errors
    /// Returns an error if the scheduler cannot start or the task spec cannot be
    /// persisted; in both cases nothing is scheduled.
    pub fn create_task(&self, name: impl Into<String>, work: Work, input: Value) -> Result<String> {
        let (handle, tracker) = {
            self.initialize()?;
            let scheduler = self.scheduler();
            let scheduler = scheduler
                .as_ref()
                .context("task scheduler is shut down")?;
            (scheduler.handle.clone(), scheduler.tracker.clone())
        };

        let spec = TaskSpec::new(name, input);
        self.shared.store.save_spec(&spec)?;

        let info = TaskInfo {
            spec,
            status: TaskStatus::Pending,
            result: None,
        };
        let id = info.spec.id.clone();
        let slot = Arc::new(TaskSlot {
            cancel: CancellationToken::new(),
            state: watch::Sender::new(info.clone()),
        });
        self.shared.tasks().insert(id.clone(), Arc::clone(&slot));

        tracing::debug!(task_id = %id, name = %info.spec.name, "task created");
        self.shared.hooks.fire(TaskEvent::Create, &info);

        handle.spawn(tracker.track_future(run_task(Arc::clone(&self.shared), slot, work)));
        Ok(id)
    }

    fn slot(&self, id: &str) -> Option<Arc<TaskSlot>> {
        self.shared.tasks().get(id).cloned()
    }

    /// Waits for the task's terminal result.
    ///
    /// Suspends only the calling future. Returns `None` for an unknown id or
    /// when `timeout` elapses first; the task itself keeps running.
    pub async fn wait_for_result(&self, id: &str, timeout: Option<Duration>) -> Option<TaskResult> {
        let Some(slot) = self.slot(id) else {
            tracing::warn!(task_id = id, "wait requested for unknown task");
            return None;
        };
        let mut rx = slot.state.subscribe();
        drop(slot);

        let wait = async move {
            rx.wait_for(|info| info.status.is_terminal())
                .await
                .ok()
                .and_then(|info| info.result.clone())
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    /// Requests cooperative cancellation. Returns false for unknown or
    /// already finished tasks.
    pub fn cancel_task(&self, id: &str) -> bool {
        let Some(slot) = self.slot(id) else {
            tracing::warn!(task_id = id, "cancel requested for unknown task");
            return false;
        };
        if slot.state.borrow().status.is_terminal() {
            return false;
        }
        slot.cancel.cancel();
        tracing::debug!(task_id = id, "task cancellation requested");
        true
    }

    /// Requests cancellation of every outstanding task; returns how many.
    pub fn cancel_all(&self) -> usize {
        self.shared.cancel_all()
    }

    /// Registers a lifecycle hook.
    pub fn on<F>(&self, event: TaskEvent, hook: F)
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.shared.hooks.register(event, Arc::new(hook));
    }

    /// Snapshots of all tasks seen by this manager, newest first.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .shared
            .tasks()
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        tasks.sort_by(|a, b| b.spec.start_time.cmp(&a.spec.start_time));
        tasks
    }

    pub fn get_task(&self, id: &str) -> Option<TaskInfo> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    /// Finds a task by id prefix; `None` when missing or ambiguous.
    pub fn find_task(&self, prefix: &str) -> Option<TaskInfo> {
        let tasks = self.shared.tasks();
        let mut matches = tasks
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, slot)| slot);
        let first = matches.next()?;
        matches.next().is_none().then(|| first.snapshot())
    }

    /// Cancels outstanding work and stops the scheduler thread.
    pub fn shutdown(&self) {
        let Some(mut scheduler) = self.scheduler().take() else {
            return;
        };
        scheduler.shutdown.cancel();
        if std::thread::current().id() == scheduler.thread_id {
            return;
        }
        if let Some(thread) = scheduler.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("task scheduler thread panicked");
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::tools::ToolContext;
    use crate::tools::shell;

    fn manager(temp: &TempDir, max: usize) -> TaskManager {
        TaskManager::new(TaskStore::new(temp.path().join("tasks")), max)
    }

    fn sleep_work(duration: Duration) -> Work {
        Work::future(move || async move {
            tokio::time::sleep(duration).await;
            Ok(json!("slept"))
        })
    }

    #[tokio::test]
    async fn test_shell_task_completes_with_output() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 2);
        let ctx = ToolContext::new(temp.path().to_path_buf(), None);
        let input = json!({"command": "echo hi"});

        let id = tasks
            .create_task(
                "echo",
                Work::future({
                    let input = input.clone();
                    move || async move { shell::execute(&input, &ctx, None).await.into_result() }
                }),
                input,
            )
            .unwrap();

        let result = tasks.wait_for_result(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert!(result.output.unwrap().to_string().contains("hi"));

        let info = tasks.get_task(&id).unwrap();
        let on_disk = tasks.store().load_result(&info.spec).unwrap().unwrap();
        assert_eq!(on_disk.status, TaskStatus::Completed);
        let spec = tasks.store().load_spec(&id).unwrap();
        assert!(spec.end_time.is_some());
    }

    #[tokio::test]
    async fn test_spec_is_persisted_before_work_runs() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let store = tasks.store().clone();
        let (id_tx, id_rx) = std::sync::mpsc::channel::<String>();

        let id = tasks
            .create_task(
                "check-spec",
                Work::blocking(move || {
                    let id = id_rx.recv()?;
                    Ok(json!(store.spec_path(&id).exists()))
                }),
                json!(null),
            )
            .unwrap();
        id_tx.send(id.clone()).unwrap();

        let result = tasks.wait_for_result(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.output, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task_returns_none() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        assert!(tasks.wait_for_result("does-not-exist", None).await.is_none());
        assert!(!tasks.cancel_task("does-not-exist"));
    }

    #[tokio::test]
    async fn test_wait_timeout_does_not_affect_task() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let id = tasks
            .create_task("sleep", sleep_work(Duration::from_secs(1)), json!(null))
            .unwrap();

        let started = Instant::now();
        let early = tasks.wait_for_result(&id, Some(Duration::from_millis(10))).await;
        assert!(early.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));

        let result = tasks.wait_for_result(&id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_running_tasks_never_exceed_bound() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ids: Vec<String> = (0..6)
            .map(|n| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tasks
                    .create_task(
                        format!("job-{n}"),
                        Work::future(move || async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(json!(n))
                        }),
                        json!(n),
                    )
                    .unwrap()
            })
            .collect();

        for id in &ids {
            let result = tasks.wait_for_result(id, Some(Duration::from_secs(10))).await.unwrap();
            assert_eq!(result.status, TaskStatus::Completed);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_running_status_is_bounded_while_queued() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let first = tasks
            .create_task("first", sleep_work(Duration::from_millis(300)), json!(null))
            .unwrap();
        let second = tasks
            .create_task("second", sleep_work(Duration::from_millis(10)), json!(null))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = tasks
            .list_tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        assert_eq!(running, 1);
        assert_eq!(tasks.get_task(&second).unwrap().status, TaskStatus::Pending);

        tasks.wait_for_result(&first, None).await.unwrap();
        let result = tasks.wait_for_result(&second, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_time_marks_when_work_begins() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let first = tasks
            .create_task("first", sleep_work(Duration::from_millis(200)), json!(null))
            .unwrap();
        let second = tasks
            .create_task("second", sleep_work(Duration::from_millis(10)), json!(null))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tasks.get_task(&first).unwrap().spec.start_time.is_some());
        let queued = tasks.get_task(&second).unwrap();
        assert_eq!(queued.status, TaskStatus::Pending);
        assert!(queued.spec.start_time.is_none());
        assert!(tasks.store().load_spec(&second).unwrap().start_time.is_none());

        tasks.wait_for_result(&second, Some(Duration::from_secs(10))).await.unwrap();
        let first = tasks.get_task(&first).unwrap();
        let second = tasks.get_task(&second).unwrap();
        assert!(second.spec.start_time.unwrap() >= first.spec.end_time.unwrap());
        assert!(second.duration().unwrap() < chrono::Duration::milliseconds(150));
    }

    #[tokio::test]
    async fn test_cancelled_blocking_work_keeps_its_slot_until_it_returns() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let done = Arc::new(AtomicBool::new(false));

        let stuck = {
            let done = Arc::clone(&done);
            tasks
                .create_task(
                    "stuck",
                    Work::blocking(move || {
                        std::thread::sleep(Duration::from_millis(300));
                        done.store(true, Ordering::SeqCst);
                        Ok(Value::Null)
                    }),
                    json!(null),
                )
                .unwrap()
        };
        while tasks.get_task(&stuck).unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(tasks.cancel_task(&stuck));
        let result = tasks.wait_for_result(&stuck, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);

        let next = {
            let done = Arc::clone(&done);
            tasks
                .create_task(
                    "next",
                    Work::future(move || async move { Ok(json!(done.load(Ordering::SeqCst))) }),
                    json!(null),
                )
                .unwrap()
        };
        let result = tasks.wait_for_result(&next, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.output, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_failed_results() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 2);

        let err = tasks
            .create_task(
                "err",
                Work::future(|| async { Err(anyhow!("work exploded")) }),
                json!(null),
            )
            .unwrap();
        let panicked = tasks
            .create_task(
                "panic",
                Work::blocking(|| panic!("worker blew up")),
                json!(null),
            )
            .unwrap();

        let result = tasks.wait_for_result(&err, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("work exploded"));

        let result = tasks
            .wait_for_result(&panicked, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.unwrap().contains("worker blew up"));
    }

    #[tokio::test]
    async fn test_blocking_work_returns_value() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let id = tasks
            .create_task("sum", Work::blocking(|| Ok(json!((1..=10).sum::<u32>()))), json!(null))
            .unwrap();
        let result = tasks.wait_for_result(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.output, Some(json!(55)));
    }

    #[tokio::test]
    async fn test_cancel_running_task_fires_hooks_in_order() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let events = Arc::new(Mutex::new(Vec::new()));
        for event in [
            TaskEvent::Create,
            TaskEvent::Start,
            TaskEvent::Finish,
            TaskEvent::Fail,
            TaskEvent::Cancel,
        ] {
            let events = Arc::clone(&events);
            tasks.on(event, move |_| events.lock().unwrap().push(event));
        }

        let id = tasks
            .create_task("long", sleep_work(Duration::from_secs(30)), json!(null))
            .unwrap();
        while tasks.get_task(&id).unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(tasks.cancel_task(&id));

        let result = tasks.wait_for_result(&id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(
            *events.lock().unwrap(),
            vec![TaskEvent::Create, TaskEvent::Start, TaskEvent::Cancel]
        );
        assert!(!tasks.cancel_task(&id));
    }

    #[tokio::test]
    async fn test_cancel_queued_task_never_starts() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let starts = Arc::new(AtomicUsize::new(0));
        {
            let starts = Arc::clone(&starts);
            tasks.on(TaskEvent::Start, move |_| {
                starts.fetch_add(1, Ordering::SeqCst);
            });
        }

        let blocker = tasks
            .create_task("blocker", sleep_work(Duration::from_millis(200)), json!(null))
            .unwrap();
        let queued = tasks
            .create_task("queued", sleep_work(Duration::from_millis(10)), json!(null))
            .unwrap();
        assert!(tasks.cancel_task(&queued));

        let result = tasks.wait_for_result(&queued, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        tasks.wait_for_result(&blocker, None).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_hook_does_not_change_status() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        tasks.on(TaskEvent::Finish, |_| panic!("bad hook"));

        let id = tasks
            .create_task("ok", Work::future(|| async { Ok(json!(1)) }), json!(null))
            .unwrap();
        let result = tasks.wait_for_result(&id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_every_task_gets_one_result_file() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 3);
        let ids: Vec<String> = (0..5)
            .map(|n| {
                let work = if n % 2 == 0 {
                    Work::future(move || async move { Ok(json!(n)) })
                } else {
                    Work::future(|| async { Err(anyhow!("odd")) })
                };
                tasks.create_task("mixed", work, json!(n)).unwrap()
            })
            .collect();

        for id in &ids {
            let result = tasks.wait_for_result(id, Some(Duration::from_secs(5))).await.unwrap();
            assert!(result.status.is_terminal());
            let spec = tasks.store().load_spec(id).unwrap();
            assert_eq!(
                tasks.store().load_result(&spec).unwrap().unwrap().status,
                result.status
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_all_and_shutdown() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 2);
        tasks.initialize().unwrap();
        tasks.initialize().unwrap();

        let ids: Vec<String> = (0..3)
            .map(|_| {
                tasks
                    .create_task("long", sleep_work(Duration::from_secs(30)), json!(null))
                    .unwrap()
            })
            .collect();
        assert_eq!(tasks.cancel_all(), 3);
        for id in &ids {
            let result = tasks.wait_for_result(id, Some(Duration::from_secs(5))).await.unwrap();
            assert_eq!(result.status, TaskStatus::Cancelled);
        }

        tasks.shutdown();
        tasks.shutdown();
    }

    #[tokio::test]
    async fn test_list_and_find_tasks() {
        let temp = TempDir::new().unwrap();
        let tasks = manager(&temp, 1);
        let id = tasks
            .create_task("one", Work::future(|| async { Ok(json!(1)) }), json!(null))
            .unwrap();
        tasks.wait_for_result(&id, None).await.unwrap();

        assert_eq!(tasks.list_tasks().len(), 1);
        assert_eq!(tasks.find_task(&id[..6]).unwrap().spec.id, id);
        assert!(tasks.find_task("zzzz").is_none());
        assert!(tasks.list_tasks()[0].duration().is_some());
    }
}
