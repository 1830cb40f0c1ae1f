//! Waits for result files to appear.
//!
//! One `notify` watch per directory is shared by every pending waiter in
//! that directory and dropped when the last waiter resolves. The watch
//! callback runs on notify's own thread and only flips a per-file
//! readiness flag (`watch::Sender<bool>`); waiters observe the flag from
//! whatever runtime they live on.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;

/// Rescan interval guarding against dropped filesystem events.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);
const POLL_MIN: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_millis(500);

type Targets = Arc<Mutex<HashMap<OsString, Target>>>;

struct Target {
    ready: watch::Sender<bool>,
    waiters: usize,
}

struct DirWatch {
    targets: Targets,
    _watcher: RecommendedWatcher,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, cloneable file watcher.
#[derive(Clone, Default)]
pub struct ResultWatcher {
    dirs: Arc<Mutex<HashMap<PathBuf, DirWatch>>>,
}

impl std::fmt::Debug for ResultWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultWatcher")
            .field("watched_dirs", &self.watched_dirs())
            .finish()
    }
}

/// A live interest in one file; deregisters on drop.
struct Registration {
    watcher: ResultWatcher,
    dir: PathBuf,
    name: OsString,
    ready: watch::Receiver<bool>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.watcher.release(&self.dir, &self.name);
    }
}

impl ResultWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of directories currently under watch.
    pub fn watched_dirs(&self) -> usize {
        lock(&self.dirs).len()
    }

    /// Waits until `path` exists.
    ///
    /// Returns true immediately if it already exists, false if `timeout`
    /// elapses first. `None` waits forever.
    pub async fn await_file(&self, path: &Path, timeout: Option<Duration>) -> bool {
        if path.exists() {
            return true;
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let registration = match self.register(path) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "file watch unavailable, polling instead");
                return poll_until(path, deadline).await;
            }
        };
        let mut ready = registration.ready.clone();

        // The file may have landed between the first check and the watch going live.
        loop {
            if path.exists() {
                return true;
            }
            let mut slice = RESCAN_INTERVAL;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return false;
                }
                slice = slice.min(remaining);
            }
            if let Ok(Ok(_)) = tokio::time::timeout(slice, ready.wait_for(|flag| *flag)).await {
                return true;
            }
        }
    }

    /// Blocking variant of [`ResultWatcher::await_file`].
    ///
    /// Inside a multi-threaded tokio runtime the wait runs on that runtime;
    /// a current-thread runtime cannot be re-entered from its own thread, so
    /// the wait moves to a helper thread. Without a runtime a private one is
    /// used.
    pub fn wait_file(&self, path: &Path, timeout: Option<Duration>) -> bool {
        if path.exists() {
            return true;
        }
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.await_file(path, timeout)))
            }
            Ok(_) => std::thread::scope(|scope| {
                scope
                    .spawn(|| self.wait_on_private_runtime(path, timeout))
                    .join()
                    .unwrap_or(false)
            }),
            Err(_) => self.wait_on_private_runtime(path, timeout),
        }
    }

    fn wait_on_private_runtime(&self, path: &Path, timeout: Option<Duration>) -> bool {
        match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime.block_on(self.await_file(path, timeout)),
            Err(e) => {
                tracing::warn!(error = %e, "no runtime for file wait, polling instead");
                poll_blocking(path, timeout.map(|t| Instant::now() + t))
            }
        }
    }

    fn register(&self, path: &Path) -> notify::Result<Registration> {
        let (dir, name) = split_path(path)?;

        let mut dirs = lock(&self.dirs);
        if !dirs.contains_key(&dir) {
            let targets: Targets = Arc::default();
            let mut watcher = notify::recommended_watcher({
                let targets = Arc::clone(&targets);
                move |event: notify::Result<Event>| mark_ready(&targets, event)
            })?;
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            tracing::debug!(dir = %dir.display(), "watching directory");
            dirs.insert(
                dir.clone(),
                DirWatch {
                    targets,
                    _watcher: watcher,
                },
            );
        }

        let Some(dir_watch) = dirs.get(&dir) else {
            return Err(notify::Error::generic("directory watch vanished"));
        };
        let mut targets = lock(&dir_watch.targets);
        let target = targets.entry(name.clone()).or_insert_with(|| Target {
            ready: watch::Sender::new(false),
            waiters: 0,
        });
        target.waiters += 1;
        let ready = target.ready.subscribe();
        drop(targets);
        drop(dirs);

        Ok(Registration {
            watcher: self.clone(),
            dir,
            name,
            ready,
        })
    }

    fn release(&self, dir: &Path, name: &OsStr) {
        let mut dirs = lock(&self.dirs);
        let Some(dir_watch) = dirs.get(dir) else {
            return;
        };
        let now_empty = {
            let mut targets = lock(&dir_watch.targets);
            if let Some(target) = targets.get_mut(name) {
                target.waiters = target.waiters.saturating_sub(1);
                if target.waiters == 0 {
                    targets.remove(name);
                }
            }
            targets.is_empty()
        };
        if now_empty {
            dirs.remove(dir);
            tracing::debug!(dir = %dir.display(), "stopped watching directory");
        }
    }
}

fn mark_ready(targets: &Targets, event: notify::Result<Event>) {
    let Ok(event) = event else {
        return;
    };
    if !(event.kind.is_create() || event.kind.is_modify()) {
        return;
    }
    let targets = lock(targets);
    for path in &event.paths {
        if let Some(name) = path.file_name()
            && let Some(target) = targets.get(name)
            && path.exists()
        {
            target.ready.send_replace(true);
        }
    }
}

/// Splits `path` into a canonical, existing directory and a file name.
fn split_path(path: &Path) -> notify::Result<(PathBuf, OsString)> {
    let name = path
        .file_name()
        .ok_or_else(|| notify::Error::generic("path has no file name"))?
        .to_os_string();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    Ok((parent.canonicalize()?, name))
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(POLL_MAX)
}

async fn poll_until(path: &Path, deadline: Option<Instant>) -> bool {
    let mut delay = POLL_MIN;
    loop {
        if path.exists() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        tokio::time::sleep(delay).await;
        delay = next_backoff(delay);
    }
}

fn poll_blocking(path: &Path, deadline: Option<Instant>) -> bool {
    let mut delay = POLL_MIN;
    loop {
        if path.exists() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        std::thread::sleep(delay);
        delay = next_backoff(delay);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::rpc::write_json_atomic;

    fn write_later(path: PathBuf, delay: Duration) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            write_json_atomic(&path, &json!({"status": "completed"})).unwrap();
        })
    }

    #[tokio::test]
    async fn test_existing_file_returns_without_watching() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("done.result.json");
        fs::write(&path, "{}").unwrap();

        let watcher = ResultWatcher::new();
        assert!(watcher.await_file(&path, Some(Duration::ZERO)).await);
        assert_eq!(watcher.watched_dirs(), 0);
    }

    #[tokio::test]
    async fn test_file_created_later_wakes_waiter() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("later.result.json");
        let watcher = ResultWatcher::new();

        let writer = write_later(path.clone(), Duration::from_millis(100));
        let started = Instant::now();
        assert!(watcher.await_file(&path, Some(Duration::from_secs(10))).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        writer.join().unwrap();
        assert_eq!(watcher.watched_dirs(), 0);
    }

    #[tokio::test]
    async fn test_timeout_returns_false() {
        let temp = TempDir::new().unwrap();
        let watcher = ResultWatcher::new();
        let started = Instant::now();

        let found = watcher
            .await_file(&temp.path().join("never.json"), Some(Duration::from_millis(50)))
            .await;
        assert!(!found);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(watcher.watched_dirs(), 0);
    }

    #[tokio::test]
    async fn test_waiters_in_one_directory_share_a_watch() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("a.result.json");
        let second = temp.path().join("b.result.json");
        let watcher = ResultWatcher::new();

        let writer = {
            let watcher = watcher.clone();
            let (first, second) = (first.clone(), second.clone());
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let shared = watcher.watched_dirs();
                write_json_atomic(&first, &json!(1)).unwrap();
                write_json_atomic(&second, &json!(2)).unwrap();
                shared
            }
        };

        let timeout = Some(Duration::from_secs(10));
        let (a, b, shared) = tokio::join!(
            watcher.await_file(&first, timeout),
            watcher.await_file(&second, timeout),
            writer
        );
        assert!(a && b);
        assert_eq!(shared, 1);
        assert_eq!(watcher.watched_dirs(), 0);
    }

    #[tokio::test]
    async fn test_waiter_creates_missing_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rpc").join("x.result.json");
        let watcher = ResultWatcher::new();

        let writer = write_later(path.clone(), Duration::from_millis(50));
        assert!(watcher.await_file(&path, Some(Duration::from_secs(10))).await);
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_file_without_runtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sync.result.json");
        let writer = write_later(path.clone(), Duration::from_millis(50));

        assert!(ResultWatcher::new().wait_file(&path, Some(Duration::from_secs(10))));
        writer.join().unwrap();
        assert!(!ResultWatcher::new().wait_file(
            &temp.path().join("missing.json"),
            Some(Duration::from_millis(20))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_file_inside_multi_thread_runtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mt.result.json");
        let writer = write_later(path.clone(), Duration::from_millis(50));

        assert!(ResultWatcher::new().wait_file(&path, Some(Duration::from_secs(10))));
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_file_inside_current_thread_runtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ct.result.json");
        let writer = write_later(path.clone(), Duration::from_millis(50));

        assert!(ResultWatcher::new().wait_file(&path, Some(Duration::from_secs(10))));
        writer.join().unwrap();
    }
}
