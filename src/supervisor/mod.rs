//! Proxy process supervisor
//!
//! Owns at most one running child per proxy chain. Children are spawned from
//! the chain's config file, their output is re-logged line by line under a
//! `[xray-<name>]` tag, and a short settle window after the spawn decides
//! between "crashed immediately" (the start call fails) and "running" (the
//! start call succeeds and the waiter keeps watching). The settle window is
//! a pragmatic heuristic and tunable.
//!
//! All start/stop transitions for all chains are serialized by one async
//! lock, held across the settle window; the waiter task signals exit first
//! and then re-acquires the lock to drop its map entry.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use crate::error::SupervisorError;
use crate::outbound::OutboundStore;

/// Default settle window after a spawn
pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(3);

/// How long a restart waits for the old entry to disappear
const RESTART_WAIT: Duration = Duration::from_secs(3);
const RESTART_POLL: Duration = Duration::from_millis(50);

/// Handle to one running child
struct ChildHandle {
    cancel: oneshot::Sender<()>,
}

/// The proxy process supervisor
pub struct ProxySupervisor {
    store: Arc<OutboundStore>,
    program: String,
    settle: Duration,
    children: Arc<Mutex<HashMap<String, ChildHandle>>>,
}

impl ProxySupervisor {
    /// Create a supervisor spawning the default `xray` binary
    #[must_use]
    pub fn new(store: Arc<OutboundStore>) -> Self {
        Self::with_program(store, "xray", DEFAULT_SETTLE_WINDOW)
    }

    /// Create a supervisor with an explicit program and settle window
    #[must_use]
    pub fn with_program(
        store: Arc<OutboundStore>,
        program: impl Into<String>,
        settle: Duration,
    ) -> Self {
        Self {
            store,
            program: program.into(),
            settle,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the child for a chain
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when the chain has a live child, `ConfigMissing`
    /// when its config file is gone, `ExitedEarly` when the child dies
    /// within the settle window.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        let mut children = self.children.lock().await;
        if children.contains_key(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        self.start_locked(&mut children, name).await
    }

    /// Stop the child for a chain
    ///
    /// # Errors
    ///
    /// `NotRunning` when no child is tracked for the name.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let mut children = self.children.lock().await;
        let Some(handle) = children.remove(name) else {
            return Err(SupervisorError::NotRunning(name.to_string()));
        };
        let _ = handle.cancel.send(());
        info!("proxy chain stopped: {name}");
        Ok(())
    }

    /// Stop, wait (bounded) for the old child to clear, start again
    pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        self.stop(name).await?;
        let deadline = tokio::time::Instant::now() + RESTART_WAIT;
        while self.is_running(name).await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(RESTART_POLL).await;
        }
        self.start(name).await
    }

    /// Snapshot query: does the chain have a tracked child right now
    pub async fn is_running(&self, name: &str) -> bool {
        self.children.lock().await.contains_key(name)
    }

    /// Start every chain the lister yields that is not already running
    ///
    /// Continues past individual failures and reports them as one aggregate
    /// error at the end.
    pub async fn start_all<F>(&self, lister: F) -> Result<(), SupervisorError>
    where
        F: FnOnce() -> Result<Vec<String>, SupervisorError>,
    {
        let mut children = self.children.lock().await;
        let names = lister()?;

        let mut failures = Vec::new();
        for name in names {
            if children.contains_key(&name) {
                continue;
            }
            if let Err(e) = self.start_locked(&mut children, &name).await {
                failures.push((name, e.to_string()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Aggregate(failures))
        }
    }

    /// Stop every running child
    pub async fn stop_all(&self) {
        let mut children = self.children.lock().await;
        for (name, handle) in children.drain() {
            let _ = handle.cancel.send(());
            info!("proxy chain stopped: {name}");
        }
    }

    async fn start_locked(
        &self,
        children: &mut HashMap<String, ChildHandle>,
        name: &str,
    ) -> Result<(), SupervisorError> {
        let config_path = self.store.config_path(name);
        if !config_path.exists() {
            return Err(SupervisorError::ConfigMissing(name.to_string()));
        }

        let mut child = Command::new(&self.program)
            .arg("run")
            .arg("-config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_logger(name.to_string(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_logger(name.to_string(), stderr, true);
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<String>();

        let waiter_name = name.to_string();
        let waiter_children = Arc::clone(&self.children);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => {
                        info!("[xray-{waiter_name}] exited cleanly");
                        format!("exited with {status}")
                    }
                    Ok(status) => {
                        warn!("[xray-{waiter_name}] exited with {status}");
                        format!("exited with {status}")
                    }
                    Err(e) => {
                        error!("[xray-{waiter_name}] wait failed: {e}");
                        format!("wait failed: {e}")
                    }
                },
                _ = &mut cancel_rx => {
                    if let Err(e) = child.kill().await {
                        error!("[xray-{waiter_name}] failed to kill: {e}");
                    }
                    let _ = child.wait().await;
                    "killed".to_string()
                }
            };

            // Signal before taking the lock: a start call waiting out the
            // settle window holds it while listening on this channel.
            let _ = exit_tx.send(outcome);
            waiter_children.lock().await.remove(&waiter_name);
        });

        children.insert(name.to_string(), ChildHandle { cancel: cancel_tx });

        // Settle window: a child that dies right away fails the start call
        tokio::select! {
            reason = exit_rx => {
                children.remove(name);
                Err(SupervisorError::ExitedEarly {
                    name: name.to_string(),
                    reason: reason.unwrap_or_else(|_| "exited".to_string()),
                })
            }
            () = tokio::time::sleep(self.settle) => {
                info!("proxy chain started: {name}");
                Ok(())
            }
        }
    }
}

/// Re-log child output line by line under the chain's tag
fn spawn_line_logger(
    name: String,
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    is_stderr: bool,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            if is_stderr {
                warn!("[xray-{name}] {line}");
            } else {
                info!("[xray-{name}] {line}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const LINK: &str = "vless://uuid@test.example:443?security=tls#t";

    /// Write an executable stub standing in for the proxy binary
    fn fake_binary(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-xray");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn fixture(body: &str, settle: Duration) -> (TempDir, Arc<OutboundStore>, ProxySupervisor) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            OutboundStore::new(dir.path().join("configs"), (24000, 25000)).unwrap(),
        );
        let program = fake_binary(&dir, body).display().to_string();
        let sup = ProxySupervisor::with_program(Arc::clone(&store), program, settle);
        (dir, store, sup)
    }

    async fn wait_until_gone(sup: &ProxySupervisor, name: &str) {
        for _ in 0..100 {
            if !sup.is_running(name).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("child entry never cleared");
    }

    #[tokio::test]
    async fn test_start_and_stop_long_running_child() {
        let (_dir, store, sup) = fixture("exec sleep 30", Duration::from_millis(150));
        let name = store.create(LINK, false).unwrap();

        sup.start(&name).await.unwrap();
        assert!(sup.is_running(&name).await);

        sup.stop(&name).await.unwrap();
        assert!(!sup.is_running(&name).await);
        wait_until_gone(&sup, &name).await;
    }

    #[tokio::test]
    async fn test_fast_exit_is_transient_error() {
        let (_dir, store, sup) = fixture("exit 7", Duration::from_millis(500));
        let name = store.create(LINK, false).unwrap();

        let err = sup.start(&name).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedEarly { .. }));
        assert!(!sup.is_running(&name).await);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (_dir, store, sup) = fixture("exec sleep 30", Duration::from_millis(100));
        let name = store.create(LINK, false).unwrap();

        sup.start(&name).await.unwrap();
        let err = sup.start(&name).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        sup.stop(&name).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_child() {
        let (_dir, store, sup) = fixture("exec sleep 30", Duration::from_millis(100));
        let sup = Arc::new(sup);
        let name = store.create(LINK, false).unwrap();

        let a = tokio::spawn({
            let sup = Arc::clone(&sup);
            let name = name.clone();
            async move { sup.start(&name).await }
        });
        let b = tokio::spawn({
            let sup = Arc::clone(&sup);
            let name = name.clone();
            async move { sup.start(&name).await }
        });

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.is_ok() != rb.is_ok(), "exactly one start must win");
        assert!(sup.is_running(&name).await);
        sup.stop(&name).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let (_dir, store, sup) = fixture("exec sleep 30", Duration::from_millis(100));
        let name = store.create(LINK, false).unwrap();
        let err = sup.stop(&name).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_start_missing_config() {
        let (_dir, _store, sup) = fixture("exec sleep 30", Duration::from_millis(100));
        let err = sup.start("xray9").await.unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigMissing(_)));
    }

    #[tokio::test]
    async fn test_start_all_continues_past_failures() {
        let (_dir, store, sup) = fixture("exec sleep 30", Duration::from_millis(100));
        let good = store.create(LINK, true).unwrap();

        let names = vec![good.clone(), "missing-chain".to_string()];
        let err = sup.start_all(move || Ok(names)).await.unwrap_err();

        // The good chain is running despite the aggregate failure
        assert!(sup.is_running(&good).await);
        let SupervisorError::Aggregate(failures) = err else {
            panic!("expected aggregate error");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "missing-chain");
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_restart() {
        let (_dir, store, sup) = fixture("exec sleep 30", Duration::from_millis(100));
        let name = store.create(LINK, false).unwrap();

        sup.start(&name).await.unwrap();
        sup.restart(&name).await.unwrap();
        assert!(sup.is_running(&name).await);
        sup.stop(&name).await.unwrap();
    }
}
