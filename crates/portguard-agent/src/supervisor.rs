use std::{process::ExitStatus, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use portguard_process::{ProcessState, SupervisorStatus};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::Mutex,
};

use crate::{
    config::{self, GuardConfig},
    errors::SupervisorError,
    logs::{self, LogSink},
    reconcile::{self, ProcfsBackend},
};

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies (crash/kill), the child must not outlive it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug)]
struct Supervised {
    state: ProcessState,
    child: Option<Child>,
    pid: Option<u32>,
    pgid: Option<i32>,
    /// Port the child was actually launched on (may differ from the target
    /// after a fallback rebind).
    port: u16,
    restart_count: u32,
    exit_code: Option<i32>,
    exited_at: Option<DateTime<Utc>>,
    started_at: Option<tokio::time::Instant>,
    message: Option<String>,
}

impl Supervised {
    fn snapshot(&self) -> SupervisorStatus {
        SupervisorStatus {
            port: self.port,
            state: self.state,
            restart_count: self.restart_count,
            pid: self.pid,
            exit_code: self.exit_code,
            exited_at: self.exited_at,
            message: self.message.clone(),
        }
    }
}

/// Owns the lifecycle of the single supervised server process.
///
/// All mutation of the supervised state goes through `start`/`stop`/exit
/// recording and is serialized behind the mutex; the monitor loop and the
/// remediation engine share this instance through an `Arc` and never touch
/// the child handle directly.
pub struct Supervisor {
    config: GuardConfig,
    backend: ProcfsBackend,
    inner: Mutex<Supervised>,
    sink: LogSink,
}

impl Supervisor {
    /// Requires a tokio runtime: the log sink spawns file-writer tasks.
    pub fn new(config: GuardConfig) -> Self {
        let (max_bytes, max_files) = config::log_file_limits();
        let file_tx = logs::spawn_file_writer(config.console_log_path(), max_bytes, max_files);
        let error_tx = logs::spawn_file_writer(config.error_log_path(), max_bytes, max_files);

        let sink = LogSink {
            buffer: Arc::new(Mutex::new(logs::LogBuffer::default())),
            file_tx: Some(file_tx),
            error_tx: Some(error_tx),
        };

        let port = config.port;
        Self {
            config,
            backend: ProcfsBackend,
            inner: Mutex::new(Supervised {
                state: ProcessState::Stopped,
                child: None,
                pid: None,
                pgid: None,
                port,
                restart_count: 0,
                exit_code: None,
                exited_at: None,
                started_at: None,
                message: None,
            }),
            sink,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Pure read, no side effects.
    pub async fn status(&self) -> SupervisorStatus {
        self.inner.lock().await.snapshot()
    }

    /// Reconcile the target port, then launch the child. Precondition: the
    /// previous child is confirmed terminated (state `Stopped`).
    pub async fn start(&self) -> Result<SupervisorStatus, SupervisorError> {
        {
            let mut s = self.inner.lock().await;
            if s.state != ProcessState::Stopped {
                return Err(SupervisorError::NotStopped(s.state));
            }
            s.state = ProcessState::Starting;
            s.message = Some("starting...".to_string());
        }

        match self.launch().await {
            Ok(status) => Ok(status),
            Err(err) => {
                let mut s = self.inner.lock().await;
                s.state = ProcessState::Stopped;
                s.message = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn launch(&self) -> Result<SupervisorStatus, SupervisorError> {
        let target = self.config.port;

        if reconcile::reconcile(&self.backend, target, self.config.settle_delay).await {
            self.sink
                .emit(format!(
                    "[portguard] cleared conflicting listener on port {target}"
                ))
                .await;
        }

        // Termination is asynchronous; a bind probe is the re-verification.
        // The probe doubles as the fallback search when the port is still
        // (or again) occupied.
        let port = reconcile::find_free_port(target, self.config.fallback_window).ok_or(
            SupervisorError::PortConflict {
                port: target,
                window: self.config.fallback_window,
            },
        )?;
        if port != target {
            tracing::warn!(target, port, "target port still occupied, rebinding");
            self.sink
                .emit(format!(
                    "[portguard] port {target} still occupied, rebinding to {port}"
                ))
                .await;
        }

        let Some((program, args)) = self.config.command.split_first() else {
            return Err(SupervisorError::Launch {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.config.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        // The child binds whatever we resolved, not the configured target.
        cmd.env("PORT", port.to_string());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Launch {
            command: self.config.command.join(" "),
            source: e,
        })?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        self.sink
            .emit(format!(
                "[portguard] exec: {} (cwd {}) port={} pid={:?}",
                self.config.command.join(" "),
                self.config.cwd.display(),
                port,
                pid
            ))
            .await;

        if let Some(out) = child.stdout.take() {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stdout] {line}")).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // Also lands in the error log the remediation engine scans.
                    sink.emit_err(format!("[stderr] {line}")).await;
                }
            });
        }

        {
            let mut s = self.inner.lock().await;
            s.child = Some(child);
            s.pid = pid;
            s.pgid = pgid;
            s.port = port;
            s.state = ProcessState::Running;
            s.exit_code = None;
            s.started_at = Some(tokio::time::Instant::now());
            s.message = None;
        }

        tracing::info!(port, ?pid, "server process launched");
        Ok(self.status().await)
    }

    /// Liveness monitoring loop: polls child exit on a fixed interval and
    /// applies the restart policy. Runs until the supervisor process exits.
    pub async fn monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.monitor_poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let exited = {
                let mut s = self.inner.lock().await;
                let Some(child) = s.child.as_mut() else {
                    continue;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let runtime = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                        s.child = None;
                        s.pid = None;
                        s.pgid = None;
                        s.exit_code = status.code();
                        s.exited_at = Some(Utc::now());
                        s.state = ProcessState::Exited;
                        Some((status, runtime))
                    }
                    Ok(None) => None,
                    Err(err) => {
                        tracing::warn!(%err, "child exit poll failed");
                        None
                    }
                }
            };

            if let Some((status, runtime)) = exited {
                self.handle_exit(status, runtime).await;
            }
        }
    }

    async fn handle_exit(&self, status: ExitStatus, runtime: Duration) {
        let code = status.code();
        self.sink
            .emit(format!(
                "[portguard] server exited: code={:?} runtime_ms={}",
                code,
                runtime.as_millis()
            ))
            .await;

        if code == Some(0) {
            let mut s = self.inner.lock().await;
            s.state = ProcessState::Stopped;
            s.message = Some("exited cleanly".to_string());
            tracing::info!("server exited cleanly, not restarting");
            return;
        }

        {
            // Diagnostics for the operator: the tail of what the server said.
            let (tail, _) = self.sink.buffer.lock().await.tail_after(0, 10);
            tracing::error!(exit_code = ?code, tail = ?tail, "server exited abnormally");

            let mut s = self.inner.lock().await;
            // A long healthy run means the earlier crashes were transient.
            if runtime >= self.config.sustained_run {
                s.restart_count = 0;
            }
        }

        loop {
            let attempt = {
                let mut s = self.inner.lock().await;
                if s.restart_count >= self.config.restart_ceiling {
                    s.state = ProcessState::Stopped;
                    s.message = Some(format!(
                        "restart ceiling reached ({}/{})",
                        s.restart_count, self.config.restart_ceiling
                    ));
                    tracing::error!(
                        restarts = s.restart_count,
                        "restart ceiling reached; automatic recovery abandoned"
                    );
                    None
                } else {
                    s.restart_count = s.restart_count.saturating_add(1);
                    // `start` requires a confirmed-terminated previous child.
                    s.state = ProcessState::Stopped;
                    s.message = Some(format!(
                        "restarting (attempt {}/{})",
                        s.restart_count, self.config.restart_ceiling
                    ));
                    Some(s.restart_count)
                }
            };
            let Some(attempt) = attempt else {
                self.sink
                    .emit("[portguard] restart ceiling reached, giving up".to_string())
                    .await;
                return;
            };

            tokio::time::sleep(self.config.restart_delay).await;

            match self.start().await {
                Ok(_) => {
                    tracing::info!(attempt, "server restarted");
                    return;
                }
                Err(SupervisorError::NotStopped(state)) => {
                    // An operator-initiated start/stop raced us; defer to it.
                    tracing::warn!(?state, "auto-restart skipped");
                    return;
                }
                Err(err) => {
                    // Launch/port failures burn a restart attempt like any
                    // other abnormal exit.
                    tracing::error!(%err, attempt, "restart attempt failed");
                }
            }
        }
    }

    /// Graceful stop with bounded escalation: SIGTERM to the process group,
    /// then SIGKILL once the grace period runs out. Always lands in
    /// `Stopped`.
    pub async fn stop(&self, grace: Duration) -> Result<SupervisorStatus, SupervisorError> {
        let (child, pgid) = {
            let mut s = self.inner.lock().await;
            if !s.state.is_live() {
                return Ok(s.snapshot());
            }
            s.state = ProcessState::Stopping;
            s.message = Some("stopping".to_string());
            (s.child.take(), s.pgid.take())
        };

        self.sink
            .emit(format!(
                "[portguard] stop requested (grace {}ms)",
                grace.as_millis()
            ))
            .await;

        if let Some(pgid) = pgid {
            #[cfg(unix)]
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }

        let mut exit_code = None;
        if let Some(mut child) = child {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => exit_code = status.code(),
                Ok(Err(err)) => tracing::warn!(%err, "wait after SIGTERM failed"),
                Err(_) => {
                    // Absorbed: escalation is the recovery.
                    let timeout_err = SupervisorError::TerminationTimeout(grace);
                    tracing::warn!(%timeout_err, "escalating to SIGKILL");
                    self.sink
                        .emit("[portguard] stop: grace period expired, sent SIGKILL".to_string())
                        .await;
                    if let Some(pgid) = pgid {
                        #[cfg(unix)]
                        unsafe {
                            libc::kill(-pgid, libc::SIGKILL);
                        }
                    }
                    let _ = child.kill().await;
                    if let Ok(status) = child.try_wait() {
                        exit_code = status.and_then(|st| st.code());
                    }
                }
            }
        }

        {
            let mut s = self.inner.lock().await;
            s.state = ProcessState::Stopped;
            s.pid = None;
            s.exit_code = exit_code;
            s.exited_at = Some(Utc::now());
            s.message = Some("stopped".to_string());
        }
        self.sink.emit("[portguard] server stopped".to_string()).await;
        Ok(self.status().await)
    }

    /// Deliberate operator restart: the one place the crash-loop counter
    /// resets unconditionally.
    pub async fn restart(&self) -> Result<SupervisorStatus, SupervisorError> {
        self.stop(self.config.stop_grace).await?;
        {
            let mut s = self.inner.lock().await;
            s.restart_count = 0;
        }
        self.start().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    fn test_config(dir: &Path, command: &[&str], ceiling: u32) -> GuardConfig {
        GuardConfig {
            port: free_port(),
            command: command.iter().map(|s| s.to_string()).collect(),
            cwd: dir.to_path_buf(),
            restart_ceiling: ceiling,
            restart_delay: Duration::from_millis(20),
            monitor_poll: Duration::from_millis(20),
            settle_delay: Duration::from_millis(1),
            stop_grace: Duration::from_millis(500),
            logs_dir: dir.join("logs"),
            ..GuardConfig::default()
        }
    }

    async fn wait_for<F>(sup: &Arc<Supervisor>, deadline: Duration, mut pred: F) -> SupervisorStatus
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            let st = sup.status().await;
            if pred(&st) {
                return st;
            }
            if tokio::time::Instant::now() >= end {
                panic!("condition not reached before deadline, last status: {st:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn clean_exit_never_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), &["sh", "-c", "exit 0"], 10);
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();
        tokio::spawn(sup.clone().monitor());

        let st = wait_for(&sup, Duration::from_secs(5), |s| {
            s.state == ProcessState::Stopped
        })
        .await;
        assert_eq!(st.restart_count, 0);
        assert_eq!(st.exit_code, Some(0));
    }

    #[tokio::test]
    async fn crash_loop_stops_at_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), &["sh", "-c", "exit 1"], 3);
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();
        tokio::spawn(sup.clone().monitor());

        let st = wait_for(&sup, Duration::from_secs(10), |s| {
            s.state == ProcessState::Stopped && s.restart_count == 3
        })
        .await;
        assert_eq!(st.exit_code, Some(1));

        // One more monitor window: nothing respawns past the ceiling.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let st = sup.status().await;
        assert_eq!(st.state, ProcessState::Stopped);
        assert_eq!(st.restart_count, 3);
    }

    #[tokio::test]
    async fn crashes_under_the_ceiling_end_running() {
        let dir = tempfile::tempdir().unwrap();
        // Fails three times, then stays up.
        let script = "n=$(cat attempts 2>/dev/null || echo 0); n=$((n+1)); \
                      echo $n > attempts; if [ $n -le 3 ]; then exit 1; fi; sleep 30";
        let cfg = test_config(dir.path(), &["sh", "-c", script], 10);
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();
        tokio::spawn(sup.clone().monitor());

        let st = wait_for(&sup, Duration::from_secs(10), |s| {
            s.state == ProcessState::Running && s.restart_count == 3
        })
        .await;
        assert_eq!(st.restart_count, 3);

        sup.stop(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        // The shell ignores TERM and respawns its sleeper, so only SIGKILL
        // actually ends it.
        let script = "trap '' TERM; while true; do sleep 0.1; done";
        let cfg = test_config(dir.path(), &["sh", "-c", script], 10);
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = tokio::time::Instant::now();
        let st = sup.stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(st.state, ProcessState::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn start_requires_stopped_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), &["sleep", "30"], 10);
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotStopped(_)));

        sup.stop(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), &["portguard-test-no-such-binary"], 10);
        let sup = Arc::new(Supervisor::new(cfg));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { .. }));
        // Fatal to the attempt, not to the supervisor.
        assert_eq!(sup.status().await.state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn empty_command_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), &[], 10);
        assert!(cfg.command.is_empty());
        let sup = Arc::new(Supervisor::new(cfg));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { .. }));
        assert_eq!(sup.status().await.state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn operator_restart_resets_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), &["sh", "-c", "exit 1"], 2);
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();
        tokio::spawn(sup.clone().monitor());

        wait_for(&sup, Duration::from_secs(10), |s| {
            s.state == ProcessState::Stopped && s.restart_count == 2
        })
        .await;

        // restart() is the deliberate reset; the child will crash again but
        // the counter starts over.
        sup.restart().await.unwrap();
        let st = wait_for(&sup, Duration::from_secs(10), |s| {
            s.state == ProcessState::Stopped && s.restart_count == 2
        })
        .await;
        assert_eq!(st.restart_count, 2);
    }

    #[tokio::test]
    async fn stderr_lines_reach_the_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(
            dir.path(),
            &["sh", "-c", "echo 'ECONNREFUSED 127.0.0.1:5432' >&2; exit 1"],
            0,
        );
        let error_log = cfg.error_log_path();
        let sup = Arc::new(Supervisor::new(cfg));
        sup.start().await.unwrap();
        tokio::spawn(sup.clone().monitor());

        wait_for(&sup, Duration::from_secs(5), |s| {
            s.state == ProcessState::Stopped
        })
        .await;
        // The writer task drains asynchronously.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let content = tokio::fs::read_to_string(&error_log).await.unwrap();
        assert!(content.contains("ECONNREFUSED"));
    }
}
