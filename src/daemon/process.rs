//! Process supervisor: owns the OS-level lifecycle of one service's running
//! instance. Start redirects stdout/stderr to a dated log file behind a
//! stable `<name>.log` symlink; Stop is SIGTERM with a bounded wait, then
//! SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{GpmError, Result};
use crate::paths::Paths;
use crate::platform;
use crate::service::{ResourceStat, Service, Status};

/// Graceful-stop window before escalating to SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory handle for one service. Holding a `Process` does not imply the
/// OS process is alive: `service.pid == 0` means no live handle.
pub struct Process {
    pub service: Service,
    child: Option<Child>,
    log_file: Option<std::fs::File>,
    /// Restarts performed by the reaper since daemon start.
    pub restarts: u32,
}

impl Process {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            child: None,
            log_file: None,
            restarts: 0,
        }
    }

    pub fn has_live_handle(&self) -> bool {
        self.child.is_some()
    }

    /// Start the child. No-op returning the existing pid if a live handle is
    /// already tracked.
    pub fn start(&mut self, paths: &Paths) -> Result<u32> {
        if let Some(child) = &self.child {
            if let Some(pid) = child.id() {
                debug!("Service '{}' already running (pid {})", self.service.name, pid);
                return Ok(pid);
            }
        }

        match self.spawn(paths) {
            Ok(pid) => {
                info!("Started service '{}' with PID {}", self.service.name, pid);
                self.service.pid = pid;
                self.service.status = Status::Running;
                self.service.msg.clear();
                self.service.start_ts = chrono::Utc::now().timestamp();
                Ok(pid)
            }
            Err(e) => {
                warn!("Failed to start service '{}': {}", self.service.name, e);
                self.service.status = Status::Failed;
                self.service.msg = e.to_string();
                self.service.clear_runtime();
                self.child = None;
                self.log_file = None;
                Err(e)
            }
        }
    }

    fn spawn(&mut self, paths: &Paths) -> Result<u32> {
        let name = &self.service.name;
        let log_file = self.open_log_file(paths)?;
        let stdout = log_file.try_clone()?;
        let stderr = log_file.try_clone()?;

        let mut cmd = Command::new(&self.service.bin);
        cmd.args(&self.service.args);
        for (key, value) in &self.service.env {
            cmd.env(key, value);
        }
        if !self.service.dir.is_empty() {
            cmd.current_dir(&self.service.dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));
        if let Some(attr) = &self.service.sys_proc_attr {
            platform::apply_spawn_attrs(&mut cmd, attr);
        }
        cmd.kill_on_drop(false);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| GpmError::Internal(format!("no pid for spawned '{name}'")))?;
        self.child = Some(child);
        self.log_file = Some(log_file);
        Ok(pid)
    }

    /// Create the dated log file and repoint the stable `<name>.log` symlink
    /// at it. The symlink is what log tailing and rotation work against.
    fn open_log_file(&self, paths: &Paths) -> Result<std::fs::File> {
        let name = &self.service.name;
        let dir = paths.logs_dir(name);
        std::fs::create_dir_all(&dir)?;

        let date = chrono::Local::now().format("%Y%m%d").to_string();
        let dated = paths.dated_log(name, &date);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dated)?;

        let link = paths.log_link(name);
        match std::fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&dated, &link)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(&dated, &link)?;

        Ok(file)
    }

    /// Stop the child: SIGTERM, bounded wait, SIGKILL on timeout. Fails with
    /// `ProcessNotFound` when no live handle is tracked, including on a
    /// second call.
    pub async fn stop(&mut self) -> Result<()> {
        let name = self.service.name.clone();
        let Some(mut child) = self.child.take() else {
            return Err(GpmError::ProcessNotFound(name));
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            info!("Stopping service '{}' (pid {}) gracefully", name, pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        child.kill().await?;

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(status) => {
                debug!("Service '{}' exited: {:?}", name, status.ok());
            }
            Err(_) => {
                warn!("Service '{}' did not stop in time, force killing", name);
                child.kill().await?;
            }
        }

        self.log_file = None;
        self.service.status = Status::Stopped;
        self.service.clear_runtime();
        Ok(())
    }

    /// Immediate SIGKILL with no graceful window. Used for non-graceful
    /// daemon shutdown.
    pub async fn kill(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Err(GpmError::ProcessNotFound(self.service.name.clone()));
        };
        info!("Killing service '{}' (pid {})", self.service.name, self.service.pid);
        child.kill().await?;
        self.log_file = None;
        self.service.status = Status::Stopped;
        self.service.clear_runtime();
        Ok(())
    }

    /// Non-blocking exit probe used by the reaper. Returns true when the
    /// tracked child has exited; the dead handle is released and the service
    /// marked failed.
    pub fn reap_if_exited(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(
                    "Service '{}' (pid {}) exited unexpectedly: {}",
                    self.service.name, self.service.pid, status
                );
                self.child = None;
                self.log_file = None;
                self.service.status = Status::Failed;
                self.service.msg = format!("process exited unexpectedly: {status}");
                self.service.clear_runtime();
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("try_wait failed for service '{}': {}", self.service.name, e);
                false
            }
        }
    }

    /// Read-only resource snapshot. Never blocks on the child and never
    /// mutates supervisor state; zeroed when not running.
    pub fn stat(&self, system: &mut System) -> ResourceStat {
        if self.child.is_none() || self.service.pid == 0 {
            return ResourceStat::default();
        }
        sample_stat(self.service.pid, system)
    }

    /// Service snapshot with the live stat overlaid.
    pub fn snapshot(&self, system: &mut System) -> Service {
        let mut service = self.service.clone();
        service.stat = self.stat(system);
        service
    }
}

/// Sample cpu percent and resident memory for one pid.
pub fn sample_stat(pid: u32, system: &mut System) -> ResourceStat {
    system.refresh_memory();
    system.refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
    let Some(proc_info) = system.process(SysPid::from_u32(pid)) else {
        return ResourceStat::default();
    };
    let memory = proc_info.memory();
    let total = system.total_memory();
    ResourceStat {
        cpu_percent: proc_info.cpu_usage(),
        memory,
        mem_percent: if total == 0 {
            0.0
        } else {
            (memory as f64 / total as f64 * 100.0) as f32
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sleep_service(name: &str) -> Service {
        Service::new(name, "/bin/sleep").args(["30"])
    }

    #[tokio::test]
    async fn stop_without_handle_is_process_not_found() {
        let mut process = Process::new(sleep_service("idle"));
        assert!(matches!(
            process.stop().await,
            Err(GpmError::ProcessNotFound(_))
        ));
        // Second call behaves the same, never a crash
        assert!(matches!(
            process.stop().await,
            Err(GpmError::ProcessNotFound(_))
        ));
        assert_eq!(process.service.pid, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_assigns_pid_and_stop_resets_it() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let mut process = Process::new(sleep_service("sleeper"));

        let pid = process.start(&paths).unwrap();
        assert!(pid > 0);
        assert_eq!(process.service.status, Status::Running);
        assert_eq!(process.service.pid, pid);

        // Starting again is a no-op returning the same pid
        assert_eq!(process.start(&paths).unwrap(), pid);

        process.stop().await.unwrap();
        assert_eq!(process.service.status, Status::Stopped);
        assert_eq!(process.service.pid, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_points_stable_log_symlink_at_dated_file() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let mut process = Process::new(sleep_service("logged"));
        process.start(&paths).unwrap();

        let link = paths.log_link("logged");
        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_symlink());
        let target = std::fs::read_link(&link).unwrap();
        assert!(target
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("logged-"));

        process.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_marks_failed_with_message() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let mut process = Process::new(Service::new("broken", "/no/such/binary"));

        assert!(process.start(&paths).is_err());
        assert_eq!(process.service.status, Status::Failed);
        assert!(!process.service.msg.is_empty());
        assert_eq!(process.service.pid, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaper_detects_unexpected_exit() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let mut process = Process::new(Service::new("oneshot", "/bin/true"));
        process.start(&paths).unwrap();

        // /bin/true exits immediately; poll until try_wait observes it
        for _ in 0..50 {
            if process.reap_if_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(process.service.status, Status::Failed);
        assert_eq!(process.service.pid, 0);
        assert!(!process.has_live_handle());
    }
}
