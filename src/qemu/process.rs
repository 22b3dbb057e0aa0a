// QEMU process supervision
//
// QEMU daemonizes itself and reports its pid through a pidfile. The pid is
// all we keep: re-attaching after a daemon restart needs nothing else.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::hypervisor::events::{Hub, VmEvent};

const PID_FILE_TIMEOUT: Duration = Duration::from_secs(5);
const PID_FILE_POLL: Duration = Duration::from_millis(100);

/// Why a launch failed; the display text is what the hub reports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("can not find qemu executable")]
    ExecutableNotFound,

    #[error("try to start qemu failed")]
    StartFailed,

    #[error("pid file not exist, timeout")]
    PidFileTimeout,

    #[error("open pid file failed")]
    PidFileOpen,

    #[error("read pid file timeout")]
    PidReadTimeout,

    #[error("read pid file failed")]
    PidRead,
}

/// Run the self-daemonizing hypervisor and return the pid it reports.
pub async fn start_daemonized(
    executable: &Path,
    args: &[String],
    pid_file: &Path,
) -> Result<i32, LaunchError> {
    if !executable.exists() {
        return Err(LaunchError::ExecutableNotFound);
    }

    debug!(executable = %executable.display(), args = %args.join(" "), "starting qemu");
    let output = tokio::process::Command::new(executable)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            error!(error = %e, "failed to run qemu");
            LaunchError::StartFailed
        })?;

    if !output.stdout.is_empty() {
        info!(stdout = %String::from_utf8_lossy(&output.stdout), "qemu output");
    }
    if !output.stderr.is_empty() {
        info!(stderr = %String::from_utf8_lossy(&output.stderr), "qemu output");
    }
    if !output.status.success() {
        error!(status = %output.status, "qemu failed to daemonize");
        return Err(LaunchError::StartFailed);
    }

    wait_pid_file(pid_file).await?;
    let pid = read_pid(pid_file).await?;
    info!(pid, "qemu daemon started");
    Ok(pid)
}

async fn wait_pid_file(pid_file: &Path) -> Result<(), LaunchError> {
    let deadline = Instant::now() + PID_FILE_TIMEOUT;
    loop {
        match tokio::fs::metadata(pid_file).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(error = %e, "open pid file failed");
                return Err(LaunchError::PidFileOpen);
            }
        }
        if Instant::now() >= deadline {
            error!(pid_file = %pid_file.display(), "open pid file timeout");
            return Err(LaunchError::PidFileTimeout);
        }
        tokio::time::sleep(PID_FILE_POLL).await;
    }
}

/// The pidfile may exist before QEMU has written it; an empty file is retried.
async fn read_pid(pid_file: &Path) -> Result<i32, LaunchError> {
    let deadline = Instant::now() + PID_FILE_TIMEOUT;
    loop {
        let content = tokio::fs::read_to_string(pid_file).await.map_err(|e| {
            error!(error = %e, "read pid file failed");
            LaunchError::PidRead
        })?;
        let content = content.trim();
        if !content.is_empty() {
            return content.parse().map_err(|e| {
                error!(error = %e, content, "read pid file failed");
                LaunchError::PidRead
            });
        }
        if Instant::now() >= deadline {
            error!("read pid file timeout");
            return Err(LaunchError::PidReadTimeout);
        }
        tokio::time::sleep(PID_FILE_POLL).await;
    }
}

pub fn is_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogMessage {
    Quit,
    Kill,
}

/// Wait for a kill or quit request for `pid`.
pub fn spawn_watchdog(
    pid: Option<i32>,
    mut rx: mpsc::Receiver<WatchdogMessage>,
    hub: Hub,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match rx.recv().await {
            Some(WatchdogMessage::Quit) => debug!("quit watch dog"),
            Some(WatchdogMessage::Kill) => {
                let success = match pid {
                    Some(pid) if pid > 0 => {
                        info!(pid, "kill qemu");
                        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(pid, error = %e, "kill qemu failed");
                                false
                            }
                        }
                    }
                    _ => {
                        warn!("no process to be killed");
                        false
                    }
                };
                hub.post(VmEvent::VmKilled { success }).await;
            }
            None => debug!("chan closed, quit watch dog"),
        }
    })
}
