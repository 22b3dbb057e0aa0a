//! QEMU backend
//!
//! QEMU runs self-daemonized and is driven through QMP. Each VM gets a
//! [`QemuContext`] holding the QMP handler channel, the watchdog channel,
//! the process pid and the log tailer.

pub mod arguments;
pub mod handler;
pub mod logfile;
pub mod process;
pub mod qmp;
pub mod sessions;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hypervisor::constants::{
    KVM_DEVICE, QEMU_LOG_DIR, QEMU_PID_FILE, QEMU_SYSTEM_EXE, QMP_SOCK_NAME,
};
use crate::hypervisor::context::VmContext;
use crate::hypervisor::disk::{scsi_addr_string, scsi_id_to_name};
use crate::hypervisor::driver::{
    DiskDescriptor, DriverContext, GuestNicInfo, HostNicInfo, HypervisorDriver, PersistedMap,
};
use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::events::{
    self, ErrorSender, EventSender, InterfaceCreated, VmEvent,
};
use crate::hypervisor::persist::{PersistedState, QemuState, PERSIST_VERSION};
use crate::metrics;

pub use handler::{QmpPolicy, QmpSession};
pub use logfile::QemuLogFile;
pub use process::WatchdogMessage;

const WATCHDOG_CAPACITY: usize = 16;
const VHOST_VSOCK_DEVICE: &str = "/dev/vhost-vsock";

/// Locate the QEMU binary: the configured path when given, else `PATH`.
pub fn find_executable(configured: Option<&Path>) -> Option<PathBuf> {
    match configured {
        Some(path) => path.is_file().then(|| path.to_path_buf()),
        None => {
            let paths = std::env::var_os("PATH")?;
            std::env::split_paths(&paths)
                .map(|dir| dir.join(QEMU_SYSTEM_EXE))
                .find(|candidate| candidate.is_file())
        }
    }
}

pub struct QemuDriver {
    executable: PathBuf,
    log_dir: PathBuf,
    has_vsock: bool,
    policy: QmpPolicy,
}

impl QemuDriver {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            log_dir: PathBuf::from(QEMU_LOG_DIR),
            has_vsock: Path::new(VHOST_VSOCK_DEVICE).exists(),
            policy: QmpPolicy::default(),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_vsock(mut self, has_vsock: bool) -> Self {
        self.has_vsock = has_vsock;
        self
    }

    pub fn with_policy(mut self, policy: QmpPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// `<log_dir>/<home dir name>.log`
    pub fn log_file_for(&self, home_dir: &Path) -> PathBuf {
        let name = home_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "qemu".to_string());
        self.log_dir.join(format!("{}.log", name))
    }

    /// The full command line `launch` would run for `ctx`.
    pub fn command_line(&self, ctx: &VmContext) -> Vec<String> {
        let paths = QemuPaths::for_home(&ctx.home_dir);
        launch_arguments(ctx, &paths, &self.log_file_for(&ctx.home_dir), self.has_vsock)
    }
}

#[async_trait]
impl HypervisorDriver for QemuDriver {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn init_context(&self, home_dir: &Path) -> Arc<dyn DriverContext> {
        let log = QemuLogFile::new(self.log_file_for(home_dir));
        Arc::new(QemuContext::new(self, QemuPaths::for_home(home_dir), log, 0))
    }

    async fn load_context(
        &self,
        persisted: &PersistedMap,
    ) -> Result<Arc<dyn DriverContext>, HypervisorError> {
        let state = match PersistedState::decode(persisted, self.name())? {
            PersistedState::Qemu(state) => state,
            other => {
                return Err(HypervisorError::WrongDriver {
                    expected: "qemu".to_string(),
                    found: other.driver_name().to_string(),
                })
            }
        };
        let home = state
            .qmp_sock
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let paths = QemuPaths {
            qmp_sock: state.qmp_sock.clone(),
            pid_file: home.join(QEMU_PID_FILE),
        };
        let log = QemuLogFile::from_state(state.log);
        debug!(pid = state.pid, qmp = %state.qmp_sock.display(), "loaded qemu context");
        Ok(Arc::new(QemuContext::new(self, paths, log, state.pid)))
    }
}

#[derive(Debug, Clone)]
struct QemuPaths {
    qmp_sock: PathBuf,
    pid_file: PathBuf,
}

impl QemuPaths {
    fn for_home(home_dir: &Path) -> Self {
        Self {
            qmp_sock: home_dir.join(QMP_SOCK_NAME),
            pid_file: home_dir.join(QEMU_PID_FILE),
        }
    }
}

fn launch_arguments(
    ctx: &VmContext,
    paths: &QemuPaths,
    log_file: &Path,
    has_vsock: bool,
) -> Vec<String> {
    let mut args = arguments::build(ctx, &paths.qmp_sock, Path::new(KVM_DEVICE).exists());
    args.extend([
        "-daemonize".to_string(),
        "-pidfile".to_string(),
        paths.pid_file.display().to_string(),
        "-D".to_string(),
        log_file.display().to_string(),
    ]);
    if ctx.boot.enable_vsock && has_vsock && ctx.guest_cid > 0 {
        args.push("-device".to_string());
        args.push(arguments::vsock_device(ctx.next_pci_addr(), ctx.guest_cid));
    }
    args
}

/// Who holds the watchdog receiver
enum Watch {
    /// Not launched; kill has nothing to act on
    Idle(mpsc::Receiver<WatchdogMessage>),
    /// Launch in progress; requests queue until the pid is known
    Launching(mpsc::Receiver<WatchdogMessage>),
    Started,
}

/// Per-VM QEMU state
pub struct QemuContext {
    executable: PathBuf,
    has_vsock: bool,
    policy: QmpPolicy,
    paths: QemuPaths,
    log: QemuLogFile,
    /// 0 until the process is known
    pid: AtomicI32,
    qmp_tx: handler::QmpSender,
    qmp_rx: Mutex<Option<handler::QmpReceiver>>,
    handler: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    wdt_tx: mpsc::Sender<WatchdogMessage>,
    watch: Mutex<Watch>,
}

impl QemuContext {
    fn new(driver: &QemuDriver, paths: QemuPaths, log: QemuLogFile, pid: i32) -> Self {
        let (qmp_tx, qmp_rx) = handler::channel();
        let (wdt_tx, wdt_rx) = mpsc::channel(WATCHDOG_CAPACITY);
        Self {
            executable: driver.executable.clone(),
            has_vsock: driver.has_vsock,
            policy: driver.policy.clone(),
            paths,
            log,
            pid: AtomicI32::new(pid),
            qmp_tx,
            qmp_rx: Mutex::new(Some(qmp_rx)),
            handler: tokio::sync::Mutex::new(None),
            wdt_tx,
            watch: Mutex::new(Watch::Idle(wdt_rx)),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        match self.pid.load(Ordering::SeqCst) {
            pid if pid > 0 => Some(pid),
            _ => None,
        }
    }

    pub fn qmp_sock(&self) -> &Path {
        &self.paths.qmp_sock
    }

    async fn start_handler(&self, ctx: &VmContext) {
        let rx = self
            .qmp_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            warn!(vm = %ctx.id, "QMP handler already started");
            return;
        };
        let handle = handler::spawn_handler(
            self.paths.qmp_sock.clone(),
            ctx.hub.clone(),
            self.qmp_tx.clone(),
            rx,
            self.policy.clone(),
        );
        *self.handler.lock().await = Some(handle);
    }

    fn watch(&self) -> MutexGuard<'_, Watch> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move an idle context into launching; false when it already left idle.
    fn begin_launch(&self) -> bool {
        let mut watch = self.watch();
        match std::mem::replace(&mut *watch, Watch::Started) {
            Watch::Idle(rx) => {
                *watch = Watch::Launching(rx);
                true
            }
            other => {
                *watch = other;
                false
            }
        }
    }

    fn start_watchdog(&self, ctx: &VmContext) {
        let mut watch = self.watch();
        match std::mem::replace(&mut *watch, Watch::Started) {
            Watch::Idle(rx) | Watch::Launching(rx) => {
                process::spawn_watchdog(self.pid(), rx, ctx.hub.clone());
            }
            Watch::Started => warn!(vm = %ctx.id, "watchdog already started"),
        }
    }

    /// Return to idle after a failed launch. Returns how many kills were
    /// queued while launching; nobody else will answer them.
    fn abort_launch(&self) -> usize {
        let mut watch = self.watch();
        match std::mem::replace(&mut *watch, Watch::Started) {
            Watch::Launching(mut rx) => {
                let mut kills = 0;
                while let Ok(message) = rx.try_recv() {
                    if message == WatchdogMessage::Kill {
                        kills += 1;
                    }
                }
                *watch = Watch::Idle(rx);
                kills
            }
            other => {
                *watch = other;
                0
            }
        }
    }

    /// Queue a session; a handler that is gone answers it at once.
    async fn submit(&self, session: QmpSession) {
        let interaction = handler::QmpInteraction::Session(session);
        if let Err(mpsc::error::SendError(interaction)) = self.qmp_tx.send(interaction).await {
            if let handler::QmpInteraction::Session(session) = interaction {
                (session.respond)(Err(HypervisorError::QmpHandlerExited));
            }
        }
    }

    async fn submit_scalar(&self, commands: Vec<qmp::QmpCommand>, result: ErrorSender) {
        self.submit(QmpSession::new(commands, move |outcome| {
            events::reply(result, outcome)
        }))
        .await
    }
}

#[async_trait]
impl DriverContext for QemuContext {
    async fn launch(&self, ctx: &VmContext) {
        if !self.begin_launch() {
            warn!(vm = %ctx.id, "qemu already launched");
            return;
        }
        self.start_handler(ctx).await;

        let log_file = self.log.name();
        if let Some(dir) = log_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!(dir = %dir.display(), error = %e, "create qemu log dir failed");
            }
        }

        let args = launch_arguments(ctx, &self.paths, &log_file, self.has_vsock);
        info!(vm = %ctx.id, log = %log_file.display(), "launching qemu");
        debug!(cmdline = %args.join(" "), "qemu arguments");

        match process::start_daemonized(&self.executable, &args, &self.paths.pid_file).await {
            Ok(pid) => {
                metrics::VMS_LAUNCHED_TOTAL.with_label_values(&["qemu"]).inc();
                self.pid.store(pid, Ordering::SeqCst);
                self.log.watch();
                self.start_watchdog(ctx);
            }
            Err(e) => {
                metrics::VM_START_FAILURES_TOTAL
                    .with_label_values(&["qemu"])
                    .inc();
                error!(vm = %ctx.id, error = %e, "launch qemu failed");
                ctx.hub
                    .post(VmEvent::VmStartFail {
                        message: e.to_string(),
                    })
                    .await;
                for _ in 0..self.abort_launch() {
                    ctx.hub.post(VmEvent::VmKilled { success: false }).await;
                }
            }
        }
    }

    async fn associate(&self, ctx: &VmContext) {
        match self.pid() {
            Some(pid) if process::is_alive(pid) => {
                info!(vm = %ctx.id, pid, "associating running qemu");
            }
            pid => {
                warn!(vm = %ctx.id, ?pid, "qemu process to associate is gone");
                ctx.hub.post(VmEvent::VmExit).await;
                return;
            }
        }
        self.start_handler(ctx).await;
        self.log.watch();
        self.start_watchdog(ctx);
    }

    fn dump(&self) -> Result<PersistedMap, HypervisorError> {
        let pid = match self.pid() {
            Some(pid) if process::is_alive(pid) => pid,
            _ => return Err(HypervisorError::NotRunning("no process running".to_string())),
        };
        PersistedState::Qemu(QemuState {
            qmp_sock: self.paths.qmp_sock.clone(),
            pid,
            log: self.log.state(),
            version: PERSIST_VERSION,
        })
        .encode()
    }

    async fn add_disk(
        &self,
        _ctx: &VmContext,
        source_type: &str,
        disk: &DiskDescriptor,
        result: EventSender,
    ) {
        let filename = if disk.format == "rbd" && !disk.options.is_empty() {
            sessions::rbd_filename(&disk.filename, &disk.options)
        } else {
            disk.filename.clone()
        };

        let id = disk.scsi_id;
        let prepared = sessions::disk_add(&filename, &disk.format, id)
            .and_then(|commands| Ok((commands, scsi_addr_string(id)?)));
        let (commands, scsi_addr) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(disk = %disk.name, error = %e, "cannot hotplug disk");
                events::deliver(&result, VmEvent::device_failed(None));
                return;
            }
        };

        let inserted = VmEvent::BlockdevInserted {
            name: disk.name.clone(),
            source_type: source_type.to_string(),
            device_name: scsi_id_to_name(id),
            scsi_id: id,
            scsi_addr,
        };
        self.submit(QmpSession::new(
            commands,
            events::device_respond("disk", result, Some(inserted)),
        ))
        .await
    }

    async fn remove_disk(
        &self,
        _ctx: &VmContext,
        disk: &DiskDescriptor,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        self.submit(QmpSession::new(
            sessions::disk_del(disk.scsi_id),
            events::device_respond("disk", result, callback),
        ))
        .await
    }

    async fn add_nic(
        &self,
        ctx: &VmContext,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        result: EventSender,
    ) {
        let commands = sessions::nic_add(ctx.boot.enable_vhost_user, &ctx.home_dir, host, guest);
        let inserted = VmEvent::NetDevInserted {
            id: host.id.clone(),
            index: guest.index,
            device_name: guest.device.clone(),
            address: guest.busaddr,
            tap_fd: host.fd,
        };
        self.submit(QmpSession::new(
            commands,
            events::device_respond("nic", result, Some(inserted)),
        ))
        .await
    }

    async fn remove_nic(
        &self,
        _ctx: &VmContext,
        iface: &InterfaceCreated,
        callback: Option<VmEvent>,
        result: EventSender,
    ) {
        self.submit(QmpSession::new(
            sessions::nic_del(&iface.device_name),
            events::device_respond("nic", result, callback),
        ))
        .await
    }

    async fn set_cpus(&self, ctx: &VmContext, cpus: u32, result: ErrorSender) {
        let current = ctx.current_cpus();
        if cpus < current {
            events::reply(
                result,
                Err(HypervisorError::CannotReduceCpus {
                    current,
                    requested: cpus,
                }),
            );
            return;
        }
        if cpus == current {
            events::reply(result, Ok(()));
            return;
        }

        let counter = ctx.cpu_counter();
        self.submit(QmpSession::new(
            sessions::cpu_add(current, cpus),
            move |outcome| {
                if outcome.is_ok() {
                    counter.store(cpus, Ordering::SeqCst);
                }
                events::reply(result, outcome)
            },
        ))
        .await
    }

    async fn add_mem(&self, _ctx: &VmContext, slot: u32, size_mb: u64, result: ErrorSender) {
        self.submit_scalar(sessions::mem_add(slot, size_mb), result)
            .await
    }

    async fn save(&self, ctx: &VmContext, path: &Path, result: ErrorSender) {
        self.submit_scalar(sessions::save(path, ctx.boot.boot_to_be_template), result)
            .await
    }

    async fn pause(&self, _ctx: &VmContext, pause: bool, result: ErrorSender) {
        self.submit_scalar(sessions::pause(pause), result).await
    }

    async fn shutdown(&self, ctx: &VmContext) {
        let vm = ctx.id.clone();
        self.submit(QmpSession::new(sessions::quit(), move |outcome| {
            if let Err(e) = outcome {
                warn!(%vm, error = %e, "qemu quit command failed");
            }
        }))
        .await
    }

    async fn kill(&self, ctx: &VmContext) {
        // Queued under the lock so a failing launch cannot miss it.
        let sent = match &*self.watch() {
            Watch::Idle(_) => None,
            Watch::Launching(_) | Watch::Started => {
                Some(self.wdt_tx.try_send(WatchdogMessage::Kill))
            }
        };
        match sent {
            None => {
                warn!(vm = %ctx.id, "kill requested before qemu was launched");
                ctx.hub.post(VmEvent::VmKilled { success: false }).await;
            }
            Some(Ok(())) => {}
            Some(Err(TrySendError::Full(_))) => {
                debug!(vm = %ctx.id, "kill qemu already queued");
            }
            Some(Err(TrySendError::Closed(_))) => {
                debug!(vm = %ctx.id, "kill qemu, but watchdog has already exited");
            }
        }
    }

    async fn close(&self) {
        let _ = self.wdt_tx.try_send(WatchdogMessage::Quit);

        let idle = self
            .qmp_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match idle {
            // Never launched: answer whatever was queued.
            Some(mut rx) => {
                rx.close();
                while let Ok(interaction) = rx.try_recv() {
                    if let handler::QmpInteraction::Session(session) = interaction {
                        (session.respond)(Err(HypervisorError::QmpHandlerExited));
                    }
                }
            }
            None => {
                if self.qmp_tx.send(handler::QmpInteraction::Quit).await.is_err() {
                    debug!("QMP handler already exited");
                }
            }
        }

        if let Some(handle) = self.handler.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "QMP handler task failed");
            }
        }
        self.log.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::context::BootConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_log_file_name_from_home() {
        let driver = QemuDriver::new("/usr/bin/qemu").with_log_dir("/var/log/hyper/qemu");
        assert_eq!(
            driver.log_file_for(Path::new("/var/run/hyper/vm-abc")),
            PathBuf::from("/var/log/hyper/qemu/vm-abc.log")
        );
    }

    #[test]
    fn test_find_configured_executable() {
        let exe = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(find_executable(Some(exe.path())), Some(exe.path().to_path_buf()));
        assert_eq!(find_executable(Some(Path::new("/nonexistent/qemu"))), None);
    }

    #[tokio::test]
    async fn test_command_line_tail() {
        let driver = QemuDriver::new("/usr/bin/qemu").with_vsock(true);
        let (mut ctx, _rx) =
            VmContext::new("vm-1", BootConfig { enable_vsock: true, ..Default::default() }, "/run/hyper/vm-1", &driver);
        ctx.guest_cid = 3;
        let args = driver.command_line(&ctx);
        let tail: Vec<&str> = args.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["-device", "vhost-vsock-pci,id=vsock0,bus=pci.0,addr=5,guest-cid=3"]
        );
        assert!(args.windows(2).any(|w| w[0] == "-pidfile" && w[1] == "/run/hyper/vm-1/pidfile"));
        assert!(args.iter().any(|a| a == "-daemonize"));
    }

    #[tokio::test]
    async fn test_set_cpus_rejects_reduce() {
        let driver = QemuDriver::new("/usr/bin/qemu");
        let (ctx, _rx) = VmContext::new(
            "vm-1",
            BootConfig { cpu: 4, ..Default::default() },
            "/tmp/vm-1",
            &driver,
        );
        let (tx, rx) = oneshot::channel();
        ctx.set_cpus(2, tx).await;
        assert_eq!(
            rx.await.unwrap().unwrap_err().to_string(),
            "can't reduce cpus number from 4 to 2"
        );

        let (tx, rx) = oneshot::channel();
        ctx.set_cpus(4, tx).await;
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_dump_without_process() {
        let driver = QemuDriver::new("/usr/bin/qemu");
        let (ctx, _rx) = VmContext::new("vm-1", BootConfig::default(), "/tmp/vm-1", &driver);
        assert!(matches!(ctx.dump(), Err(HypervisorError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_kill_before_launch_reports_failure() {
        let driver = QemuDriver::new("/usr/bin/qemu");
        let (ctx, mut events) = VmContext::new("vm-1", BootConfig::default(), "/tmp/vm-1", &driver);
        ctx.kill().await;
        assert_eq!(events.recv().await, Some(VmEvent::VmKilled { success: false }));
    }

    /// A qemu stand-in that takes a second before running `body`.
    fn slow_qemu(dir: &Path, body: &str) -> PathBuf {
        let exe = dir.join("fake-qemu");
        std::fs::write(&exe, format!("#!/bin/sh\nsleep 1\n{}\n", body)).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        exe
    }

    fn slow_driver(dir: &Path, exe: PathBuf) -> QemuDriver {
        QemuDriver::new(exe)
            .with_log_dir(dir.join("log"))
            .with_policy(QmpPolicy::new().init_timeout(Duration::from_secs(30)))
    }

    #[tokio::test]
    async fn test_kill_during_launch_kills_started_process() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("vm-1");
        std::fs::create_dir_all(&home).unwrap();
        let daemonize = format!(
            "sleep 30 >/dev/null 2>&1 &\necho $! > {}",
            home.join("pidfile").display()
        );
        let driver = slow_driver(dir.path(), slow_qemu(dir.path(), &daemonize));
        let (ctx, mut events) = VmContext::new("vm-1", BootConfig::default(), &home, &driver);

        tokio::join!(ctx.launch(), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.kill().await;
        });

        // the kill waited for the pid instead of leaving the process behind
        assert_eq!(events.recv().await, Some(VmEvent::VmKilled { success: true }));
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_kill_during_failed_launch_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("vm-1");
        std::fs::create_dir_all(&home).unwrap();
        let driver = slow_driver(dir.path(), slow_qemu(dir.path(), "exit 1"));
        let (ctx, mut events) = VmContext::new("vm-1", BootConfig::default(), &home, &driver);

        tokio::join!(ctx.launch(), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.kill().await;
        });

        assert_eq!(
            events.recv().await,
            Some(VmEvent::VmStartFail {
                message: "try to start qemu failed".to_string()
            })
        );
        assert_eq!(events.recv().await, Some(VmEvent::VmKilled { success: false }));

        // back to idle: a later kill is answered straight away
        ctx.kill().await;
        assert_eq!(events.recv().await, Some(VmEvent::VmKilled { success: false }));
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_close_answers_sessions_queued_before_launch() {
        let driver = QemuDriver::new("/usr/bin/qemu");
        let (ctx, _events) = VmContext::new("vm-1", BootConfig::default(), "/tmp/vm-1", &driver);
        let (tx, rx) = oneshot::channel();
        ctx.pause(true, tx).await;
        ctx.close().await;
        assert_eq!(rx.await.unwrap(), Err(HypervisorError::QmpHandlerExited));
    }

    #[tokio::test]
    async fn test_launch_missing_executable_posts_start_fail() {
        let dir = tempfile::tempdir().unwrap();
        let driver = QemuDriver::new(dir.path().join("missing-qemu"))
            .with_log_dir(dir.path().join("log"))
            .with_policy(QmpPolicy::new().init_timeout(std::time::Duration::from_secs(30)));
        let (ctx, mut events) =
            VmContext::new("vm-1", BootConfig::default(), dir.path().join("vm-1"), &driver);
        ctx.launch().await;
        assert_eq!(
            events.recv().await,
            Some(VmEvent::VmStartFail {
                message: "can not find qemu executable".to_string()
            })
        );
        ctx.close().await;
    }
}
