// QMP session handler
//
// One handler task per QEMU process. Callers submit QmpSessions through the
// handler channel; the handler connects to the QMP socket, negotiates
// capabilities, then runs queued sessions one at a time.
//
// Key invariants:
// - at most one commander (one in-flight session) exists at any moment
// - commands of a session run in order; a command that fails max_attempts
//   times fails the session and the remaining commands are never sent
// - every session's respond callback runs exactly once, including sessions
//   still queued when the handler exits
//
// Tasks per handler: the handler itself, the initializer (until connected),
// the init timer, the receiver (decode loop) and the current commander.

use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hypervisor::error::HypervisorError;
use crate::hypervisor::events::{Hub, VmEvent};
use crate::metrics;
use crate::qemu::qmp::{
    QmpCommand, QmpConnection, QmpDecoder, QmpError, QmpEvent, QmpMessage, QmpResult, QmpWriter,
    QMP_EVENT_SHUTDOWN,
};

pub const QMP_CHANNEL_CAPACITY: usize = 128;
const FEEDBACK_CAPACITY: usize = 128;

pub type QmpSender = mpsc::Sender<QmpInteraction>;
pub type QmpReceiver = mpsc::Receiver<QmpInteraction>;

pub type Respond = Box<dyn FnOnce(Result<(), HypervisorError>) + Send>;

/// Commands run as a unit, answered once
pub struct QmpSession {
    pub commands: Vec<QmpCommand>,
    pub respond: Respond,
}

impl QmpSession {
    pub fn new(
        commands: Vec<QmpCommand>,
        respond: impl FnOnce(Result<(), HypervisorError>) + Send + 'static,
    ) -> Self {
        Self {
            commands,
            respond: Box::new(respond),
        }
    }
}

impl std::fmt::Debug for QmpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.commands.iter().map(|c| c.execute.as_str()).collect();
        f.debug_struct("QmpSession").field("commands", &names).finish()
    }
}

/// Outcome of a session (or of the handshake)
#[derive(Debug, Clone, PartialEq)]
pub struct QmpFinish {
    pub success: bool,
    pub reason: Option<Map<String, Value>>,
}

impl QmpFinish {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut reason = Map::new();
        reason.insert("error".to_string(), Value::String(message.into()));
        Self {
            success: false,
            reason: Some(reason),
        }
    }

    /// Failure text: reason["error"], else the QMP desc, else the raw reason
    pub fn cause(&self) -> String {
        let Some(reason) = &self.reason else {
            return "unknown QMP failure".to_string();
        };
        if let Some(msg) = reason.get("error").and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(desc) = reason.get("desc").and_then(Value::as_str) {
            return desc.to_string();
        }
        Value::Object(reason.clone()).to_string()
    }
}

/// Messages consumed by the handler. Only `Session` and `Quit` come from
/// outside; the rest are posted by the handler's own tasks.
pub enum QmpInteraction {
    Session(QmpSession),
    Init(QmpConnection),
    Result(QmpResult),
    Error(QmpError),
    Event(QmpEvent),
    InternalError(String),
    Timeout,
    Finish(QmpFinish),
    Quit,
}

impl QmpInteraction {
    fn kind(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Init(_) => "init",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Event(_) => "event",
            Self::InternalError(_) => "internal-error",
            Self::Timeout => "timeout",
            Self::Finish(_) => "finish",
            Self::Quit => "quit",
        }
    }
}

/// What a commander hears back about its last command
enum Feedback {
    Result(QmpResult),
    Error(QmpError),
    Internal(String),
}

/// Timing and retry knobs of a handler
#[derive(Debug, Clone)]
pub struct QmpPolicy {
    /// Attempts per command, including the first
    pub max_attempts: usize,
    /// Pause after a QMP error before resending
    pub retry_delay: Duration,
    /// Budget for connect + capabilities negotiation
    pub init_timeout: Duration,
    pub connect_attempts: usize,
    pub connect_interval: Duration,
}

impl Default for QmpPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            init_timeout: Duration::from_secs(10),
            connect_attempts: 500,
            connect_interval: Duration::from_millis(20),
        }
    }
}

impl QmpPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn connect_retry(mut self, attempts: usize, interval: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_interval = interval;
        self
    }
}

pub fn channel() -> (QmpSender, QmpReceiver) {
    mpsc::channel(QMP_CHANNEL_CAPACITY)
}

/// Start the handler for the QMP socket at `socket`.
///
/// `tx` must be the sender paired with `rx`; the handler hands clones of it
/// to its helper tasks.
pub fn spawn_handler(
    socket: PathBuf,
    hub: Hub,
    tx: QmpSender,
    rx: QmpReceiver,
    policy: QmpPolicy,
) -> JoinHandle<()> {
    tokio::spawn(run_handler(socket, hub, tx, rx, policy))
}

async fn run_handler(
    socket: PathBuf,
    hub: Hub,
    tx: QmpSender,
    mut rx: QmpReceiver,
    policy: QmpPolicy,
) {
    let mut queue: VecDeque<QmpSession> = VecDeque::new();

    let Some(conn) = initializing(&socket, &hub, &tx, &mut rx, &policy, &mut queue).await else {
        shutdown_queue(&mut rx, &mut queue, false);
        return;
    };
    info!(socket = %socket.display(), "QMP connection initialized");

    let QmpConnection { decoder, writer } = conn;
    let writer = Arc::new(Mutex::new(writer));
    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CAPACITY);
    let feedback_rx = Arc::new(Mutex::new(feedback_rx));
    let receiver = tokio::spawn(receive(decoder, tx.clone()));

    let start_head = |queue: &VecDeque<QmpSession>| -> Option<JoinHandle<()>> {
        queue.front().map(|head| {
            tokio::spawn(run_commander(
                head.commands.clone(),
                writer.clone(),
                feedback_rx.clone(),
                tx.clone(),
                policy.clone(),
            ))
        })
    };
    let mut commander = start_head(&queue);

    while let Some(msg) = rx.recv().await {
        match msg {
            QmpInteraction::Session(session) => {
                debug!(?session, "queueing QMP session");
                queue.push_back(session);
                if queue.len() == 1 {
                    commander = start_head(&queue);
                }
            }
            QmpInteraction::Finish(finish) => {
                finish_head(&mut queue, finish);
                commander = start_head(&queue);
            }
            QmpInteraction::Result(result) => forward(&feedback_tx, Feedback::Result(result)),
            QmpInteraction::Error(err) => forward(&feedback_tx, Feedback::Error(err)),
            QmpInteraction::Event(event) => {
                if event.event == QMP_EVENT_SHUTDOWN {
                    info!("got QMP shutdown event, quit QMP handler");
                    hub.post(VmEvent::VmExit).await;
                    break;
                }
                debug!(event = %event.event, data = ?event.data, "ignoring QMP event");
            }
            QmpInteraction::InternalError(reason) => {
                error!(%reason, "QMP connection failed");
                forward(&feedback_tx, Feedback::Internal(reason.clone()));
                hub.post(VmEvent::Interrupted { reason }).await;
                break;
            }
            QmpInteraction::Quit => {
                info!("quit QMP handler");
                break;
            }
            other => debug!(kind = other.kind(), "unexpected QMP interaction after init"),
        }
    }

    receiver.abort();
    drop(feedback_tx);
    if let Some(handle) = commander.take() {
        handle.abort();
    }
    shutdown_queue(&mut rx, &mut queue, true);
}

/// Wait for the initializer. Returns the connection, or None when the
/// handler must exit.
async fn initializing(
    socket: &Path,
    hub: &Hub,
    tx: &QmpSender,
    rx: &mut QmpReceiver,
    policy: &QmpPolicy,
    queue: &mut VecDeque<QmpSession>,
) -> Option<QmpConnection> {
    let init = tokio::spawn(initialize(socket.to_path_buf(), tx.clone(), policy.clone()));
    let timer = {
        let tx = tx.clone();
        let timeout = policy.init_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(QmpInteraction::Timeout).await;
        })
    };

    let outcome = loop {
        let Some(msg) = rx.recv().await else {
            break None;
        };
        match msg {
            QmpInteraction::Session(session) => {
                debug!(?session, "queueing QMP session until connected");
                queue.push_back(session);
            }
            QmpInteraction::Init(conn) => break Some(conn),
            QmpInteraction::Finish(finish) if !finish.success => {
                let reason = finish.cause();
                error!(%reason, "QMP initialize failed");
                hub.post(VmEvent::InitFailed { reason }).await;
                break None;
            }
            QmpInteraction::Timeout => {
                error!("QMP initialize timeout");
                hub.post(VmEvent::InitFailed {
                    reason: "QMP Init timeout".to_string(),
                })
                .await;
                break None;
            }
            QmpInteraction::Quit => {
                info!("quit QMP handler before init");
                break None;
            }
            other => debug!(kind = other.kind(), "unexpected QMP interaction during init"),
        }
    };

    timer.abort();
    init.abort();
    outcome
}

async fn initialize(socket: PathBuf, tx: QmpSender, policy: QmpPolicy) {
    let msg = match handshake(&socket, &policy).await {
        Ok(conn) => QmpInteraction::Init(conn),
        Err(reason) => QmpInteraction::Finish(QmpFinish::failed(reason)),
    };
    if tx.send(msg).await.is_err() {
        debug!("QMP handler gone before init finished");
    }
}

async fn handshake(socket: &Path, policy: &QmpPolicy) -> Result<QmpConnection, String> {
    let mut conn = connect_with_retry(socket, policy).await?;

    let greeting = conn
        .decoder
        .decode_value()
        .await
        .map_err(|e| format!("get QMP greeting failed: {}", e))?;
    if greeting.get("QMP").is_none() {
        return Err(format!("unexpected QMP greeting: {}", greeting));
    }

    conn.writer
        .send(&QmpCommand::new("qmp_capabilities"))
        .await
        .map_err(|e| format!("send qmp_capabilities failed: {}", e))?;

    match conn.decoder.decode().await {
        Ok(QmpMessage::Return(_)) => Ok(conn),
        Ok(other) => {
            warn!(response = ?other, "unexpected qmp_capabilities response");
            Err("handshake failed".to_string())
        }
        Err(e) => Err(format!("handshake failed: {}", e)),
    }
}

async fn connect_with_retry(socket: &Path, policy: &QmpPolicy) -> Result<QmpConnection, String> {
    let mut last_err = None;
    for attempt in 1..=policy.connect_attempts {
        match QmpConnection::connect(socket).await {
            Ok(conn) => {
                debug!(attempt, "connected to QMP socket");
                return Ok(conn);
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(policy.connect_interval).await;
            }
        }
    }
    Err(format!(
        "failed to connect to {}: {}",
        socket.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

async fn receive(mut decoder: QmpDecoder<tokio::net::unix::OwnedReadHalf>, tx: QmpSender) {
    loop {
        let (msg, last) = match decoder.decode().await {
            Ok(QmpMessage::Event(event)) => {
                let shutdown = event.event == QMP_EVENT_SHUTDOWN;
                (QmpInteraction::Event(event), shutdown)
            }
            Ok(QmpMessage::Return(result)) => (QmpInteraction::Result(result), false),
            Ok(QmpMessage::Error(err)) => (QmpInteraction::Error(err), false),
            Err(e) => (QmpInteraction::InternalError(e.to_string()), true),
        };
        if tx.send(msg).await.is_err() || last {
            return;
        }
    }
}

async fn run_commander(
    commands: Vec<QmpCommand>,
    writer: Arc<Mutex<QmpWriter>>,
    feedback: Arc<Mutex<mpsc::Receiver<Feedback>>>,
    tx: QmpSender,
    policy: QmpPolicy,
) {
    let started = Instant::now();
    let finish = execute(&commands, &writer, &feedback, &policy).await;
    metrics::QMP_SESSION_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
    if tx.send(QmpInteraction::Finish(finish)).await.is_err() {
        debug!("QMP handler gone before session finished");
    }
}

async fn execute(
    commands: &[QmpCommand],
    writer: &Mutex<QmpWriter>,
    feedback: &Mutex<mpsc::Receiver<Feedback>>,
    policy: &QmpPolicy,
) -> QmpFinish {
    let mut feedback = feedback.lock().await;

    for command in commands {
        if let Err(e) = serde_json::to_vec(command) {
            error!(command = %command.execute, error = %e, "cannot marshal command");
            return QmpFinish::failed("cannot marshal command");
        }

        let mut last_cause = None;
        let mut done = false;
        for attempt in 1..=policy.max_attempts {
            debug!(command = %command.execute, attempt, "sending QMP command");
            if let Err(e) = writer.lock().await.send(command).await {
                error!(command = %command.execute, error = %e, "failed to write QMP command");
                return QmpFinish::failed(e.to_string());
            }

            match feedback.recv().await {
                Some(Feedback::Result(_)) => {
                    metrics::QMP_COMMANDS_TOTAL
                        .with_label_values(&[command.execute.as_str(), "ok"])
                        .inc();
                    done = true;
                    break;
                }
                Some(Feedback::Error(err)) => {
                    metrics::QMP_COMMANDS_TOTAL
                        .with_label_values(&[command.execute.as_str(), "error"])
                        .inc();
                    warn!(
                        command = %command.execute,
                        attempt,
                        cause = %err.describe(),
                        "QMP command returned error"
                    );
                    last_cause = Some(err.cause);
                    if attempt < policy.max_attempts {
                        metrics::QMP_COMMAND_RETRIES_TOTAL.inc();
                        tokio::time::sleep(policy.retry_delay).await;
                    }
                }
                Some(Feedback::Internal(reason)) => {
                    warn!(%reason, "QMP connection failed while waiting for result");
                    return QmpFinish::failed(reason);
                }
                None => return QmpFinish::failed("QMP command result chan closed"),
            }
        }

        if !done {
            return QmpFinish {
                success: false,
                reason: last_cause,
            };
        }
    }

    QmpFinish::ok()
}

fn forward(feedback: &mpsc::Sender<Feedback>, msg: Feedback) {
    if let Err(e) = feedback.try_send(msg) {
        warn!(error = %e, "dropping QMP feedback with no commander waiting");
    }
}

fn finish_head(queue: &mut VecDeque<QmpSession>, finish: QmpFinish) {
    let Some(session) = queue.pop_front() else {
        warn!("QMP session finished with nothing queued");
        return;
    };
    let result = if finish.success {
        metrics::QMP_SESSIONS_TOTAL.with_label_values(&["ok"]).inc();
        Ok(())
    } else {
        metrics::QMP_SESSIONS_TOTAL.with_label_values(&["error"]).inc();
        Err(HypervisorError::Qmp(finish.cause()))
    };
    (session.respond)(result);
}

/// Answer every session still owned by an exiting handler.
///
/// Finishes that raced the exit are honored; the head session, if a
/// commander was running it, learns that its result channel closed.
fn shutdown_queue(rx: &mut QmpReceiver, queue: &mut VecDeque<QmpSession>, head_in_flight: bool) {
    rx.close();
    let mut head_in_flight = head_in_flight && !queue.is_empty();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            QmpInteraction::Finish(finish) if head_in_flight => {
                finish_head(queue, finish);
                head_in_flight = false;
            }
            QmpInteraction::Session(session) => queue.push_back(session),
            _ => {}
        }
    }

    if head_in_flight {
        if let Some(session) = queue.pop_front() {
            metrics::QMP_SESSIONS_TOTAL.with_label_values(&["error"]).inc();
            (session.respond)(Err(HypervisorError::Qmp(
                "QMP command result chan closed".to_string(),
            )));
        }
    }
    if !queue.is_empty() {
        debug!(pending = queue.len(), "failing QMP sessions left by exiting handler");
    }
    for session in queue.drain(..) {
        metrics::QMP_SESSIONS_TOTAL.with_label_values(&["error"]).inc();
        (session.respond)(Err(HypervisorError::QmpHandlerExited));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_cause() {
        assert_eq!(QmpFinish::failed("boom").cause(), "boom");
        let finish = QmpFinish {
            success: false,
            reason: json!({"class": "GenericError", "desc": "Device busy"})
                .as_object()
                .cloned(),
        };
        assert_eq!(finish.cause(), "Device busy");
        assert_eq!(QmpFinish::ok().cause(), "unknown QMP failure");
    }

    #[test]
    fn test_policy_builder() {
        let policy = QmpPolicy::new()
            .max_attempts(0)
            .retry_delay(Duration::from_millis(5))
            .init_timeout(Duration::from_millis(200))
            .connect_retry(10, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.retry_delay, Duration::from_millis(5));
        assert_eq!(policy.connect_attempts, 10);
    }

    #[tokio::test]
    async fn test_init_timeout_fails_queued_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, mut events) = crate::hypervisor::events::channel();
        let (tx, rx) = channel();
        let policy = QmpPolicy::new()
            .init_timeout(Duration::from_millis(100))
            .connect_retry(1000, Duration::from_millis(10));
        let handle = spawn_handler(dir.path().join("qmp.sock"), hub, tx.clone(), rx, policy);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tx.send(QmpInteraction::Session(QmpSession::new(
            vec![QmpCommand::new("stop")],
            move |r| {
                let _ = done_tx.send(r);
            },
        )))
        .await
        .unwrap();

        assert_eq!(
            events.recv().await,
            Some(VmEvent::InitFailed {
                reason: "QMP Init timeout".to_string()
            })
        );
        assert_eq!(done_rx.await.unwrap(), Err(HypervisorError::QmpHandlerExited));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_before_init() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, _events) = crate::hypervisor::events::channel();
        let (tx, rx) = channel();
        let handle = spawn_handler(
            dir.path().join("qmp.sock"),
            hub,
            tx.clone(),
            rx,
            QmpPolicy::default(),
        );
        tx.send(QmpInteraction::Quit).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
