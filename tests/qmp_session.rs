// QMP handler against a scripted QMP server on a unix socket

use futures::future::join_all;
use hyperpod_orchestrator::hypervisor::events::{self, VmEvent};
use hyperpod_orchestrator::hypervisor::{
    BootConfig, DiskDescriptor, HypervisorDriver, HypervisorError, PersistedMap, VmContext,
};
use hyperpod_orchestrator::qemu::handler::{self, QmpInteraction, QmpPolicy, QmpSession};
use hyperpod_orchestrator::qemu::qmp::{QmpCommand, QmpDecoder};
use hyperpod_orchestrator::qemu::QemuDriver;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Log = Arc<Mutex<Vec<String>>>;

/// Answer for one received command (capabilities negotiation excluded)
type Script = Box<dyn FnMut(&str) -> Value + Send>;

fn ok() -> Value {
    json!({"return": {}})
}

fn generic_error(desc: &str) -> Value {
    json!({"error": {"class": "GenericError", "desc": desc}})
}

/// Serve one QMP client: greeting, capabilities, then `script` for every
/// command. Each received command name is appended to `log`.
fn serve(socket: &Path, log: Log, mut script: Script) -> JoinHandle<Vec<Value>> {
    let listener = UnixListener::bind(socket).unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        write
            .write_all(br#"{"QMP": {"version": {"qemu": {"major": 2}}, "capabilities": []}}"#)
            .await
            .unwrap();

        let mut decoder = QmpDecoder::new(read);
        let mut received = Vec::new();
        while let Ok(command) = decoder.decode_value().await {
            let name = command["execute"].as_str().unwrap_or_default().to_string();
            let reply = if name == "qmp_capabilities" {
                ok()
            } else {
                log.lock().unwrap().push(format!("recv {}", name));
                received.push(command.clone());
                tokio::time::sleep(Duration::from_millis(5)).await;
                script(&name)
            };
            if write
                .write_all(format!("{}\r\n", reply).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
        received
    })
}

fn fast_policy() -> QmpPolicy {
    QmpPolicy::new()
        .retry_delay(Duration::from_millis(10))
        .init_timeout(Duration::from_secs(5))
        .connect_retry(200, Duration::from_millis(10))
}

struct Harness {
    tx: handler::QmpSender,
    events: events::HubReceiver,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

fn start(log: Log, script: Script) -> (Harness, JoinHandle<Vec<Value>>) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    let server = serve(&socket, log, script);
    let (hub, events) = events::channel();
    let (tx, rx) = handler::channel();
    let handle = handler::spawn_handler(socket, hub, tx.clone(), rx, fast_policy());
    (
        Harness {
            tx,
            events,
            handle,
            _dir: dir,
        },
        server,
    )
}

async fn submit(
    tx: &handler::QmpSender,
    commands: Vec<QmpCommand>,
    log: Option<(Log, String)>,
) -> oneshot::Receiver<Result<(), HypervisorError>> {
    let (done_tx, done_rx) = oneshot::channel();
    let session = QmpSession::new(commands, move |outcome| {
        if let Some((log, name)) = log {
            log.lock().unwrap().push(format!("done {}", name));
        }
        let _ = done_tx.send(outcome);
    });
    tx.send(QmpInteraction::Session(session)).await.unwrap();
    done_rx
}

#[tokio::test]
async fn test_sessions_never_overlap() {
    let log: Log = Arc::default();
    let (harness, _server) = start(log.clone(), Box::new(|_| ok()));

    let mut pending = Vec::new();
    for i in 0..5 {
        let name = format!("cmd-{}", i);
        pending.push(
            submit(
                &harness.tx,
                vec![QmpCommand::new(name.clone())],
                Some((log.clone(), name)),
            )
            .await,
        );
    }
    for outcome in join_all(pending).await {
        assert_eq!(outcome.unwrap(), Ok(()));
    }

    // every command is answered before the next session reaches the wire
    let expected: Vec<String> = (0..5)
        .flat_map(|i| [format!("recv cmd-{}", i), format!("done cmd-{}", i)])
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);

    harness.tx.send(QmpInteraction::Quit).await.unwrap();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_failed_command_stops_session() {
    let log: Log = Arc::default();
    let script: Script = Box::new(|name| {
        if name == "device_add" {
            generic_error("Duplicate ID 'scsi-disk1'")
        } else {
            ok()
        }
    });
    let (harness, _server) = start(log.clone(), script);

    let outcome = submit(
        &harness.tx,
        vec![
            QmpCommand::new("stop"),
            QmpCommand::new("device_add"),
            QmpCommand::new("cont"),
        ],
        None,
    )
    .await
    .await
    .unwrap();

    assert_eq!(
        outcome,
        Err(HypervisorError::Qmp("Duplicate ID 'scsi-disk1'".to_string()))
    );
    assert_eq!(
        *log.lock().unwrap(),
        vec!["recv stop", "recv device_add", "recv device_add", "recv device_add"]
    );

    // the handler keeps serving after a failed session
    let next = submit(&harness.tx, vec![QmpCommand::new("cont")], None).await;
    assert_eq!(next.await.unwrap(), Ok(()));

    harness.tx.send(QmpInteraction::Quit).await.unwrap();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_third_attempt_succeeds() {
    let log: Log = Arc::default();
    let mut failures = 2;
    let script: Script = Box::new(move |_| {
        if failures > 0 {
            failures -= 1;
            generic_error("Device 'scsi0.0' is busy")
        } else {
            ok()
        }
    });
    let (harness, _server) = start(log.clone(), script);

    let outcome = submit(&harness.tx, vec![QmpCommand::new("device_del")], None)
        .await
        .await
        .unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(log.lock().unwrap().len(), 3);

    harness.tx.send(QmpInteraction::Quit).await.unwrap();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_event_exits_handler() {
    let log: Log = Arc::default();
    let script: Script = Box::new(|_| {
        json!({
            "event": "SHUTDOWN",
            "timestamp": {"seconds": 1700000000, "microseconds": 5},
            "data": {"guest": true}
        })
    });
    let (mut harness, _server) = start(log, script);

    let quit = submit(&harness.tx, vec![QmpCommand::new("quit")], None).await;
    assert_eq!(harness.events.recv().await, Some(VmEvent::VmExit));
    harness.handle.await.unwrap();

    // the in-flight session learns its result channel closed
    assert!(quit.await.unwrap().is_err());
}

#[tokio::test]
async fn test_connection_loss_interrupts() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(br#"{"QMP": {}}"#).await.unwrap();
        let mut decoder = QmpDecoder::new(read);
        decoder.decode_value().await.unwrap();
        write.write_all(br#"{"return": {}}"#).await.unwrap();
        // wait for the first real command, then hang up
        decoder.decode_value().await.unwrap();
    });

    let (hub, mut events) = events::channel();
    let (tx, rx) = handler::channel();
    let handle = handler::spawn_handler(socket, hub, tx.clone(), rx, fast_policy());

    let outcome = submit(&tx, vec![QmpCommand::new("stop")], None).await;
    server.await.unwrap();

    match events.recv().await {
        Some(VmEvent::Interrupted { .. }) => {}
        other => panic!("expected Interrupted, got {:?}", other),
    }
    assert!(outcome.await.unwrap().is_err());
    handle.await.unwrap();
}

fn persisted(qmp_sock: &Path, log: PathBuf) -> PersistedMap {
    json!({
        "hypervisor": "qemu",
        "qmpSock": qmp_sock,
        "pid": std::process::id(),
        "log": {"name": log, "offset": 0},
    })
    .as_object()
    .cloned()
    .unwrap()
}

#[tokio::test]
async fn test_add_disk_on_running_context() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    let log: Log = Arc::default();
    let server = serve(&socket, log.clone(), Box::new(|_| ok()));

    let driver = QemuDriver::new("/usr/bin/qemu-system-x86_64").with_policy(fast_policy());
    let state = persisted(&socket, dir.path().join("qemu.log"));
    let (ctx, _events) = VmContext::load("vm-disk", BootConfig::default(), dir.path(), &driver, &state)
        .await
        .unwrap();
    ctx.associate().await;

    let disk = DiskDescriptor {
        name: "vol-1".to_string(),
        filename: "/dev/dm-7".to_string(),
        format: "raw".to_string(),
        scsi_id: 1,
        ..Default::default()
    };
    let (result_tx, mut result_rx) = mpsc::channel(4);
    ctx.add_disk("volume", &disk, result_tx).await;

    assert_eq!(
        result_rx.recv().await,
        Some(VmEvent::BlockdevInserted {
            name: "vol-1".to_string(),
            source_type: "volume".to_string(),
            device_name: "sdb".to_string(),
            scsi_id: 1,
            scsi_addr: "0:1".to_string(),
        })
    );
    // result_tx moved into the session; nothing else arrives
    assert_eq!(result_rx.recv().await, None);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["recv human-monitor-command", "recv device_add"]
    );

    ctx.close().await;
    let received = server.await.unwrap();
    assert_eq!(received[1]["arguments"]["id"], "scsi-disk1");
    assert_eq!(driver.name(), "qemu");
}
