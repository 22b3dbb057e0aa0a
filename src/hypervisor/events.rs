//! VM events and the per-VM event hub
//!
//! Every driver reports lifecycle changes by posting a [`VmEvent`] to the
//! VM's [`Hub`]. Device operations report through their own result channel
//! ([`EventSender`]) instead, and scalar operations through a oneshot
//! ([`ErrorSender`]).

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::hypervisor::error::HypervisorError;
use crate::metrics;

/// Capacity of the hub channel
pub const HUB_CAPACITY: usize = 128;

/// Result channel of a device operation
pub type EventSender = mpsc::Sender<VmEvent>;

/// Result channel of a scalar operation
pub type ErrorSender = oneshot::Sender<Result<(), HypervisorError>>;

/// A network interface prepared on the host for a guest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceCreated {
    pub index: u32,
    pub pci_addr: u32,
    pub bridge: String,
    pub host_device: String,
    pub device_name: String,
    pub mac_addr: String,
    pub ip_addr: String,
    pub net_mask: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    VmStartFail {
        message: String,
    },
    VmExit,
    VmKilled {
        success: bool,
    },
    VmTimeout,
    InitFailed {
        reason: String,
    },
    BlockdevInserted {
        name: String,
        source_type: String,
        device_name: String,
        scsi_id: u32,
        scsi_addr: String,
    },
    BlockdevRemoved {
        name: String,
    },
    NetDevInserted {
        id: String,
        index: u32,
        device_name: String,
        address: u32,
        tap_fd: i32,
    },
    NetDevRemoved {
        index: u32,
    },
    InterfaceCreated(InterfaceCreated),
    /// A device operation failed; `session` is the event the caller asked
    /// to receive on success, if any.
    DeviceFailed {
        session: Option<Box<VmEvent>>,
    },
    Interrupted {
        reason: String,
    },
}

impl VmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VmStartFail { .. } => "EVENT_VM_START_FAILED",
            Self::VmExit => "EVENT_VM_EXIT",
            Self::VmKilled { .. } => "EVENT_VM_KILL",
            Self::VmTimeout => "EVENT_VM_TIMEOUT",
            Self::InitFailed { .. } => "ERROR_INIT_FAIL",
            Self::BlockdevInserted { .. } => "EVENT_BLOCK_INSERTED",
            Self::BlockdevRemoved { .. } => "EVENT_BLOCK_EJECTED",
            Self::NetDevInserted { .. } => "EVENT_INTERFACE_INSERTED",
            Self::NetDevRemoved { .. } => "EVENT_INTERFACE_EJECTED",
            Self::InterfaceCreated(_) => "EVENT_INTERFACE_ADD",
            Self::DeviceFailed { .. } => "EVENT_DEVICE_FAILED",
            Self::Interrupted { .. } => "ERROR_INTERRUPTED",
        }
    }

    /// True for events after which the VM is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::VmExit | Self::VmKilled { .. } | Self::VmStartFail { .. } | Self::InitFailed { .. }
        )
    }

    pub fn device_failed(callback: Option<VmEvent>) -> Self {
        Self::DeviceFailed {
            session: callback.map(Box::new),
        }
    }
}

/// Sending side of a VM's event stream
#[derive(Debug, Clone)]
pub struct Hub {
    tx: mpsc::Sender<VmEvent>,
}

pub type HubReceiver = mpsc::Receiver<VmEvent>;

/// Create a hub and its single consumer end.
pub fn channel() -> (Hub, HubReceiver) {
    let (tx, rx) = mpsc::channel(HUB_CAPACITY);
    (Hub { tx }, rx)
}

impl Hub {
    pub async fn post(&self, event: VmEvent) {
        debug!(event = event.name(), "posting vm event");
        metrics::HUB_EVENTS_TOTAL
            .with_label_values(&[event.name()])
            .inc();
        if let Err(e) = self.tx.send(event).await {
            warn!(event = e.0.name(), "vm event consumer is gone, dropping event");
        }
    }

    /// Best-effort post usable outside an async context.
    pub fn try_post(&self, event: VmEvent) {
        debug!(event = event.name(), "posting vm event");
        metrics::HUB_EVENTS_TOTAL
            .with_label_values(&[event.name()])
            .inc();
        deliver(&self.tx, event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Send without awaiting. A full channel hands the send to the runtime; a
/// closed one is logged.
pub fn deliver(tx: &mpsc::Sender<VmEvent>, event: VmEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let tx = tx.clone();
                    handle.spawn(async move {
                        if let Err(e) = tx.send(event).await {
                            warn!(event = e.0.name(), "event receiver is gone, dropping event");
                        }
                    });
                }
                Err(_) => warn!(event = event.name(), "event channel full, dropping event"),
            }
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            warn!(event = event.name(), "event receiver is gone, dropping event");
        }
    }
}

/// Report a scalar result; a dropped receiver is logged.
pub fn reply(tx: ErrorSender, result: Result<(), HypervisorError>) {
    if tx.send(result).is_err() {
        debug!("result receiver dropped before reply");
    }
}

/// Device-operation respond: `callback` on success, `DeviceFailed` otherwise.
pub fn device_respond(
    device: &'static str,
    result: EventSender,
    callback: Option<VmEvent>,
) -> impl FnOnce(Result<(), HypervisorError>) + Send + 'static {
    move |outcome| match outcome {
        Ok(()) => {
            metrics::HOTPLUG_OPERATIONS_TOTAL
                .with_label_values(&[device, "ok"])
                .inc();
            if let Some(event) = callback {
                deliver(&result, event);
            }
        }
        Err(e) => {
            metrics::HOTPLUG_OPERATIONS_TOTAL
                .with_label_values(&[device, "error"])
                .inc();
            warn!(device, error = %e, "device operation failed");
            deliver(&result, VmEvent::device_failed(callback));
        }
    }
}
