// Xen domain table
//
// Key invariants:
// - the domid -> Hub map is owned by one actor task, nothing else touches it
// - a domain's VmExit is posted at most once: Died removes the entry before
//   posting, and a later Died for the same domid finds nothing

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hypervisor::events::{Hub, VmEvent};

const TABLE_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum DomainMessage {
    Register { domid: i32, hub: Hub },
    Unregister { domid: i32 },
    Died { domid: i32 },
    Len { reply: oneshot::Sender<usize> },
}

/// Handle on the domain table actor
#[derive(Debug, Clone)]
pub struct DomainTable {
    tx: mpsc::Sender<DomainMessage>,
}

impl DomainTable {
    /// Start the actor. It runs until every handle is dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(TABLE_CAPACITY);
        let task = tokio::spawn(run(rx));
        (Self { tx }, task)
    }

    async fn send(&self, message: DomainMessage) {
        if let Err(e) = self.tx.send(message).await {
            warn!(message = ?e.0, "domain table is gone");
        }
    }

    pub async fn register(&self, domid: i32, hub: Hub) {
        self.send(DomainMessage::Register { domid, hub }).await
    }

    pub async fn unregister(&self, domid: i32) {
        self.send(DomainMessage::Unregister { domid }).await
    }

    /// Report that `domid` is gone.
    pub async fn died(&self, domid: i32) {
        self.send(DomainMessage::Died { domid }).await
    }

    /// Number of registered domains
    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(DomainMessage::Len { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn run(mut rx: mpsc::Receiver<DomainMessage>) {
    let mut domains: HashMap<i32, Hub> = HashMap::new();
    while let Some(message) = rx.recv().await {
        match message {
            DomainMessage::Register { domid, hub } => {
                debug!(domid, "register xen domain");
                if domains.insert(domid, hub).is_some() {
                    warn!(domid, "xen domain registered twice");
                }
            }
            DomainMessage::Unregister { domid } => {
                debug!(domid, "unregister xen domain");
                domains.remove(&domid);
            }
            DomainMessage::Died { domid } => match domains.remove(&domid) {
                Some(hub) => {
                    info!(domid, "xen domain died");
                    hub.post(VmEvent::VmExit).await;
                }
                None => debug!(domid, "death of unknown xen domain"),
            },
            DomainMessage::Len { reply } => {
                let _ = reply.send(domains.len());
            }
        }
    }
    debug!("domain table stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::events;

    #[tokio::test]
    async fn test_died_posts_exit_once() {
        let (table, _task) = DomainTable::spawn();
        let (hub, mut rx) = events::channel();
        table.register(3, hub).await;
        assert_eq!(table.len().await, 1);

        table.died(3).await;
        table.died(3).await;
        assert!(table.is_empty().await);
        assert_eq!(rx.recv().await, Some(VmEvent::VmExit));
        // the table dropped the hub with the entry
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_unregistered_domain_is_silent() {
        let (table, _task) = DomainTable::spawn();
        let (hub, mut rx) = events::channel();
        table.register(5, hub).await;
        table.unregister(5).await;
        table.died(5).await;
        assert!(table.is_empty().await);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_actor_stops_with_last_handle() {
        let (table, task) = DomainTable::spawn();
        drop(table);
        task.await.unwrap();
    }
}
