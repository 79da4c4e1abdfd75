use std::sync::Arc;

use bpf_common::{MapRegistry, Pid, ProbeManager};
use tokio::sync::{mpsc, oneshot};

use crate::{
    entry::ProcessResolverEntry, error::SnapshotError, resolver::ProcessResolver,
};

/// Move the resolver to a dedicated blocking thread and return a handle to it.
///
/// Kernel map operations are blocking syscalls, so requests are served off
/// the async executor. The thread stops once every handle is dropped.
pub fn start_process_resolver<P>(resolver: ProcessResolver<P>) -> ProcessResolverHandle
where
    P: MapRegistry + ProbeManager + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || run(resolver, rx));
    ProcessResolverHandle { tx }
}

#[derive(Clone)]
pub struct ProcessResolverHandle {
    tx: mpsc::UnboundedSender<ResolverRequest>,
}

enum ResolverRequest {
    Resolve {
        pid: Pid,
        tx_reply: oneshot::Sender<Option<Arc<ProcessResolverEntry>>>,
    },
    AddEntry {
        pid: Pid,
        entry: ProcessResolverEntry,
    },
    DelEntry {
        pid: Pid,
    },
    Snapshot {
        tx_reply: oneshot::Sender<Result<(), SnapshotError>>,
    },
    Entries {
        tx_reply: oneshot::Sender<Vec<(Pid, Arc<ProcessResolverEntry>)>>,
    },
}

impl ProcessResolverHandle {
    pub async fn resolve(&self, pid: Pid) -> Option<Arc<ProcessResolverEntry>> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(ResolverRequest::Resolve { pid, tx_reply });
        rx_reply.await.ok().flatten()
    }

    pub async fn snapshot(&self) -> Result<(), SnapshotError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(ResolverRequest::Snapshot { tx_reply });
        rx_reply
            .await
            .unwrap_or(Err(SnapshotError::ResolverStopped))
    }

    pub fn add_entry(&self, pid: Pid, entry: ProcessResolverEntry) {
        self.send(ResolverRequest::AddEntry { pid, entry });
    }

    pub fn del_entry(&self, pid: Pid) {
        self.send(ResolverRequest::DelEntry { pid });
    }

    /// Cached identities, sorted by pid.
    pub async fn entries(&self) -> Vec<(Pid, Arc<ProcessResolverEntry>)> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.send(ResolverRequest::Entries { tx_reply });
        rx_reply.await.unwrap_or_default()
    }

    fn send(&self, request: ResolverRequest) {
        if self.tx.send(request).is_err() {
            log::warn!("process resolver is not running");
        }
    }
}

fn run<P: MapRegistry + ProbeManager>(
    mut resolver: ProcessResolver<P>,
    mut rx: mpsc::UnboundedReceiver<ResolverRequest>,
) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            ResolverRequest::Resolve { pid, tx_reply } => {
                let _ = tx_reply.send(resolver.resolve(pid));
            }
            ResolverRequest::AddEntry { pid, entry } => resolver.add_entry(pid, entry),
            ResolverRequest::DelEntry { pid } => resolver.del_entry(pid),
            ResolverRequest::Snapshot { tx_reply } => {
                let _ = tx_reply.send(resolver.snapshot());
            }
            ResolverRequest::Entries { tx_reply } => {
                let _ = tx_reply.send(resolver.entries());
            }
        }
    }
    log::debug!("process resolver stopped");
}
