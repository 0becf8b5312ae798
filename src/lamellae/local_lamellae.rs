use super::{Backend, CmdQStatus, LamellaeComm};
use crate::messages::Envelope;
use crate::runtime::Runtime;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// The in-memory queues connecting every node of one process
#[derive(Debug)]
pub(crate) struct LocalFabric {
    queues: Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)>,
}

impl LocalFabric {
    pub(crate) fn new(num_nodes: usize) -> Arc<LocalFabric> {
        Arc::new(LocalFabric {
            queues: (0..num_nodes).map(|_| unbounded()).collect(),
        })
    }

    pub(crate) fn num_nodes(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn endpoint(self: &Arc<Self>, node: usize) -> Local {
        Local {
            node,
            num_nodes: self.num_nodes(),
            peers: self.queues.iter().map(|(tx, _)| tx.clone()).collect(),
            inbox: self.queues[node].1.clone(),
            active: Arc::new(AtomicU8::new(CmdQStatus::Active as u8)),
            sent: AtomicUsize::new(0),
            held: Mutex::new(HashMap::new()),
        }
    }
}

pub(crate) struct Local {
    node: usize,
    num_nodes: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
    active: Arc<AtomicU8>,
    sent: AtomicUsize,
    // paused links: messages for dst wait here, in send order, until the link resumes
    held: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Local {{ node: {}, num_nodes: {}, active: {:?} }}",
            self.node, self.num_nodes, self.active
        )
    }
}

impl Local {
    pub(crate) async fn recv_data(&self, runtime: Weak<Runtime>) {
        while self.active.load(Ordering::SeqCst) == CmdQStatus::Active as u8 {
            match self.inbox.try_recv() {
                Ok(data) => {
                    let runtime = match runtime.upgrade() {
                        Some(runtime) => runtime,
                        None => break,
                    };
                    match crate::deserialize::<Envelope>(&data) {
                        Ok(envelope) => runtime.handle_message(envelope.src, envelope.msg),
                        Err(e) => tracing::error!(node = self.node, error = %e, "dropping malformed message"),
                    }
                }
                Err(TryRecvError::Empty) => futures_lite::future::yield_now().await,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        tracing::debug!(node = self.node, pending = self.inbox.len(), "receive task finished");
        self.active
            .store(CmdQStatus::Finished as u8, Ordering::SeqCst);
    }
}

impl LamellaeComm for Local {
    fn my_node(&self) -> usize {
        self.node
    }
    fn num_nodes(&self) -> usize {
        self.num_nodes
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
    fn send_to_node(&self, dst: usize, data: Vec<u8>) -> Result<(), anyhow::Error> {
        let peer = self
            .peers
            .get(dst)
            .ok_or_else(|| anyhow::anyhow!("node {} outside of a {} node fabric", dst, self.num_nodes))?;
        self.sent.fetch_add(data.len(), Ordering::Relaxed);
        let mut held = self.held.lock();
        match held.get_mut(&dst) {
            Some(queue) => queue.push(data),
            None => peer.send(data)?,
        }
        Ok(())
    }
    fn pause_link(&self, dst: usize) {
        self.held.lock().entry(dst).or_default();
    }
    fn resume_link(&self, dst: usize) -> Result<(), anyhow::Error> {
        let mut held = self.held.lock();
        if let Some(queue) = held.remove(&dst) {
            let peer = self
                .peers
                .get(dst)
                .ok_or_else(|| anyhow::anyhow!("node {} outside of a {} node fabric", dst, self.num_nodes))?;
            for data in queue {
                peer.send(data)?;
            }
        }
        Ok(())
    }
    fn held_messages(&self, dst: usize) -> usize {
        self.held.lock().get(&dst).map_or(0, |queue| queue.len())
    }
    fn bytes_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
    fn shutdown(&self) {
        let _ = self.active.compare_exchange(
            CmdQStatus::Active as u8,
            CmdQStatus::ShuttingDown as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        while self.active.load(Ordering::SeqCst) != CmdQStatus::Finished as u8 {
            std::thread::yield_now();
        }
    }
}
