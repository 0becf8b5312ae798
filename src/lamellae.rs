use crate::runtime::Runtime;

use enum_dispatch::enum_dispatch;
use std::sync::Weak;

pub(crate) mod local_lamellae;
pub(crate) use local_lamellae::{Local, LocalFabric};

/// The list of available lamellae backends, used to specify how messages travel between nodes
#[derive(
    serde::Serialize,
    serde::Deserialize,
    Debug,
    PartialEq,
    Eq,
    Ord,
    PartialOrd,
    Hash,
    Clone,
    Copy,
    Default,
)]
pub enum Backend {
    /// The Local backend -- every node lives in this process and messages cross in-memory queues
    #[default]
    Local,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CmdQStatus {
    Active = 1,
    ShuttingDown = 2,
    Finished = 3,
}

#[enum_dispatch]
pub(crate) trait LamellaeComm {
    fn my_node(&self) -> usize;
    fn num_nodes(&self) -> usize;
    fn backend(&self) -> Backend;
    /// queue already serialized bytes for `dst`
    fn send_to_node(&self, dst: usize, data: Vec<u8>) -> Result<(), anyhow::Error>;
    fn bytes_sent(&self) -> usize;
    /// hold messages for `dst` until [resume_link][LamellaeComm::resume_link]
    fn pause_link(&self, dst: usize);
    fn resume_link(&self, dst: usize) -> Result<(), anyhow::Error>;
    fn held_messages(&self, dst: usize) -> usize;
    /// stop the receive task and wait for it to drain
    fn shutdown(&self);
}

#[enum_dispatch(LamellaeComm)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
}

impl Lamellae {
    /// Delivers incoming messages to `runtime` until shutdown; meant to run as an executor task
    pub(crate) async fn recv_data(&self, runtime: Weak<Runtime>) {
        match self {
            Lamellae::Local(local) => local.recv_data(runtime).await,
        }
    }
}
