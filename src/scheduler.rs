use enum_dispatch::enum_dispatch;
use futures::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub(crate) mod work_stealing;
use work_stealing::WorkStealing;

pub(crate) const WORKER_THREAD_NAME: &str = "worker_thread";

/// true when the calling thread belongs to some node's executor
pub(crate) fn on_worker_thread() -> bool {
    std::thread::current().name() == Some(WORKER_THREAD_NAME)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SchedulerStatus {
    Active,
    Finished,
    Panic,
}

/// The available worker thread scheduling algorithms
#[derive(Debug, Clone, Copy, Default)]
pub enum ExecutorType {
    #[default]
    WorkStealing,
}

#[enum_dispatch]
pub(crate) trait TaskQueue {
    fn spawn_task<F>(&self, future: F) -> async_task::Task<F::Output, usize>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
    fn submit_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
    fn exec_task(&self) -> bool;
    fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
    fn shutdown(&self);
    fn num_workers(&self) -> usize;
}

#[enum_dispatch(TaskQueue)]
#[derive(Debug)]
pub(crate) enum Executor {
    WorkStealing,
}

pub(crate) fn create_executor(
    executor: ExecutorType,
    node: usize,
    num_workers: usize,
) -> Executor {
    let status = Arc::new(AtomicU8::new(SchedulerStatus::Active as u8));
    match executor {
        ExecutorType::WorkStealing => {
            Executor::WorkStealing(WorkStealing::new(node, num_workers, status))
        }
    }
}

impl Executor {
    pub(crate) fn panicked(&self) -> bool {
        match self {
            Executor::WorkStealing(ws) => {
                ws.status.load(Ordering::SeqCst) == SchedulerStatus::Panic as u8
            }
        }
    }
}
