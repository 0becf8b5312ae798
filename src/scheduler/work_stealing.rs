use crate::scheduler::{SchedulerStatus, TaskQueue, WORKER_THREAD_NAME};
use crate::warnings::RuntimeWarning;

use async_task::{Builder, Runnable, Task};
use crossbeam::deque::{Injector, Stealer, Worker};
use crossbeam::utils::Backoff;
use futures::Future;
use rand::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use tracing::{trace_span, Instrument};

static TASK_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub(crate) struct WorkStealingThread {
    node: usize,
    work_inj: Arc<Injector<Runnable<usize>>>,
    work_stealers: Vec<Stealer<Runnable<usize>>>,
    work_q: Worker<Runnable<usize>>,
    status: Arc<AtomicU8>,
}

impl WorkStealingThread {
    #[tracing::instrument(skip_all, level = "debug")]
    fn run(worker: WorkStealingThread, active_cnt: Arc<AtomicUsize>) -> thread::JoinHandle<()> {
        let builder = thread::Builder::new().name(WORKER_THREAD_NAME.into());
        let spawned = builder.spawn(move || {
            let _span = trace_span!("WorkStealingThread::run", node = worker.node).entered();
            active_cnt.fetch_add(1, Ordering::SeqCst);
            let mut rng = rand::thread_rng();
            let backoff = Backoff::new();
            while worker.status.load(Ordering::SeqCst) == SchedulerStatus::Active as u8
                || !(worker.work_q.is_empty() && worker.work_inj.is_empty())
            {
                if worker.status.load(Ordering::SeqCst) == SchedulerStatus::Panic as u8 {
                    break;
                }
                let omsg = worker.work_q.pop().or_else(|| {
                    std::iter::repeat_with(|| {
                        worker
                            .work_inj
                            .steal_batch_and_pop(&worker.work_q)
                            .or_else(|| match worker.work_stealers.choose(&mut rng) {
                                Some(stealer) => stealer.steal(),
                                None => crossbeam::deque::Steal::Empty,
                            })
                    })
                    .find(|s| !s.is_retry())
                    .and_then(|s| s.success())
                });

                match omsg {
                    Some(runnable) => {
                        backoff.reset();
                        run_catching(runnable, &worker.status);
                    }
                    None => backoff.snooze(),
                }
            }
            active_cnt.fetch_sub(1, Ordering::SeqCst);
        });
        match spawned {
            Ok(handle) => handle,
            Err(e) => panic!("unable to spawn executor worker thread: {:?}", e),
        }
    }
}

fn run_catching(runnable: Runnable<usize>, status: &AtomicU8) {
    let task_id = *runnable.metadata();
    if panic::catch_unwind(AssertUnwindSafe(|| runnable.run())).is_err() {
        tracing::error!(task_id, "task panicked, halting executor");
        status.store(SchedulerStatus::Panic as u8, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct WorkStealing {
    node: usize,
    max_num_threads: usize,
    threads: Vec<thread::JoinHandle<()>>,
    work_inj: Arc<Injector<Runnable<usize>>>,
    work_stealers: Vec<Stealer<Runnable<usize>>>,
    pub(crate) status: Arc<AtomicU8>,
    active_cnt: Arc<AtomicUsize>,
}

impl TaskQueue for WorkStealing {
    fn spawn_task<F>(&self, task: F) -> Task<F::Output, usize>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task_id = TASK_ID.fetch_add(1, Ordering::Relaxed);
        let work_inj = self.work_inj.clone();
        let schedule = move |runnable| work_inj.push(runnable);
        let node = self.node;
        let (runnable, task) = Builder::new().metadata(task_id).spawn(
            move |_task_id| {
                async move { task.await }.instrument(trace_span!(
                    "Spawned Task",
                    task_id = task_id,
                    node = node
                ))
            },
            schedule,
        );
        runnable.schedule();
        task
    }

    fn submit_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_id = TASK_ID.fetch_add(1, Ordering::Relaxed);
        let work_inj = self.work_inj.clone();
        let schedule = move |runnable| work_inj.push(runnable);
        let node = self.node;
        let (runnable, task) = Builder::new().metadata(task_id).spawn(
            move |_task_id| {
                async move { task.await }.instrument(trace_span!(
                    "Submitted Task",
                    task_id = task_id,
                    node = node
                ))
            },
            schedule,
        );
        runnable.schedule();
        task.detach();
    }

    #[tracing::instrument(skip_all, level = "trace")]
    fn exec_task(&self) -> bool {
        let ret = std::iter::repeat_with(|| {
            self.work_inj.steal().or_else(|| {
                let mut rng = rand::thread_rng();
                match self.work_stealers.choose(&mut rng) {
                    Some(stealer) => stealer.steal(),
                    None => crossbeam::deque::Steal::Empty,
                }
            })
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success());
        match ret {
            Some(runnable) => {
                run_catching(runnable, &self.status);
                true
            }
            None => false,
        }
    }

    fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if crate::scheduler::on_worker_thread() {
            RuntimeWarning::BlockOnWorker("block_on").print();
        }
        let mut task = self.spawn_task(fut);
        let backoff = Backoff::new();
        let timer = std::time::Instant::now();
        let mut warned = false;
        while !task.is_finished() {
            if self.status.load(Ordering::SeqCst) == SchedulerStatus::Panic as u8 {
                panic!("node {} executor panicked while blocking on a task", self.node);
            }
            if self.exec_task() {
                backoff.reset();
            } else {
                backoff.snooze();
            }
            if !warned {
                let elapsed = timer.elapsed().as_secs_f64();
                if elapsed > crate::config().deadlock_timeout {
                    RuntimeWarning::BlockingWait("block_on", elapsed).print();
                    warned = true;
                }
            }
        }
        let cx = &mut Context::from_waker(futures::task::noop_waker_ref());
        match Pin::new(&mut task).poll(cx) {
            Poll::Ready(output) => output,
            Poll::Pending => panic!("node {} block_on task finished but not ready", self.node),
        }
    }

    #[tracing::instrument(skip_all, level = "debug")]
    fn shutdown(&self) {
        self.status
            .compare_exchange(
                SchedulerStatus::Active as u8,
                SchedulerStatus::Finished as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
        while self.active_cnt.load(Ordering::Relaxed) > 0 {
            self.exec_task();
            std::thread::yield_now()
        }
    }

    fn num_workers(&self) -> usize {
        self.max_num_threads
    }
}

impl WorkStealing {
    pub(crate) fn new(node: usize, num_workers: usize, status: Arc<AtomicU8>) -> WorkStealing {
        let mut ws = WorkStealing {
            node,
            max_num_threads: std::cmp::max(1, num_workers),
            threads: Vec::new(),
            work_inj: Arc::new(Injector::new()),
            work_stealers: Vec::new(),
            status,
            active_cnt: Arc::new(AtomicUsize::new(0)),
        };
        ws.init();
        ws
    }

    fn init(&mut self) {
        let mut work_workers: Vec<Worker<Runnable<usize>>> = vec![];
        for _i in 0..self.max_num_threads {
            let work_worker: Worker<Runnable<usize>> = Worker::new_fifo();
            self.work_stealers.push(work_worker.stealer());
            work_workers.push(work_worker);
        }
        for work_worker in work_workers {
            let worker = WorkStealingThread {
                node: self.node,
                work_inj: self.work_inj.clone(),
                work_stealers: self.work_stealers.clone(),
                work_q: work_worker,
                status: self.status.clone(),
            };
            self.threads
                .push(WorkStealingThread::run(worker, self.active_cnt.clone()));
        }
        while self.active_cnt.load(Ordering::SeqCst) != self.threads.len() {
            std::thread::yield_now();
        }
    }
}

impl Drop for WorkStealing {
    #[tracing::instrument(skip_all, level = "debug")]
    fn drop(&mut self) {
        self.shutdown();
        while let Some(thread) = self.threads.pop() {
            if thread.thread().id() != std::thread::current().id() {
                let _res = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn block_on_returns_output() {
        let status = Arc::new(AtomicU8::new(SchedulerStatus::Active as u8));
        let ws = WorkStealing::new(0, 2, status);
        assert_eq!(ws.block_on(async { 21 * 2 }), 42);
    }

    #[test]
    fn submitted_tasks_run_before_shutdown() {
        let status = Arc::new(AtomicU8::new(SchedulerStatus::Active as u8));
        let ws = WorkStealing::new(0, 3, status);
        let cnt = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let cnt = cnt.clone();
            ws.submit_task(async move {
                cnt.fetch_add(1, Ordering::SeqCst);
            });
        }
        ws.shutdown();
        assert_eq!(cnt.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn spawned_task_can_be_awaited() {
        let status = Arc::new(AtomicU8::new(SchedulerStatus::Active as u8));
        let ws = WorkStealing::new(0, 2, status);
        let task = ws.spawn_task(async { String::from("done") });
        assert_eq!(ws.block_on(task), "done");
    }
}
