//! All-reduce across the point instances of a collective manager.
//!
//! Three strategies exist. Mappings with at most `hammer_threshold` members exchange partials directly
//! with every other member. Managers with a single instance per node reduce up the mapping tree and
//! broadcast the result back down. Managers with several instances per node run recursive doubling:
//! the members beyond the largest power of two fold into a partner first (stage 0), the power of two
//! core exchanges in `log2 p` rounds, and the extra members receive the final result in a last stage.
//!
//! Messages for a stage may arrive before the local node reaches that stage; they are parked in a
//! [StageBuffer] keyed by (stage, sender) until consumed. Each member numbers its runs of a tag, so
//! a peer that already started the next run under the same tag cannot feed the current one.

use crate::copy::{FieldBuffer, ReductionOpKind};
use crate::error::{InstanceError, InstanceResult};
use crate::instance::{AllReduceTag, CollectiveManager, InstanceManagerOps};
use crate::layout::FieldId;
use crate::messages::InstanceMessage;

use async_trait::async_trait;
use futures::channel::oneshot;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub(crate) const HAMMER_STAGE: u32 = u32::MAX;
const TREE_UP_STAGE: u32 = 0;
const TREE_DOWN_STAGE: u32 = 1;

/// One step of a recursive doubling schedule, naming peers by rank within the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStep {
    /// send the running value to `to`
    Send { stage: u32, to: usize },
    /// fold the value received from `from` into the running value
    Fold { stage: u32, from: usize },
    /// send the running value to `partner`, then fold what `partner` sent
    Exchange { stage: u32, partner: usize },
    /// replace the running value with the one received from `from`
    Replace { stage: u32, from: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllReduceSchedule {
    rank: usize,
    participants: usize,
    steps: Vec<StageStep>,
}

impl AllReduceSchedule {
    /// # Panics
    ///
    /// if `rank` is not below `participants`
    pub fn new(rank: usize, participants: usize) -> AllReduceSchedule {
        assert!(rank < participants, "rank {} outside of {} participants", rank, participants);
        let core = 1usize << (usize::BITS - 1 - participants.leading_zeros());
        let extra = participants - core;
        let rounds = core.trailing_zeros();
        let post = rounds + 1;
        let mut steps = Vec::new();
        if rank >= core {
            steps.push(StageStep::Send { stage: 0, to: rank - core });
            steps.push(StageStep::Replace {
                stage: post,
                from: rank - core,
            });
        } else {
            if rank < extra {
                steps.push(StageStep::Fold {
                    stage: 0,
                    from: rank + core,
                });
            }
            for round in 0..rounds {
                steps.push(StageStep::Exchange {
                    stage: round + 1,
                    partner: rank ^ (1 << round),
                });
            }
            if rank < extra {
                steps.push(StageStep::Send {
                    stage: post,
                    to: rank + core,
                });
            }
        }
        AllReduceSchedule {
            rank,
            participants,
            steps,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    pub fn steps(&self) -> &[StageStep] {
        &self.steps
    }
}

/// Moves stage buffers between the ranks of one all-reduce
#[async_trait]
pub(crate) trait StageExchange: Sync {
    fn send_stage(&self, to: usize, stage: u32, buffer: FieldBuffer) -> InstanceResult<()>;
    async fn receive_stage(&self, from: usize, stage: u32) -> InstanceResult<FieldBuffer>;
}

pub(crate) async fn run_schedule<E: StageExchange + ?Sized>(
    schedule: &AllReduceSchedule,
    mut value: FieldBuffer,
    redop: ReductionOpKind,
    exchange: &E,
) -> InstanceResult<FieldBuffer> {
    for step in schedule.steps() {
        match *step {
            StageStep::Send { stage, to } => exchange.send_stage(to, stage, value.clone())?,
            StageStep::Fold { stage, from } => {
                let other = exchange.receive_stage(from, stage).await?;
                value.fold_from(&other, redop)?;
            }
            StageStep::Exchange { stage, partner } => {
                exchange.send_stage(partner, stage, value.clone())?;
                let other = exchange.receive_stage(partner, stage).await?;
                value.fold_from(&other, redop)?;
            }
            StageStep::Replace { stage, from } => {
                value = exchange.receive_stage(from, stage).await?;
            }
        }
    }
    Ok(value)
}

/// Early arrivals and local waiters of one all-reduce, keyed by (stage, sender)
#[derive(Debug, Default)]
pub(crate) struct StageBuffer {
    arrived: BTreeMap<(u32, usize), FieldBuffer>,
    waiting: HashMap<(u32, usize), oneshot::Sender<FieldBuffer>>,
}

impl StageBuffer {
    pub(crate) fn deliver(&mut self, stage: u32, from: usize, buffer: FieldBuffer) {
        let key = (stage, from);
        let buffer = match self.waiting.remove(&key) {
            Some(waiter) => match waiter.send(buffer) {
                Ok(()) => return,
                Err(buffer) => buffer,
            },
            None => buffer,
        };
        if self.arrived.insert(key, buffer).is_some() {
            tracing::error!(stage, from, "duplicate all-reduce stage delivery");
        }
    }

    pub(crate) fn take_or_wait(
        &mut self,
        stage: u32,
        from: usize,
    ) -> Result<FieldBuffer, oneshot::Receiver<FieldBuffer>> {
        match self.arrived.remove(&(stage, from)) {
            Some(buffer) => Ok(buffer),
            None => {
                let (tx, rx) = oneshot::channel();
                self.waiting.insert((stage, from), tx);
                Err(rx)
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.arrived.is_empty() && self.waiting.is_empty()
    }
}

struct ManagerExchange<'a> {
    manager: &'a CollectiveManager,
    tag: AllReduceTag,
    run: u64,
}

#[async_trait]
impl<'a> StageExchange for ManagerExchange<'a> {
    fn send_stage(&self, to: usize, stage: u32, buffer: FieldBuffer) -> InstanceResult<()> {
        let node = self.manager.mapping[to];
        self.manager
            .send_allreduce_stage(node, self.tag, self.run, stage, buffer);
        Ok(())
    }

    async fn receive_stage(&self, from: usize, stage: u32) -> InstanceResult<FieldBuffer> {
        let node = self.manager.mapping[from];
        self.manager
            .receive_allreduce_stage(self.tag, self.run, stage, node)
            .await
    }
}

impl CollectiveManager {
    /// Folds every point instance with `redop` and writes the result back into all of them.
    ///
    /// Must be called on every member of the mapping with the same `tag`. A tag may be reused as long
    /// as every member starts its runs in the same order.
    pub async fn perform_collective_allreduce(
        self: &Arc<Self>,
        fids: &[FieldId],
        redop: ReductionOpKind,
        tag: AllReduceTag,
    ) -> InstanceResult<()> {
        let local = self.core.runtime.node();
        let rank = self.mapping.find_index(local).ok_or(
            crate::collective_mapping::NotMemberError {
                node: local,
                mapping_size: self.mapping.size(),
            },
        )?;
        if !self.core.check_usable("perform_collective_allreduce")? {
            return Ok(());
        }
        let run = self.next_allreduce_run(tag);
        let partial = self.local_partial(fids, redop)?;
        let result = if self.mapping.size() <= self.core.runtime.config().hammer_threshold {
            self.perform_hammer_reduction(tag, run, partial, redop).await
        } else if self.multi_instance {
            self.perform_multi_allreduce(rank, tag, run, partial, redop)
                .await
        } else {
            self.perform_single_allreduce(tag, run, partial, redop).await
        };
        self.finish_stages(tag, run);
        let result = result?;
        tracing::debug!(did = %self.did(), ?tag, run, "all-reduce complete");
        self.write_local_points(&result, None, None).await
    }

    /// Recursive doubling over the members, for points spread over many instances per node
    async fn perform_multi_allreduce(
        &self,
        rank: usize,
        tag: AllReduceTag,
        run: u64,
        partial: FieldBuffer,
        redop: ReductionOpKind,
    ) -> InstanceResult<FieldBuffer> {
        let schedule = AllReduceSchedule::new(rank, self.mapping.size());
        let exchange = ManagerExchange {
            manager: self,
            tag,
            run,
        };
        run_schedule(&schedule, partial, redop, &exchange).await
    }

    /// Every member sends its partial to every other member
    async fn perform_hammer_reduction(
        &self,
        tag: AllReduceTag,
        run: u64,
        mut partial: FieldBuffer,
        redop: ReductionOpKind,
    ) -> InstanceResult<FieldBuffer> {
        let local = self.core.runtime.node();
        for member in self.mapping.spaces().iter().filter(|m| **m != local) {
            self.core.runtime.send(
                *member,
                InstanceMessage::HammerReduction {
                    did: self.core.did,
                    tag,
                    run,
                    buffer: partial.clone(),
                },
            );
        }
        for member in self.mapping.spaces().iter().filter(|m| **m != local) {
            let other = self
                .receive_allreduce_stage(tag, run, HAMMER_STAGE, *member)
                .await?;
            partial.fold_from(&other, redop)?;
        }
        Ok(partial)
    }

    /// Reduce up the mapping tree, then broadcast the result back down
    async fn perform_single_allreduce(
        &self,
        tag: AllReduceTag,
        run: u64,
        mut partial: FieldBuffer,
        redop: ReductionOpKind,
    ) -> InstanceResult<FieldBuffer> {
        let local = self.core.runtime.node();
        let origin = self.mapping.get_origin();
        let mut children = Vec::new();
        self.mapping.get_children(origin, local, &mut children)?;
        for child in children.iter() {
            let other = self
                .receive_allreduce_stage(tag, run, TREE_UP_STAGE, *child)
                .await?;
            partial.fold_from(&other, redop)?;
        }
        if local != origin {
            let parent = self.mapping.get_parent(origin, local)?;
            self.send_allreduce_stage(parent, tag, run, TREE_UP_STAGE, partial);
            partial = self
                .receive_allreduce_stage(tag, run, TREE_DOWN_STAGE, parent)
                .await?;
        }
        for child in children {
            self.send_allreduce_stage(child, tag, run, TREE_DOWN_STAGE, partial.clone());
        }
        Ok(partial)
    }

    fn send_allreduce_stage(
        &self,
        node: usize,
        tag: AllReduceTag,
        run: u64,
        stage: u32,
        buffer: FieldBuffer,
    ) {
        self.core.runtime.send(
            node,
            InstanceMessage::DistributeAllreduce {
                did: self.core.did,
                tag,
                run,
                stage,
                buffer,
            },
        );
    }

    async fn receive_allreduce_stage(
        &self,
        tag: AllReduceTag,
        run: u64,
        stage: u32,
        from: usize,
    ) -> InstanceResult<FieldBuffer> {
        let rx = {
            let mut stages = self.stages.lock();
            match stages.entry((tag, run)).or_default().take_or_wait(stage, from) {
                Ok(buffer) => return Ok(buffer),
                Err(rx) => rx,
            }
        };
        rx.await.map_err(|_| {
            InstanceError::Transport(format!(
                "all-reduce {:?} run {} stage {} from node {} abandoned",
                tag, run, stage, from
            ))
        })
    }

    pub(crate) fn process_distribute_allreduce(
        &self,
        src: usize,
        tag: AllReduceTag,
        run: u64,
        stage: u32,
        buffer: FieldBuffer,
    ) {
        self.stages
            .lock()
            .entry((tag, run))
            .or_default()
            .deliver(stage, src, buffer);
    }

    fn next_allreduce_run(&self, tag: AllReduceTag) -> u64 {
        let mut runs = self.allreduce_runs.lock();
        let run = runs.entry(tag).or_default();
        let current = *run;
        *run += 1;
        current
    }

    /// Stage buffers held for all-reduces that have not finished here, including early arrivals
    pub fn pending_allreduce_stages(&self) -> usize {
        self.stages.lock().len()
    }

    fn finish_stages(&self, tag: AllReduceTag, run: u64) {
        if let Some(stages) = self.stages.lock().remove(&(tag, run)) {
            if !stages.is_empty() {
                tracing::warn!(did = %self.core.did, ?tag, run, ?stages, "all-reduce finished with unconsumed stages");
            }
        }
    }
}
