use crate::collective_mapping::CollectiveMapping;
use crate::env_var::CollectedPolicy;
use crate::lamellae::{Backend, Lamellae, LocalFabric};
use crate::layout::FieldSpace;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::warnings::RuntimeWarning;

use futures::Future;
use std::sync::Arc;
use tracing::trace_span;

/// Every node of one execution.
///
/// With the [Local][Backend::Local] lamellae all nodes live inside this process, each with its own
/// [Runtime], executor and memories, talking through in-memory queues. Dropping the world shuts every
/// node down.
#[derive(Debug)]
pub struct InstanceWorld {
    nodes: Vec<Arc<Runtime>>,
    radix: usize,
}

impl InstanceWorld {
    /// The runtime of `node`
    ///
    /// # Panics
    ///
    /// if `node` is not part of this world
    pub fn node(&self, node: usize) -> &Arc<Runtime> {
        &self.nodes[node]
    }

    pub fn nodes(&self) -> &[Arc<Runtime>] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Makes `field_space` known on every node
    #[tracing::instrument(skip_all)]
    pub fn register_field_space(&self, field_space: FieldSpace) {
        for node in self.nodes.iter() {
            node.register_field_space(field_space.clone());
        }
    }

    /// A mapping over `nodes` using the configured tree radix
    pub fn mapping(&self, nodes: impl IntoIterator<Item = usize>) -> CollectiveMapping {
        CollectiveMapping::new(nodes, self.radix)
    }

    /// Run a future to completion on node 0
    ///
    /// # Examples
    ///```
    /// use phys_instances::prelude::*;
    ///
    /// let world = InstanceWorldBuilder::new().with_num_nodes(2).build();
    /// let sum = world.block_on(async move { 1 + 1 });
    /// assert_eq!(sum, 2);
    ///```
    pub fn block_on<F>(&self, f: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        trace_span!("block_on").in_scope(|| self.nodes[0].block_on(f))
    }

    /// Bytes pushed through the lamellae by all nodes
    pub fn bytes_sent(&self) -> usize {
        self.nodes.iter().map(|n| n.bytes_sent()).sum()
    }

    /// Holds messages from `src` to `dst`, in order, until the link resumes
    pub fn pause_link(&self, src: usize, dst: usize) {
        self.nodes[src].pause_messages_to(dst);
    }

    pub fn resume_link(&self, src: usize, dst: usize) {
        self.nodes[src].resume_messages_to(dst);
    }

    /// Messages from `src` to `dst` held by a paused link
    pub fn held_messages(&self, src: usize, dst: usize) -> usize {
        self.nodes[src].held_messages_to(dst)
    }
}

impl Drop for InstanceWorld {
    #[tracing::instrument(skip_all)]
    fn drop(&mut self) {
        for node in self.nodes.iter() {
            node.shutdown();
        }
    }
}

/// An implementation of the Builder design pattern, used to construct an [InstanceWorld].
///
/// Settings not given explicitly come from the `PHYS_INST_*` environment (see [config][crate::config]).
///
/// # Examples
///
///```
/// use phys_instances::prelude::*;
///
/// let world = InstanceWorldBuilder::new()
///                             .with_num_nodes(4)
///                             .with_radix(2)
///                             .build();
/// assert_eq!(world.num_nodes(), 4);
///```
#[derive(Debug)]
pub struct InstanceWorldBuilder {
    backend: Backend,
    num_nodes: usize,
    config: RuntimeConfig,
}

impl Default for InstanceWorldBuilder {
    fn default() -> Self {
        InstanceWorldBuilder::new()
    }
}

impl InstanceWorldBuilder {
    #[tracing::instrument(skip_all)]
    pub fn new() -> InstanceWorldBuilder {
        InstanceWorldBuilder {
            backend: Backend::default(),
            num_nodes: 1,
            config: RuntimeConfig::from_env(),
        }
    }

    pub fn with_lamellae(mut self, backend: Backend) -> InstanceWorldBuilder {
        self.backend = backend;
        self
    }

    pub fn with_num_nodes(mut self, num_nodes: usize) -> InstanceWorldBuilder {
        self.num_nodes = num_nodes.max(1);
        self
    }

    pub fn with_radix(mut self, radix: usize) -> InstanceWorldBuilder {
        self.config.radix = radix.max(2);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> InstanceWorldBuilder {
        self.config.threads = threads;
        self
    }

    pub fn with_hammer_threshold(mut self, threshold: usize) -> InstanceWorldBuilder {
        self.config.hammer_threshold = threshold;
        self
    }

    pub fn with_memory_capacity(mut self, bytes: usize) -> InstanceWorldBuilder {
        self.config.memory_capacity = bytes;
        self
    }

    pub fn with_memories_per_node(mut self, memories: usize) -> InstanceWorldBuilder {
        self.config.memories_per_node = memories.max(1);
        self
    }

    pub fn with_eager_fraction(mut self, fraction: f64) -> InstanceWorldBuilder {
        self.config.eager_fraction = fraction;
        self
    }

    pub fn with_collected_policy(mut self, policy: CollectedPolicy) -> InstanceWorldBuilder {
        self.config.collected_policy = policy;
        self
    }

    /// Silences runtime warnings (blocking waits, blocking on worker threads) for the whole process
    pub fn without_warnings(self) -> InstanceWorldBuilder {
        RuntimeWarning::disable_warnings();
        self
    }

    #[tracing::instrument(skip_all)]
    pub fn build(self) -> InstanceWorld {
        let nodes = match self.backend {
            Backend::Local => {
                let fabric = LocalFabric::new(self.num_nodes);
                (0..self.num_nodes)
                    .map(|node| {
                        Runtime::new(node, self.config.clone(), Lamellae::Local(fabric.endpoint(node)))
                    })
                    .collect()
            }
        };
        tracing::debug!(num_nodes = self.num_nodes, radix = self.config.radix, "world built");
        InstanceWorld {
            nodes,
            radix: self.config.radix,
        }
    }
}
