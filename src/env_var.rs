use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_radix() -> usize {
    4
}

fn default_threads() -> usize {
    2
}

fn default_hammer_threshold() -> usize {
    2
}

fn default_memory_capacity() -> usize {
    64 * 1024 * 1024
}

fn default_eager_fraction() -> f64 {
    0.125
}

fn default_memories_per_node() -> usize {
    1
}

/// What to do when an operation names an instance that has already been collected
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectedPolicy {
    /// Report an [InvalidInstanceState][crate::error::InstanceError::InvalidInstanceState] error to the caller
    Error,
    /// Log a warning and treat the operation as a no-op
    Ignore,
}

fn default_collected_policy() -> CollectedPolicy {
    CollectedPolicy::Error
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds for blocking waits which may indicate a deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The fan-out of broadcast and reduction trees built over a collective mapping, default: 4
    #[serde(default = "default_radix")]
    pub radix: usize,

    /// Worker threads per node executor, default: 2
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Collective reductions over at most this many nodes use direct point-to-point exchange, default: 2
    #[serde(default = "default_hammer_threshold")]
    pub hammer_threshold: usize,

    /// Bytes available in each simulated memory, default: 64 MiB
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Fraction of each memory set aside for the eager pool, default: 0.125
    #[serde(default = "default_eager_fraction")]
    pub eager_fraction: f64,

    /// Number of memories created on every node, default: 1
    #[serde(default = "default_memories_per_node")]
    pub memories_per_node: usize,

    /// error | ignore, default: error
    #[serde(default = "default_collected_policy")]
    pub collected_policy: CollectedPolicy,

    /// flag used to print warnings when blocking waits exceed the deadlock timeout. Default: true
    pub runtime_warnings: Option<bool>,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("PHYS_INST_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
