use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use revm_primitives::B256;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::{
    assembler::{BlockAssembler, ConstraintPolicy, GenerateParams},
    bundles::{BundleSimulationCache, DEFAULT_CACHED_SNAPSHOTS},
    constraints::{ConstraintCache, DEFAULT_CACHE_CAPACITY},
    execution::ExecutionAdapter,
    recommit::{
        RecommitInterval,
        interval::{
            DEFAULT_ADJUST_BIAS, DEFAULT_ADJUST_RATIO, DEFAULT_MAX_RECOMMIT_INTERVAL, DEFAULT_RECOMMIT_FLOOR,
        },
    },
};

/// Default gas limit of built blocks.
pub const DEFAULT_BLOCK_GAS_LIMIT: u64 = 30_000_000;
/// Default minimum recommit interval.
pub const DEFAULT_MIN_RECOMMIT_INTERVAL: Duration = Duration::from_secs(2);

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Number of slots whose constraints are kept.
    pub constraints_cache_capacity: usize,
    /// Number of state snapshots whose bundle simulations are kept.
    pub bundle_cache_snapshots: usize,
    /// Starting and minimum time between re-assembly attempts.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_recommit_interval: Duration,
    /// Lowest value `min_recommit_interval` can be set to.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_recommit_floor: Duration,
    /// Highest value the recommit interval can grow to.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_recommit_interval: Duration,
    /// Smoothing weight of each interval adjustment.
    pub interval_adjust_ratio: f64,
    /// Fixed bias applied to interval adjustments.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval_adjust_bias: Duration,
    /// Gas limit of built blocks.
    pub block_gas_limit: u64,
    /// Whether a constraint that cannot be honored fails the attempt.
    pub constraint_policy: ConstraintPolicy,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            constraints_cache_capacity: DEFAULT_CACHE_CAPACITY,
            bundle_cache_snapshots: DEFAULT_CACHED_SNAPSHOTS,
            min_recommit_interval: DEFAULT_MIN_RECOMMIT_INTERVAL,
            min_recommit_floor: DEFAULT_RECOMMIT_FLOOR,
            max_recommit_interval: DEFAULT_MAX_RECOMMIT_INTERVAL,
            interval_adjust_ratio: DEFAULT_ADJUST_RATIO,
            interval_adjust_bias: DEFAULT_ADJUST_BIAS,
            block_gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
            constraint_policy: ConstraintPolicy::Strict,
        }
    }
}

impl BuilderConfig {
    pub fn constraint_cache(&self) -> ConstraintCache {
        ConstraintCache::new(NonZeroUsize::new(self.constraints_cache_capacity).unwrap_or(NonZeroUsize::MIN))
    }

    pub fn bundle_cache(&self) -> BundleSimulationCache {
        BundleSimulationCache::new(NonZeroUsize::new(self.bundle_cache_snapshots).unwrap_or(NonZeroUsize::MIN))
    }

    pub fn recommit_interval(&self) -> RecommitInterval {
        RecommitInterval::from_config(self)
    }

    pub fn assembler<A: ExecutionAdapter>(
        &self,
        adapter: Arc<A>,
        constraints: Arc<ConstraintCache>,
        bundle_cache: Arc<BundleSimulationCache>,
    ) -> BlockAssembler<A> {
        BlockAssembler::new(adapter, constraints, bundle_cache).with_policy(self.constraint_policy)
    }

    /// Request skeleton for a block on top of `parent_hash` using the configured gas limit.
    pub fn generate_params(&self, parent_hash: B256) -> GenerateParams {
        GenerateParams { parent_hash, gas_limit: self.block_gas_limit, ..Default::default() }
    }
}

/// Command line flags for the builder.
#[derive(Debug, Clone, clap::Args)]
pub struct BuilderArgs {
    /// Number of slots whose constraints are kept
    #[arg(long = "builder.constraints-cache-capacity", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub constraints_cache_capacity: usize,

    /// Number of state snapshots whose bundle simulations are kept
    #[arg(long = "builder.bundle-cache-snapshots", default_value_t = DEFAULT_CACHED_SNAPSHOTS)]
    pub bundle_cache_snapshots: usize,

    /// Minimum time between re-assembly attempts, in milliseconds
    #[arg(long = "builder.recommit-ms", default_value_t = DEFAULT_MIN_RECOMMIT_INTERVAL.as_millis() as u64)]
    pub min_recommit_ms: u64,

    /// Highest value the recommit interval can grow to, in milliseconds
    #[arg(long = "builder.max-recommit-ms", default_value_t = DEFAULT_MAX_RECOMMIT_INTERVAL.as_millis() as u64)]
    pub max_recommit_ms: u64,

    /// Smoothing weight of each recommit interval adjustment
    #[arg(long = "builder.interval-adjust-ratio", default_value_t = DEFAULT_ADJUST_RATIO)]
    pub interval_adjust_ratio: f64,

    /// Bias applied to recommit interval adjustments, in milliseconds
    #[arg(long = "builder.interval-adjust-bias-ms", default_value_t = DEFAULT_ADJUST_BIAS.as_millis() as u64)]
    pub interval_adjust_bias_ms: u64,

    /// Gas limit of built blocks
    #[arg(long = "builder.gaslimit", default_value_t = DEFAULT_BLOCK_GAS_LIMIT)]
    pub block_gas_limit: u64,

    /// What to do when a constraint cannot be honored
    #[arg(long = "builder.constraint-policy", value_enum, default_value_t = ConstraintPolicy::Strict)]
    pub constraint_policy: ConstraintPolicy,
}

impl Default for BuilderArgs {
    fn default() -> Self {
        BuilderConfig::default().into()
    }
}

impl From<BuilderArgs> for BuilderConfig {
    fn from(args: BuilderArgs) -> Self {
        Self {
            constraints_cache_capacity: args.constraints_cache_capacity,
            bundle_cache_snapshots: args.bundle_cache_snapshots,
            min_recommit_interval: Duration::from_millis(args.min_recommit_ms),
            max_recommit_interval: Duration::from_millis(args.max_recommit_ms),
            interval_adjust_ratio: args.interval_adjust_ratio,
            interval_adjust_bias: Duration::from_millis(args.interval_adjust_bias_ms),
            block_gas_limit: args.block_gas_limit,
            constraint_policy: args.constraint_policy,
            ..Default::default()
        }
    }
}

impl From<BuilderConfig> for BuilderArgs {
    fn from(config: BuilderConfig) -> Self {
        Self {
            constraints_cache_capacity: config.constraints_cache_capacity,
            bundle_cache_snapshots: config.bundle_cache_snapshots,
            min_recommit_ms: config.min_recommit_interval.as_millis() as u64,
            max_recommit_ms: config.max_recommit_interval.as_millis() as u64,
            interval_adjust_ratio: config.interval_adjust_ratio,
            interval_adjust_bias_ms: config.interval_adjust_bias.as_millis() as u64,
            block_gas_limit: config.block_gas_limit,
            constraint_policy: config.constraint_policy,
        }
    }
}
