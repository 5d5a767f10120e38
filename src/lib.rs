//! Block building that honors proposer inclusion constraints.
//!
//! The [`ConstraintCache`] keeps the signed constraints of recent slots, the
//! [`BlockAssembler`] builds blocks that include them at their promised positions while
//! filling the rest of the block with the most profitable bundles and transactions, and
//! the [`RecommitController`] decides when to build again.

pub mod assembler;
pub mod bundles;
pub mod common;
pub mod config;
pub mod constraints;
pub mod execution;
pub mod recommit;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::{
    assembler::{BlockAssembler, BuildError, BuiltBlock, ConstraintPolicy, GenerateParams, OrderWithArrival},
    bundles::{Bundle, BundleSimulationCache},
    config::{BuilderArgs, BuilderConfig},
    constraints::{ConstraintCache, ConstraintsApi, ConstraintsApiServer},
    execution::ExecutionAdapter,
    recommit::{AssemblyTask, RecommitController, RecommitHandle, RecommitInterval},
};
