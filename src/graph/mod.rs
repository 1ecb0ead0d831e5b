//! Per-note dependency graph of smart fields.

mod dag;
mod node;

pub use dag::DependencyGraph;
pub use node::{FieldNode, NodeId, NodeState, SkipReason};
