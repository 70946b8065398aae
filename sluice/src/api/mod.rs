//! The worker-facing surface: contexts, the stage protocol, and the reduce node.

pub mod context;
pub mod reduce_node;
pub mod stage;

pub use context::{Context, HostContext};
pub use reduce_node::ReduceNode;
pub use stage::Stage;
