//! Tasks built into every node.

mod node_cleanup;

pub use node_cleanup::NodeCleanupTask;
