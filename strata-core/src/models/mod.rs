pub mod context;
pub mod edge;
pub mod node;
pub mod query;
pub mod schema;

pub use context::{GraphAccumulator, GraphContext, GraphPath, PathItem, PathStep, PathSummary, Traversal};
pub use edge::{Edge, EDGE_TYPE};
pub use node::{generate_node_id, Node};
pub use query::{Direction, EdgeSpec, NodeQuery, NodeSpec};
pub use schema::{default_context, GraphStats, RepairReport, Schema};
