pub mod format;
pub mod graph;
pub mod subgraph;

pub use format::{format_for_llm, ContextFormat, DEFAULT_MAX_TOKENS};
pub use graph::{AlignmentSummary, GoalAlignment, GraphService, TopicTreeNode};
pub use subgraph::{path_narrative, ConnectingPath, HybridRequest, RetrievalMode, SubgraphService};
