//! Query compilation core: execution context, query tree and passes, the
//! lazily built logical plan and its lowering to a physical pipeline.

pub mod analyzer;
pub mod context;
pub mod explain;
pub mod limits;
pub mod logical_plan;
pub mod options;
pub mod pass_manager;
pub mod passes;
pub mod physical_plan;
pub mod physical_planner;
pub mod planner;
pub mod query_plan;
pub mod query_tree;
pub mod settings;

pub use analyzer::*;
pub use context::*;
pub use explain::*;
pub use limits::*;
pub use logical_plan::*;
pub use options::*;
pub use pass_manager::*;
pub use passes::*;
pub use physical_plan::*;
pub use physical_planner::*;
pub use planner::*;
pub use query_plan::*;
pub use query_tree::*;
pub use settings::*;
