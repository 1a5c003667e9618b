use std::sync::Arc;

use arrow_schema::{Schema, SchemaRef};
use quarry_common::Quota;
use serde::{Deserialize, Serialize};

use crate::limits::StorageLimits;
use crate::logical_plan::{AggExpr, Expr, SortExpr};

/// The physical operator graph.
///
/// Operators still carry resolved logical expressions; the execution runtime
/// compiles them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PhysicalPlan {
    /// Source producing no rows.
    Empty(EmptyExec),
    /// Single `dummy` row.
    OneRow,
    /// Catalog table scan.
    TableScan(TableScanExec),
    /// Row filter.
    Filter(FilterExec),
    /// Projection.
    Project(ProjectExec),
    /// Batch coalescing.
    CoalesceBatches(CoalesceBatchesExec),

    /// Partial aggregate.
    PartialHashAggregate(PartialHashAggregateExec),
    /// Final aggregate.
    FinalHashAggregate(FinalHashAggregateExec),

    /// Data exchange boundary.
    Exchange(ExchangeExec),

    /// Duplicate row elimination.
    Distinct(DistinctExec),
    /// Full sort.
    Sort(SortExec),
    /// Offset + limit.
    Limit(LimitExec),
    /// Concatenation of inputs.
    Union(UnionExec),
}

impl PhysicalPlan {
    /// Returns direct child operators.
    pub fn children(&self) -> Vec<&PhysicalPlan> {
        match self {
            PhysicalPlan::Empty(_) | PhysicalPlan::OneRow | PhysicalPlan::TableScan(_) => vec![],
            PhysicalPlan::Filter(x) => vec![x.input.as_ref()],
            PhysicalPlan::Project(x) => vec![x.input.as_ref()],
            PhysicalPlan::CoalesceBatches(x) => vec![x.input.as_ref()],
            PhysicalPlan::PartialHashAggregate(x) => vec![x.input.as_ref()],
            PhysicalPlan::FinalHashAggregate(x) => vec![x.input.as_ref()],
            PhysicalPlan::Exchange(x) => match x {
                ExchangeExec::ShuffleWrite(e) => vec![e.input.as_ref()],
                ExchangeExec::ShuffleRead(e) => vec![e.input.as_ref()],
            },
            PhysicalPlan::Distinct(x) => vec![x.input.as_ref()],
            PhysicalPlan::Sort(x) => vec![x.input.as_ref()],
            PhysicalPlan::Limit(x) => vec![x.input.as_ref()],
            PhysicalPlan::Union(x) => x.inputs.iter().collect(),
        }
    }

    /// Operator name used in logs and explain output.
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalPlan::Empty(_) => "Empty",
            PhysicalPlan::OneRow => "OneRow",
            PhysicalPlan::TableScan(_) => "TableScan",
            PhysicalPlan::Filter(_) => "Filter",
            PhysicalPlan::Project(_) => "Project",
            PhysicalPlan::CoalesceBatches(_) => "CoalesceBatches",
            PhysicalPlan::PartialHashAggregate(_) => "PartialHashAggregate",
            PhysicalPlan::FinalHashAggregate(_) => "FinalHashAggregate",
            PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(_)) => "ShuffleWrite",
            PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(_)) => "ShuffleRead",
            PhysicalPlan::Distinct(_) => "Distinct",
            PhysicalPlan::Sort(_) => "Sort",
            PhysicalPlan::Limit(_) => "Limit",
            PhysicalPlan::Union(_) => "Union",
        }
    }
}

/// Source that declares a header but yields no rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyExec {
    /// Table the source stands in for.
    pub table: String,
    pub schema: Schema,
}

/// Physical table scan operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableScanExec {
    /// Table name from the catalog.
    pub table: String,
    /// Resolved schema of the read columns.
    pub schema: Schema,
    /// Column names read from storage.
    pub projection: Option<Vec<String>>,
    /// Pushed-down predicates over `schema`; the scan must apply all of them.
    pub filters: Vec<Expr>,
}

/// Row filter operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterExec {
    /// Predicate.
    pub predicate: Expr,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Projection operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectExec {
    /// (expr, output_name)
    pub exprs: Vec<(Expr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Batch coalescing operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceBatchesExec {
    /// Desired row count per output batch.
    pub target_batch_rows: usize,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Phase-1 hash aggregate producing mergeable state.
///
/// Must be followed by compatible repartition + final aggregate for global SQL
/// aggregate semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialHashAggregateExec {
    /// Grouping expressions and output names.
    pub group_exprs: Vec<(Expr, String)>,
    /// Aggregate expressions and output names.
    pub aggr_exprs: Vec<(AggExpr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Phase-2 hash aggregate merging partial states after shuffle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalHashAggregateExec {
    /// Grouping expressions and output names.
    pub group_exprs: Vec<(Expr, String)>,
    /// Aggregate expressions and output names.
    pub aggr_exprs: Vec<(AggExpr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Stage-boundary exchange operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExchangeExec {
    /// Shuffle write boundary.
    ShuffleWrite(ShuffleWriteExchange),
    /// Shuffle read boundary.
    ShuffleRead(ShuffleReadExchange),
}

/// Shuffle write boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleWriteExchange {
    /// Input plan.
    pub input: Box<PhysicalPlan>,
    /// Partitioning scheme.
    pub partitioning: PartitioningSpec,
}

/// Shuffle read boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleReadExchange {
    /// Input plan.
    pub input: Box<PhysicalPlan>,
    /// Partitioning scheme.
    pub partitioning: PartitioningSpec,
}

/// Partitioning contract used by exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitioningSpec {
    /// Hash partition by expressions into N partitions.
    HashKeys {
        /// Partition key names.
        keys: Vec<String>,
        /// Partition count.
        partitions: usize,
    },
    /// Single partition.
    Single,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctExec {
    pub input: Box<PhysicalPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortExec {
    pub exprs: Vec<SortExpr>,
    pub input: Box<PhysicalPlan>,
}

/// Limit operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitExec {
    /// Rows skipped before emitting.
    pub skip: usize,
    /// Maximum number of rows emitted.
    pub fetch: Option<usize>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnionExec {
    pub inputs: Vec<PhysicalPlan>,
}

/// Lowered, executable form of a query plan.
#[derive(Debug, Clone)]
pub struct PhysicalPipeline {
    root: PhysicalPlan,
    header: SchemaRef,
    max_threads: usize,
    storage_limits: Vec<StorageLimits>,
    quota: Option<Arc<Quota>>,
}

impl PhysicalPipeline {
    pub fn new(
        root: PhysicalPlan,
        header: SchemaRef,
        max_threads: usize,
        storage_limits: Vec<StorageLimits>,
    ) -> Self {
        Self {
            root,
            header,
            max_threads,
            storage_limits,
            quota: None,
        }
    }

    pub fn root(&self) -> &PhysicalPlan {
        &self.root
    }

    /// Output header; equals the logical plan header.
    pub fn header(&self) -> SchemaRef {
        Arc::clone(&self.header)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn storage_limits(&self) -> &[StorageLimits] {
        &self.storage_limits
    }

    /// Meter result consumption against `quota`.
    pub fn set_quota(&mut self, quota: Arc<Quota>) {
        self.quota = Some(quota);
    }

    pub fn quota(&self) -> Option<&Arc<Quota>> {
        self.quota.as_ref()
    }
}
