use serde::{Deserialize, Serialize};

/// How far a compilation plans the query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStage {
    /// Source reads and filters only.
    FetchColumns,
    /// Aggregations stop at mergeable partial state.
    WithMergeableState,
    /// Full plan producing the final result.
    #[default]
    Complete,
}

impl ProcessingStage {
    pub fn is_complete(self) -> bool {
        self == ProcessingStage::Complete
    }
}

/// Mode of one compilation. Fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationOptions {
    /// Resolve structure and types only; table reads become empty sources.
    pub only_analyze: bool,
    /// Run only the first query tree pass.
    pub ignore_ast_optimizations: bool,
    pub to_stage: ProcessingStage,
    /// Never attach the session quota to the result.
    pub ignore_quota: bool,
    pub shard_num: Option<u32>,
    pub shard_count: Option<u32>,
    /// Re-lower the cached plan on every `build_query_pipeline`/`execute`.
    pub allow_repeated_execution: bool,
}

impl CompilationOptions {
    pub fn analyze() -> Self {
        Self::default().with_only_analyze(true)
    }

    pub fn with_only_analyze(mut self, v: bool) -> Self {
        self.only_analyze = v;
        self
    }

    pub fn with_ignore_ast_optimizations(mut self, v: bool) -> Self {
        self.ignore_ast_optimizations = v;
        self
    }

    pub fn with_stage(mut self, stage: ProcessingStage) -> Self {
        self.to_stage = stage;
        self
    }

    pub fn with_ignore_quota(mut self, v: bool) -> Self {
        self.ignore_quota = v;
        self
    }

    pub fn with_shard(mut self, shard_num: u32, shard_count: u32) -> Self {
        self.shard_num = Some(shard_num);
        self.shard_count = Some(shard_count);
        self
    }

    pub fn with_allow_repeated_execution(mut self, v: bool) -> Self {
        self.allow_repeated_execution = v;
        self
    }
}

/// Planner switches derived from [`CompilationOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerConfiguration {
    pub only_analyze: bool,
}

impl From<&CompilationOptions> for PlannerConfiguration {
    fn from(options: &CompilationOptions) -> Self {
        Self {
            only_analyze: options.only_analyze,
        }
    }
}
