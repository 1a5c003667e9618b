use std::sync::{Arc, OnceLock};

use quarry_common::{QuarryError, Result};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::passes::{default_passes, QueryTreePass};
use crate::query_tree::QueryTree;

/// Ordered list of query tree passes.
///
/// Passes run sequentially in registration order; a failing pass aborts the
/// run and later passes never see the tree.
#[derive(Clone)]
pub struct QueryTreePassManager {
    passes: Vec<Arc<dyn QueryTreePass>>,
}

impl std::fmt::Debug for QueryTreePassManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTreePassManager")
            .field("passes", &self.pass_names())
            .finish()
    }
}

impl Default for QueryTreePassManager {
    fn default() -> Self {
        Self {
            passes: default_passes(),
        }
    }
}

impl QueryTreePassManager {
    pub fn builder() -> QueryTreePassManagerBuilder {
        QueryTreePassManagerBuilder::default()
    }

    /// Process-wide manager holding the default passes.
    pub fn shared_default() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<QueryTreePassManager>> = OnceLock::new();
        Arc::clone(DEFAULT.get_or_init(|| Arc::new(Self::default())))
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass.
    pub fn run(&self, tree: &mut QueryTree, context: &ExecutionContext) -> Result<()> {
        self.run_up_to(tree, context, self.passes.len())
    }

    /// Run the first `up_to` passes.
    pub fn run_up_to(
        &self,
        tree: &mut QueryTree,
        context: &ExecutionContext,
        up_to: usize,
    ) -> Result<()> {
        if up_to > self.passes.len() {
            return Err(QuarryError::Planning(format!(
                "requested {up_to} passes but only {} are registered",
                self.passes.len()
            )));
        }
        for (index, pass) in self.passes[..up_to].iter().enumerate() {
            debug!(
                query_id = %context.query_id(),
                pass = pass.name(),
                index,
                "running query tree pass"
            );
            pass.run(tree, context)?;
        }
        Ok(())
    }
}

/// Builder for custom pass lists.
#[derive(Default)]
pub struct QueryTreePassManagerBuilder {
    passes: Vec<Arc<dyn QueryTreePass>>,
}

impl QueryTreePassManagerBuilder {
    /// Start from the default passes.
    pub fn with_default_passes(mut self) -> Self {
        self.passes.extend(default_passes());
        self
    }

    pub fn pass(mut self, pass: Arc<dyn QueryTreePass>) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn build(self) -> QueryTreePassManager {
        QueryTreePassManager {
            passes: self.passes,
        }
    }
}
