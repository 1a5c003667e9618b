//! Per-compilation execution context.
//!
//! The ambient context belongs to the session. Every compilation derives its
//! own copy through [`build_compilation_context`] and owns it exclusively;
//! scalar bindings added to the copy never reach the ambient context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use quarry_common::{QueryId, QuarryError, Quota, Result, Settings};
use tracing::debug;

use crate::analyzer::SchemaProvider;
use crate::logical_plan::LiteralValue;
use crate::options::CompilationOptions;

/// Scalar holding the index of the shard this compilation targets.
pub const SHARD_NUM_SCALAR: &str = "_shard_num";
/// Scalar holding the number of shards of the distributed query.
pub const SHARD_COUNT_SCALAR: &str = "_shard_count";

/// Named constant visible to expression binding.
///
/// Stored as a single-row, single-column batch so it carries its arrow type
/// and nullability.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarBinding {
    name: String,
    block: RecordBatch,
}

impl ScalarBinding {
    pub fn new(name: impl Into<String>, block: RecordBatch) -> Result<Self> {
        let name = name.into();
        if block.num_columns() != 1 || block.num_rows() != 1 {
            return Err(QuarryError::Planning(format!(
                "scalar '{name}' must be one column and one row, got {} columns and {} rows",
                block.num_columns(),
                block.num_rows()
            )));
        }
        Ok(Self { name, block })
    }

    /// Non-nullable `UInt32` constant.
    pub fn uint32(name: impl Into<String>, value: u32) -> Result<Self> {
        let name = name.into();
        let schema = Arc::new(Schema::new(vec![Field::new(&name, DataType::UInt32, false)]));
        let block = RecordBatch::try_new(schema, vec![Arc::new(UInt32Array::from(vec![value]))])
            .map_err(|e| QuarryError::Execution(e.to_string()))?;
        Self::new(name, block)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block(&self) -> &RecordBatch {
        &self.block
    }

    pub fn data_type(&self) -> &DataType {
        self.block.schema_ref().field(0).data_type()
    }

    /// The bound value as a typed literal.
    pub fn value(&self) -> Result<LiteralValue> {
        let col = self.block.column(0);
        if col.is_null(0) {
            return Ok(LiteralValue::Null);
        }
        let any = col.as_any();
        let value = match col.data_type() {
            DataType::UInt32 => any
                .downcast_ref::<UInt32Array>()
                .map(|a| LiteralValue::UInt32(a.value(0))),
            DataType::Int64 => any
                .downcast_ref::<Int64Array>()
                .map(|a| LiteralValue::Int64(a.value(0))),
            DataType::Float64 => any
                .downcast_ref::<Float64Array>()
                .map(|a| LiteralValue::Float64(a.value(0))),
            DataType::Utf8 => any
                .downcast_ref::<StringArray>()
                .map(|a| LiteralValue::Utf8(a.value(0).to_string())),
            DataType::Boolean => any
                .downcast_ref::<BooleanArray>()
                .map(|a| LiteralValue::Boolean(a.value(0))),
            DataType::Null => Some(LiteralValue::Null),
            other => {
                return Err(QuarryError::Unsupported(format!(
                    "scalar '{}' has unsupported type {other:?}",
                    self.name
                )))
            }
        };
        value.ok_or_else(|| {
            QuarryError::Execution(format!("scalar '{}' column does not match its type", self.name))
        })
    }
}

/// Settings, catalog view, quota and scalars consulted while compiling.
#[derive(Clone)]
pub struct ExecutionContext {
    query_id: QueryId,
    settings: Settings,
    schemas: Arc<dyn SchemaProvider>,
    quota: Option<Arc<Quota>>,
    scalars: BTreeMap<String, ScalarBinding>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("query_id", &self.query_id)
            .field("settings", &self.settings)
            .field("quota", &self.quota.as_ref().map(|q| q.name().to_string()))
            .field("scalars", &self.scalars.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(settings: Settings, schemas: Arc<dyn SchemaProvider>) -> Self {
        Self {
            query_id: QueryId::next(),
            settings,
            schemas,
            quota: None,
            scalars: BTreeMap::new(),
        }
    }

    /// Context with default settings and no tables.
    pub fn empty() -> Self {
        Self::new(Settings::default(), Arc::new(EmptySchemaProvider))
    }

    pub fn with_quota(mut self, quota: Arc<Quota>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn quota(&self) -> Option<&Arc<Quota>> {
        self.quota.as_ref()
    }

    /// Bind a named constant, replacing any previous binding of that name.
    pub fn add_special_scalar(&mut self, binding: ScalarBinding) {
        self.scalars.insert(binding.name().to_string(), binding);
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarBinding> {
        self.scalars.get(name)
    }

    pub fn scalars(&self) -> impl Iterator<Item = &ScalarBinding> {
        self.scalars.values()
    }

    pub fn table_schema(&self, table: &str) -> Result<SchemaRef> {
        self.schemas.table_schema(table)
    }
}

/// Derive the private context of one compilation from the ambient one.
///
/// The copy gets a fresh query id plus the shard scalars requested by
/// `options`. `ambient` is left untouched.
pub fn build_compilation_context(
    ambient: &ExecutionContext,
    options: &CompilationOptions,
) -> Result<ExecutionContext> {
    let mut context = ambient.clone();
    context.query_id = QueryId::next();
    if let Some(shard_num) = options.shard_num {
        context.add_special_scalar(ScalarBinding::uint32(SHARD_NUM_SCALAR, shard_num)?);
    }
    if let Some(shard_count) = options.shard_count {
        context.add_special_scalar(ScalarBinding::uint32(SHARD_COUNT_SCALAR, shard_count)?);
    }
    debug!(
        query_id = %context.query_id,
        shard_num = ?options.shard_num,
        shard_count = ?options.shard_count,
        "compilation context built"
    );
    Ok(context)
}

/// Provider with no tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySchemaProvider;

impl SchemaProvider for EmptySchemaProvider {
    fn table_schema(&self, table: &str) -> Result<SchemaRef> {
        Err(QuarryError::Planning(format!("unknown table: {table}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_scalars_are_bound_on_the_copy_only() {
        let ambient = ExecutionContext::empty();
        let options = CompilationOptions::default().with_shard(3, 8);
        let context = build_compilation_context(&ambient, &options).expect("context");

        let num = context.scalar(SHARD_NUM_SCALAR).expect("shard num");
        assert_eq!(num.data_type(), &DataType::UInt32);
        assert_eq!(num.value().expect("value"), LiteralValue::UInt32(3));
        let count = context.scalar(SHARD_COUNT_SCALAR).expect("shard count");
        assert_eq!(count.value().expect("value"), LiteralValue::UInt32(8));
        assert_eq!(count.block().num_rows(), 1);

        assert!(ambient.scalar(SHARD_NUM_SCALAR).is_none());
        assert!(ambient.scalar(SHARD_COUNT_SCALAR).is_none());
        assert_ne!(ambient.query_id(), context.query_id());
    }

    #[test]
    fn only_requested_shard_scalars_are_bound() {
        let ambient = ExecutionContext::empty();
        let mut options = CompilationOptions::default();
        options.shard_count = Some(4);
        let context = build_compilation_context(&ambient, &options).expect("context");
        assert!(context.scalar(SHARD_NUM_SCALAR).is_none());
        assert!(context.scalar(SHARD_COUNT_SCALAR).is_some());
    }

    #[test]
    fn binding_rejects_multi_row_blocks() {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let block = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))])
            .expect("batch");
        assert!(matches!(
            ScalarBinding::new("x", block),
            Err(QuarryError::Planning(_))
        ));
    }

    #[test]
    fn copy_does_not_share_settings() {
        let ambient = ExecutionContext::empty();
        let mut context =
            build_compilation_context(&ambient, &CompilationOptions::default()).expect("context");
        context.settings_mut().max_threads = 1;
        assert_eq!(ambient.settings().max_threads, Settings::default().max_threads);
    }
}
