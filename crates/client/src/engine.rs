use std::sync::Arc;

use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Quota, Result, Settings};
use quarry_planner::CompilationOptions;
use quarry_sql::parse_query;
use quarry_storage::{Catalog, TableDef};

use crate::interpreter::SelectQueryInterpreter;
use crate::session::{Session, SharedSession};

#[derive(Debug, Clone)]
pub struct Engine {
    session: SharedSession,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        let session = Arc::new(Session::new(settings)?);
        Ok(Self { session })
    }

    /// Register a table under a given name.
    /// We override `table.name` to avoid ambiguity.
    pub fn register_table(&self, name: impl Into<String>, mut table: TableDef) -> Result<()> {
        table.name = name.into();
        self.session
            .catalog
            .write()
            .map_err(|_| poisoned())?
            .register_table(table);
        Ok(())
    }

    /// Register every table of `catalog`.
    pub fn register_catalog(&self, catalog: &Catalog) -> Result<()> {
        for name in catalog.table_names() {
            self.register_table(name.clone(), catalog.get(&name)?.clone())?;
        }
        Ok(())
    }

    /// Start a compilation of `sql` against the current catalog.
    pub fn compile(&self, sql: &str, options: CompilationOptions) -> Result<SelectQueryInterpreter> {
        let ambient = self.session.ambient_context()?;
        SelectQueryInterpreter::with_components(
            parse_query(sql)?,
            &ambient,
            options,
            self.session.components.clone(),
        )
    }

    /// Output header of `sql`; never builds a pipeline.
    pub fn sample_block(&self, sql: &str, options: CompilationOptions) -> Result<SchemaRef> {
        let ambient = self.session.ambient_context()?;
        SelectQueryInterpreter::sample_block_with(
            parse_query(sql)?,
            &ambient,
            options,
            self.session.components.clone(),
        )
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .session
            .catalog
            .read()
            .map_err(|_| poisoned())?
            .table_names())
    }

    pub fn table_schema(&self, name: &str) -> Result<SchemaRef> {
        let cat = self.session.catalog.read().map_err(|_| poisoned())?;
        Ok(cat.get(name)?.schema_ref())
    }

    pub fn settings(&self) -> &Settings {
        &self.session.settings
    }

    pub fn quota(&self) -> Arc<Quota> {
        Arc::clone(&self.session.quota)
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Execution("catalog lock poisoned".to_string())
}
