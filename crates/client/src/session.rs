use std::sync::{Arc, RwLock};

use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Quota, QuotaLimits, Result, Settings};
use quarry_planner::{ExecutionContext, SchemaProvider};
use quarry_storage::Catalog;

use crate::interpreter::CompilerComponents;

pub type SharedSession = Arc<Session>;

/// Session state every compilation starts from.
#[derive(Debug)]
pub struct Session {
    pub settings: Settings,
    pub catalog: RwLock<Catalog>,
    pub quota: Arc<Quota>,
    pub components: CompilerComponents,
}

impl Session {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let quota = Quota::new(
            "session",
            QuotaLimits {
                max_result_rows: settings.max_result_rows,
                max_result_bytes: settings.max_result_bytes,
            },
        );
        Ok(Self {
            settings,
            catalog: RwLock::new(Catalog::new()),
            quota,
            components: CompilerComponents::default(),
        })
    }

    /// Ambient context over a snapshot of the current catalog.
    pub fn ambient_context(&self) -> Result<ExecutionContext> {
        let catalog = self
            .catalog
            .read()
            .map_err(|_| QuarryError::Execution("catalog lock poisoned".to_string()))?
            .clone();
        Ok(
            ExecutionContext::new(self.settings.clone(), Arc::new(CatalogSnapshot(catalog)))
                .with_quota(Arc::clone(&self.quota)),
        )
    }
}

struct CatalogSnapshot(Catalog);

impl SchemaProvider for CatalogSnapshot {
    fn table_schema(&self, table: &str) -> Result<SchemaRef> {
        Ok(self.0.get(table)?.schema_ref())
    }
}
