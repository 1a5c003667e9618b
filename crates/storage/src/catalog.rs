use arrow_schema::{Schema, SchemaRef};
use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

/// Table definition resolved by name during query tree construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub format: String,
    pub schema: Schema,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, format: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            schema,
            options: HashMap::new(),
        }
    }

    pub fn schema_ref(&self) -> SchemaRef {
        Arc::new(self.schema.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: HashMap<String, TableDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    pub fn register_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn get(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| QuarryError::Planning(format!("unknown table: {name}")))
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        let mut names = self.tables.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let tables: Vec<TableDef> =
            serde_json::from_str(s).map_err(|e| QuarryError::InvalidConfig(e.to_string()))?;
        let mut cat = Catalog::new();
        for t in tables {
            cat.register_table(t);
        }
        Ok(cat)
    }
}
