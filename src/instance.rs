use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::cache::Fields;
use crate::config::InstanceConfig;
use crate::error::Error;
use crate::fields::{FieldUsage, generate_field_name};
use crate::querier::{HttpQuerier, Querier};

/// The always-physical log columns, in table order.
pub const DEFAULT_FIELDS: [&str; 8] = [
    "timestamp",
    "cluster",
    "namespace",
    "app",
    "pod_name",
    "container_name",
    "host",
    "log",
];

/// Contract of the external filter parser: turns a user-typed filter string
/// (e.g. `namespace = 'foo' _AND_ container_name = 'bar'`) into a
/// ready-to-embed SQL boolean expression, mapping `=~` to `ILIKE` and
/// `_AND_` to `AND`. The engine never evaluates the filter language itself.
pub trait FilterCompiler: Send + Sync {
    fn compile(
        &self,
        query: &str,
        default_fields: &[String],
        materialized_columns: &[String],
    ) -> Result<String, Error>;
}

/// Passthrough compiler for callers that already hold a SQL condition.
pub struct RawFilter;

impl FilterCompiler for RawFilter {
    fn compile(
        &self,
        query: &str,
        _default_fields: &[String],
        _materialized_columns: &[String],
    ) -> Result<String, Error> {
        Ok(query.trim().to_string())
    }
}

/// One configured ClickHouse-backed log source. Created once at startup and
/// shared for the process lifetime; only the field-refresh task writes to it.
pub struct Instance {
    pub(crate) name: String,
    pub(crate) database: String,
    /// Default fields merged with the configured materialized columns: the
    /// full set of physical columns.
    pub(crate) default_fields: Vec<String>,
    pub(crate) materialized_columns: Vec<String>,
    pub(crate) cached_fields: RwLock<Fields>,
    pub(crate) field_usage: FieldUsage,
    pub(crate) compiler: Arc<dyn FilterCompiler>,
    pub(crate) querier: Arc<dyn Querier>,
}

impl Instance {
    /// Build an instance against a live ClickHouse and start its field
    /// refresh task. Must be called from within a tokio runtime.
    pub fn new(
        config: &InstanceConfig,
        compiler: Arc<dyn FilterCompiler>,
    ) -> Result<Arc<Self>, Error> {
        let querier = Arc::new(HttpQuerier::new(config)?);
        let instance = Self::with_querier(config, querier, compiler);
        crate::cache::spawn_field_refresh(instance.clone());
        Ok(instance)
    }

    /// Construction behind the querier seam; no refresh task is spawned, so
    /// this is also the entry point for tests and embedders that manage the
    /// refresh themselves (see `cache::spawn_field_refresh`).
    pub fn with_querier(
        config: &InstanceConfig,
        querier: Arc<dyn Querier>,
        compiler: Arc<dyn FilterCompiler>,
    ) -> Arc<Self> {
        let mut default_fields: Vec<String> =
            DEFAULT_FIELDS.iter().map(|field| field.to_string()).collect();
        default_fields.extend(config.materialized_columns.iter().cloned());

        Arc::new(Self {
            name: config.name.clone(),
            database: config.database.clone(),
            default_fields,
            materialized_columns: config.materialized_columns.clone(),
            cached_fields: RwLock::new(Fields::default()),
            field_usage: FieldUsage::default(),
            compiler,
            querier,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Escape hatch for plugin-to-plugin use: executes a literal SQL string
    /// unmodified and returns the result positionally.
    pub async fn get_raw_query_results(
        &self,
        query: &str,
    ) -> Result<(Vec<Vec<Value>>, Vec<String>), Error> {
        let result = self.querier.query(query).await?;
        Ok((result.rows, result.columns))
    }

    pub fn field_usage_snapshot(&self) -> HashMap<String, u64> {
        self.field_usage.snapshot()
    }

    /// Resolve a field name to its column expression, counting the lookup.
    pub(crate) fn field_name(&self, field: &str, must_number: bool) -> String {
        self.field_usage.record(field);
        generate_field_name(field, &self.default_fields, must_number)
    }

    pub(crate) fn compile_filter(&self, query: &str) -> Result<String, Error> {
        if query.trim().is_empty() {
            return Ok(String::new());
        }
        self.compiler
            .compile(query, &self.default_fields, &self.materialized_columns)
    }
}
