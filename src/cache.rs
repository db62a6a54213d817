use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::instance::Instance;
use crate::querier::Querier;

const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Dynamic field names observed in the `fields_string` / `fields_number`
/// map columns. Grows monotonically: merging never drops a name already
/// known, even when the name didn't appear in the latest scan window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    pub string: Vec<String>,
    pub number: Vec<String>,
}

impl Fields {
    pub fn merge(&mut self, other: Fields) {
        for name in other.string {
            if !self.string.contains(&name) {
                self.string.push(name);
            }
        }
        for name in other.number {
            if !self.number.contains(&name) {
                self.number.push(name);
            }
        }
    }
}

/// Discover all dynamic field names used in the last hour of data.
pub async fn fetch_fields(querier: &dyn Querier, database: &str) -> Result<Fields, Error> {
    Ok(Fields {
        string: fetch_field_names(querier, database, "string").await?,
        number: fetch_field_names(querier, database, "number").await?,
    })
}

async fn fetch_field_names(
    querier: &dyn Querier,
    database: &str,
    field_type: &str,
) -> Result<Vec<String>, Error> {
    let sql = format!(
        "SELECT DISTINCT arrayJoin(mapKeys(fields_{field_type})) FROM {database}.logs WHERE timestamp BETWEEN now() - 3600 AND now() SETTINGS skip_unavailable_shards = 1"
    );
    let result = querier.query(&sql).await?;

    let mut names = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let name = row
            .first()
            .and_then(|value| value.as_str())
            .ok_or_else(|| Error::Decode(format!("field name row: expected a string, got {row:?}")))?;
        names.push(name.to_string());
    }
    Ok(names)
}

/// Start the per-instance refresh task: an eager bootstrap fetch that
/// replaces the cache outright, then a merge every 24 hours. Runs until the
/// process exits; a failed fetch keeps the previous cache.
pub fn spawn_field_refresh(instance: Arc<Instance>) {
    tokio::spawn(async move {
        match fetch_fields(instance.querier.as_ref(), &instance.database).await {
            Ok(fields) => {
                instance.replace_cached_fields(fields).await;
                tracing::info!("field cache for {} bootstrapped", instance.name());
            }
            Err(err) => {
                tracing::warn!("initial field fetch for {} failed: {err}", instance.name());
            }
        }

        loop {
            tokio::time::sleep(REFRESH_INTERVAL).await;
            match fetch_fields(instance.querier.as_ref(), &instance.database).await {
                Ok(fields) => instance.merge_cached_fields(fields).await,
                Err(err) => {
                    tracing::warn!(
                        "field refresh for {} failed, keeping cached names: {err}",
                        instance.name()
                    );
                }
            }
        }
    });
}

impl Instance {
    /// Look up known field names by substring. String lookups always include
    /// the physical columns so they stay discoverable regardless of the
    /// filter; number lookups return map fields only.
    pub async fn get_fields(&self, filter: &str, field_type: &str) -> Vec<String> {
        let cached = self.cached_fields.read().await;
        let mut fields = Vec::new();

        if field_type == "string" || field_type.is_empty() {
            fields.extend(
                cached
                    .string
                    .iter()
                    .filter(|name| name.contains(filter))
                    .cloned(),
            );
            fields.extend(self.default_fields.iter().cloned());
        }
        if field_type == "number" || field_type.is_empty() {
            fields.extend(
                cached
                    .number
                    .iter()
                    .filter(|name| name.contains(filter))
                    .cloned(),
            );
        }
        fields
    }

    pub(crate) async fn replace_cached_fields(&self, fields: Fields) {
        *self.cached_fields.write().await = fields;
    }

    pub(crate) async fn merge_cached_fields(&self, fields: Fields) {
        self.cached_fields.write().await.merge(fields);
    }
}
