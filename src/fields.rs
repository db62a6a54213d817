use std::collections::HashMap;
use std::sync::Mutex;

/// Map a user-facing field name to the ClickHouse column expression.
///
/// Physical columns (default fields plus materialized columns, merged by the
/// instance) pass through verbatim. Every other name is a dynamic field and
/// is addressed through the map columns, typed by `must_number`; string is
/// the default typing for unrecognized fields.
pub fn generate_field_name(field: &str, default_fields: &[String], must_number: bool) -> String {
    if default_fields.iter().any(|default| default == field) {
        return field.to_string();
    }
    if must_number {
        format!("fields_number['{field}']")
    } else {
        format!("fields_string['{field}']")
    }
}

/// Build an ORDER BY fragment from a sort request.
///
/// A dynamic field's type is unknown at order time, so both typed projections
/// are emitted and the store sorts by whichever map actually holds the key.
pub fn parse_order(
    order: &str,
    order_by: &str,
    default_fields: &[String],
    materialized_columns: &[String],
) -> String {
    if order.is_empty() || order_by.is_empty() {
        return "timestamp DESC".to_string();
    }

    let direction = if order == "ascending" { "ASC" } else { "DESC" };

    if default_fields.iter().any(|field| field == order_by)
        || materialized_columns.iter().any(|column| column == order_by)
    {
        return format!("{order_by} {direction}");
    }

    format!("fields_string['{order_by}'] {direction}, fields_number['{order_by}'] {direction}")
}

/// Time-range condition shared by every generated query, with the compiled
/// filter appended in parentheses when one is present.
pub(crate) fn build_where_clause(time_start: i64, time_end: i64, condition: &str) -> String {
    let time_filter =
        format!("timestamp BETWEEN FROM_UNIXTIME({time_start}) AND FROM_UNIXTIME({time_end})");
    if condition.is_empty() {
        time_filter
    } else {
        format!("{time_filter} AND ({condition})")
    }
}

/// Per-field resolution counters. Observability only: nothing decides on
/// these, they exist so operators can see which fields users actually query.
#[derive(Debug, Default)]
pub struct FieldUsage {
    counts: Mutex<HashMap<String, u64>>,
}

impl FieldUsage {
    pub fn record(&self, field: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(field.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
