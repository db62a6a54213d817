use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::fields::{build_where_clause, parse_order};
use crate::instance::Instance;
use crate::querier::RowSet;

/// One returned log record, flattened: fixed columns keyed by their public
/// name, dynamic map fields merged in afterwards.
pub type Document = serde_json::Map<String, Value>;

/// One histogram cell: bucket start (unix seconds) and row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub interval: i64,
    pub count: i64,
}

/// Result of one log page retrieval.
#[derive(Debug, Serialize)]
pub struct LogResult {
    pub documents: Vec<Document>,
    pub fields: Vec<String>,
    pub count: i64,
    pub took: i64,
    pub buckets: Vec<Bucket>,
}

/// The full physical + map column list selected for log rows.
const LOG_COLUMNS: &str =
    "timestamp, cluster, namespace, app, pod_name, container_name, host, fields_string, fields_number, log";

impl Instance {
    /// Retrieve one page of matching log rows plus the 30-bucket histogram
    /// over the requested range.
    ///
    /// When the rows are ordered by the physical timestamp column the scan
    /// is narrowed to the histogram buckets needed to fill `limit` rows,
    /// walked from the end matching the requested order; any other ordering
    /// scans the full range.
    pub async fn get_logs(
        &self,
        query: &str,
        order: &str,
        order_by: &str,
        limit: i64,
        time_start: i64,
        time_end: i64,
    ) -> Result<LogResult, Error> {
        if time_end <= time_start {
            return Err(Error::InvalidTimeRange);
        }

        let condition = self.compile_filter(query)?;
        let interval = ((time_end - time_start) / 30).max(1);
        let where_clause = build_where_clause(time_start, time_end, &condition);

        let histogram_sql = format!(
            "SELECT toUnixTimestamp(toStartOfInterval(timestamp, INTERVAL {interval} second)) AS interval_data, count(*) AS count_data FROM {}.logs WHERE {where_clause} GROUP BY interval_data ORDER BY interval_data SETTINGS skip_unavailable_shards = 1",
            self.database
        );
        tracing::debug!("histogram query: {histogram_sql}");
        let buckets = parse_buckets(&self.querier.query(&histogram_sql).await?)?;
        let count: i64 = buckets.iter().map(|bucket| bucket.count).sum();

        if count == 0 {
            return Ok(LogResult {
                documents: Vec::new(),
                fields: Vec::new(),
                count: 0,
                took: 0,
                buckets,
            });
        }

        let rows_sql = if order_by.is_empty() || order_by == "timestamp" {
            // Fast path: the requested order matches the physical sort key,
            // so only the buckets needed to fill the page are scanned.
            let ascending = order == "ascending";
            let direction = if ascending { "ASC" } else { "DESC" };
            let windows =
                select_bucket_windows(&buckets, interval, time_start, time_end, limit, ascending);
            let scan_range = windows
                .iter()
                .map(|(start, end)| {
                    format!("(timestamp BETWEEN FROM_UNIXTIME({start}) AND FROM_UNIXTIME({end}))")
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            let filter = if condition.is_empty() {
                format!("({scan_range})")
            } else {
                format!("({scan_range}) AND ({condition})")
            };
            format!(
                "SELECT {LOG_COLUMNS} FROM {}.logs WHERE {filter} ORDER BY timestamp {direction} LIMIT {limit} SETTINGS skip_unavailable_shards = 1",
                self.database
            )
        } else {
            let parsed_order =
                parse_order(order, order_by, &self.default_fields, &self.materialized_columns);
            format!(
                "SELECT {LOG_COLUMNS} FROM {}.logs WHERE {where_clause} ORDER BY {parsed_order} LIMIT {limit} SETTINGS skip_unavailable_shards = 1",
                self.database
            )
        };

        tracing::debug!("log query: {rows_sql}");
        let result = self.querier.query(&rows_sql).await?;
        let (documents, fields) = decode_documents(&result, order_by)?;

        Ok(LogResult {
            documents,
            fields,
            count,
            took: 0,
            buckets,
        })
    }
}

/// Pick the bucket windows needed to fill `limit` rows, walking the
/// non-empty buckets from the end matching the requested order. Windows are
/// emitted with the one walked last first; the order is deterministic but
/// carries no meaning beyond that.
fn select_bucket_windows(
    buckets: &[Bucket],
    interval: i64,
    time_start: i64,
    time_end: i64,
    limit: i64,
    ascending: bool,
) -> Vec<(i64, i64)> {
    let walk: Vec<&Bucket> = if ascending {
        buckets.iter().collect()
    } else {
        buckets.iter().rev().collect()
    };

    let mut windows = Vec::new();
    let mut accumulated: i64 = 0;
    for bucket in walk {
        if bucket.count == 0 {
            continue;
        }
        windows.push(get_bucket_times(interval, bucket.interval, time_start, time_end));
        accumulated += bucket.count;
        if accumulated >= limit {
            break;
        }
    }
    windows.reverse();
    windows
}

/// Clip one bucket to the global time range.
fn get_bucket_times(interval: i64, bucket_time: i64, time_start: i64, time_end: i64) -> (i64, i64) {
    if bucket_time < time_start {
        return (time_start, time_start + interval - (time_start - bucket_time));
    }
    if bucket_time + interval > time_end {
        return (bucket_time, time_end);
    }
    (bucket_time, bucket_time + interval)
}

fn parse_buckets(result: &RowSet) -> Result<Vec<Bucket>, Error> {
    let mut buckets = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let interval = row
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Decode(format!("bucket row: bad interval in {row:?}")))?;
        let count = row
            .get(1)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Decode(format!("bucket row: bad count in {row:?}")))?;
        buckets.push(Bucket { interval, count });
    }
    Ok(buckets)
}

/// Decode log rows into flattened documents. Fixed columns are inserted
/// under their public names first; map entries only fill keys that are
/// still free, so a dynamic field can never shadow a fixed one. Returns the
/// documents and the sorted distinct dynamic field names observed, with the
/// requested order-by field included when it names anything beyond the
/// timestamp column.
fn decode_documents(
    result: &RowSet,
    order_by: &str,
) -> Result<(Vec<Document>, Vec<String>), Error> {
    let mut documents = Vec::with_capacity(result.rows.len());
    let mut dynamic_fields: BTreeSet<String> = BTreeSet::new();

    for row in &result.rows {
        if row.len() != result.columns.len() {
            return Err(Error::Decode(format!(
                "log row has {} values, expected {}",
                row.len(),
                result.columns.len()
            )));
        }

        let mut document = Document::new();
        let mut maps = Vec::new();
        for (column, value) in result.columns.iter().zip(row) {
            if column == "fields_string" || column == "fields_number" {
                let entries = value.as_object().ok_or_else(|| {
                    Error::Decode(format!("column {column}: expected a map, got {value}"))
                })?;
                maps.push(entries);
            } else {
                document.insert(column.clone(), value.clone());
            }
        }

        for entries in maps {
            for (key, value) in entries {
                dynamic_fields.insert(key.clone());
                if !document.contains_key(key) {
                    document.insert(key.clone(), value.clone());
                }
            }
        }
        documents.push(document);
    }

    let mut fields: Vec<String> = dynamic_fields.into_iter().collect();
    if !order_by.is_empty()
        && order_by != "timestamp"
        && !fields.iter().any(|field| field == order_by)
    {
        fields.push(order_by.to_string());
        fields.sort();
    }
    Ok((documents, fields))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::instance::testutil::test_instance;
    use crate::querier::mock::{MockQuerier, row_set};

    const T0: i64 = 1640995200; // 2022-01-01 00:00:00 UTC

    fn histogram(buckets: &[(i64, i64)]) -> RowSet {
        row_set(
            &["interval_data", "count_data"],
            buckets
                .iter()
                .map(|(interval, count)| vec![json!(interval), json!(count)])
                .collect(),
        )
    }

    fn log_rows(rows: Vec<Vec<Value>>) -> RowSet {
        row_set(
            &[
                "timestamp",
                "cluster",
                "namespace",
                "app",
                "pod_name",
                "container_name",
                "host",
                "fields_string",
                "fields_number",
                "log",
            ],
            rows,
        )
    }

    fn sample_row() -> Vec<Value> {
        vec![
            json!("2022-01-01 00:00:10"),
            json!("dev"),
            json!("kube-system"),
            json!("coredns"),
            json!("coredns-0"),
            json!("coredns"),
            json!("node-1"),
            json!({"foo": "bar"}),
            json!({"content_duration": 0.25}),
            json!("request served"),
        ]
    }

    #[test]
    fn bucket_times_clip_to_the_global_range() {
        // First bucket starts before the range.
        assert_eq!(get_bucket_times(30, 90, 100, 1000), (100, 120));
        // Last bucket overflows the range.
        assert_eq!(get_bucket_times(30, 990, 100, 1000), (990, 1000));
        // Fully inside.
        assert_eq!(get_bucket_times(30, 500, 100, 1000), (500, 530));
    }

    #[test]
    fn bucket_times_are_idempotent_under_reclipping() {
        for bucket_time in [90, 500, 990] {
            let (start, end) = get_bucket_times(30, bucket_time, 100, 1000);
            assert!(start >= 100 && end <= 1000);
            let reclipped = get_bucket_times(end - start, start, 100, 1000);
            assert_eq!(reclipped, (start, end));
        }
    }

    #[test]
    fn window_walk_descending_emits_last_walked_first() {
        let buckets = [
            Bucket { interval: T0, count: 5 },
            Bucket { interval: T0 + 30, count: 0 },
            Bucket { interval: T0 + 60, count: 3 },
        ];
        // Descending: bucket T0+60 first (3 rows), not enough for 5, then T0.
        let windows = select_bucket_windows(&buckets, 30, T0, T0 + 900, 5, false);
        assert_eq!(windows, vec![(T0, T0 + 30), (T0 + 60, T0 + 90)]);
    }

    #[test]
    fn window_walk_stops_once_the_limit_is_covered() {
        let buckets = [
            Bucket { interval: T0, count: 5 },
            Bucket { interval: T0 + 30, count: 7 },
            Bucket { interval: T0 + 60, count: 3 },
        ];
        let windows = select_bucket_windows(&buckets, 30, T0, T0 + 900, 10, false);
        // 3 + 7 covers the limit; the oldest bucket is never consulted.
        assert_eq!(windows, vec![(T0 + 30, T0 + 60), (T0 + 60, T0 + 90)]);

        let ascending = select_bucket_windows(&buckets, 30, T0, T0 + 900, 10, true);
        // 5 + 7 covers the limit walking from the oldest end.
        assert_eq!(ascending, vec![(T0 + 30, T0 + 60), (T0, T0 + 30)]);
    }

    #[tokio::test]
    async fn fast_path_scans_only_the_buckets_needed() {
        let querier = MockQuerier::new()
            .respond(histogram(&[(T0, 5), (T0 + 60, 3)]))
            .respond(log_rows(vec![sample_row()]));
        let (instance, querier) = test_instance(querier);

        let result = instance
            .get_logs("namespace = 'kube-system'", "descending", "timestamp", 5, T0, T0 + 900)
            .await
            .unwrap();

        assert_eq!(result.count, 8);
        assert_eq!(
            result.buckets,
            vec![
                Bucket { interval: T0, count: 5 },
                Bucket { interval: T0 + 60, count: 3 }
            ]
        );

        let queries = querier.queries();
        assert_eq!(
            queries[0],
            format!(
                "SELECT toUnixTimestamp(toStartOfInterval(timestamp, INTERVAL 30 second)) AS interval_data, count(*) AS count_data FROM logs.logs WHERE timestamp BETWEEN FROM_UNIXTIME({}) AND FROM_UNIXTIME({}) AND (namespace = 'kube-system') GROUP BY interval_data ORDER BY interval_data SETTINGS skip_unavailable_shards = 1",
                T0,
                T0 + 900
            )
        );
        // The empty middle of the range is never scanned: only the two
        // non-empty buckets appear, clipped, last-walked first.
        assert_eq!(
            queries[1],
            format!(
                "SELECT {LOG_COLUMNS} FROM logs.logs WHERE ((timestamp BETWEEN FROM_UNIXTIME({}) AND FROM_UNIXTIME({})) OR (timestamp BETWEEN FROM_UNIXTIME({}) AND FROM_UNIXTIME({}))) AND (namespace = 'kube-system') ORDER BY timestamp DESC LIMIT 5 SETTINGS skip_unavailable_shards = 1",
                T0,
                T0 + 30,
                T0 + 60,
                T0 + 90
            )
        );
    }

    #[tokio::test]
    async fn fast_path_ascending_orders_ascending() {
        let querier = MockQuerier::new()
            .respond(histogram(&[(T0, 2)]))
            .respond(log_rows(vec![sample_row()]));
        let (instance, querier) = test_instance(querier);

        instance.get_logs("", "ascending", "", 100, T0, T0 + 900).await.unwrap();

        let queries = querier.queries();
        assert_eq!(
            queries[1],
            format!(
                "SELECT {LOG_COLUMNS} FROM logs.logs WHERE ((timestamp BETWEEN FROM_UNIXTIME({}) AND FROM_UNIXTIME({}))) ORDER BY timestamp ASC LIMIT 100 SETTINGS skip_unavailable_shards = 1",
                T0,
                T0 + 30
            )
        );
    }

    #[tokio::test]
    async fn other_order_fields_scan_the_full_range() {
        let querier = MockQuerier::new()
            .respond(histogram(&[(T0, 2)]))
            .respond(log_rows(vec![sample_row()]));
        let (instance, querier) = test_instance(querier);

        let result = instance
            .get_logs("", "descending", "custom", 100, T0, T0 + 900)
            .await
            .unwrap();

        let queries = querier.queries();
        assert_eq!(
            queries[1],
            format!(
                "SELECT {LOG_COLUMNS} FROM logs.logs WHERE timestamp BETWEEN FROM_UNIXTIME({}) AND FROM_UNIXTIME({}) ORDER BY fields_string['custom'] DESC, fields_number['custom'] DESC LIMIT 100 SETTINGS skip_unavailable_shards = 1",
                T0,
                T0 + 900
            )
        );
        // The requested order-by field is reported even when no row carries it.
        assert!(result.fields.contains(&"custom".to_string()));
    }

    #[tokio::test]
    async fn documents_flatten_fixed_and_dynamic_fields() {
        let querier = MockQuerier::new()
            .respond(histogram(&[(T0, 1)]))
            .respond(log_rows(vec![sample_row()]));
        let (instance, _querier) = test_instance(querier);

        let result = instance.get_logs("", "", "", 100, T0, T0 + 900).await.unwrap();

        assert_eq!(result.documents.len(), 1);
        let document = &result.documents[0];
        assert_eq!(document["namespace"], json!("kube-system"));
        assert_eq!(document["foo"], json!("bar"));
        assert_eq!(document["content_duration"], json!(0.25));
        assert_eq!(document["log"], json!("request served"));

        assert_eq!(result.fields, vec!["content_duration", "foo"]);
        assert_eq!(result.took, 0);
    }

    #[tokio::test]
    async fn dynamic_field_never_shadows_a_fixed_column() {
        let mut row = sample_row();
        row[7] = json!({"namespace": "spoofed"});
        let querier = MockQuerier::new()
            .respond(histogram(&[(T0, 1)]))
            .respond(log_rows(vec![row]));
        let (instance, _querier) = test_instance(querier);

        let result = instance.get_logs("", "", "", 100, T0, T0 + 900).await.unwrap();

        assert_eq!(result.documents[0]["namespace"], json!("kube-system"));
        // The colliding name still shows up as an observed dynamic field.
        assert!(result.fields.contains(&"namespace".to_string()));
    }

    #[tokio::test]
    async fn zero_matches_skip_the_row_query() {
        let querier = MockQuerier::new().respond(histogram(&[]));
        let (instance, querier) = test_instance(querier);

        let result = instance.get_logs("", "", "", 100, T0, T0 + 900).await.unwrap();

        assert_eq!(result.count, 0);
        assert!(result.documents.is_empty());
        assert!(result.buckets.is_empty());
        assert_eq!(querier.queries().len(), 1);
    }

    #[tokio::test]
    async fn rejects_an_inverted_time_range() {
        let (instance, _querier) = test_instance(MockQuerier::new());
        assert!(matches!(
            instance.get_logs("", "", "", 100, T0 + 900, T0).await,
            Err(Error::InvalidTimeRange)
        ));
    }
}
