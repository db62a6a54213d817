use serde::Deserialize;

use crate::error::Error;
use crate::fields::build_where_clause;
use crate::instance::Instance;
use crate::logs::Document;

/// Operations accepted for `size_by_operation` and `vertical_axis_operation`.
const OPERATIONS: [&str; 5] = ["count", "min", "max", "sum", "avg"];

/// A chart-shaped aggregation request. Only the options relevant to `chart`
/// are validated; the rest are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Aggregation {
    #[serde(default)]
    pub query: String,
    pub chart: String,
    pub times: AggregationTimes,
    #[serde(default)]
    pub options: AggregationOptions,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AggregationTimes {
    pub time_start: i64,
    pub time_end: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AggregationOptions {
    pub slice_by: String,
    pub size_by_operation: String,
    pub horizontal_axis_field: String,
    /// `top` / `bottom` order the aggregate column; empty leaves the store
    /// order.
    pub horizontal_axis_operation: String,
    /// Row cap applied together with a top/bottom ordering; 0 means no cap.
    pub horizontal_axis_limit: i64,
    pub vertical_axis_field: String,
    pub vertical_axis_operation: String,
    pub break_down_by_fields: Vec<String>,
    pub break_down_by_filters: Vec<String>,
}

/// Generically decoded aggregation rows plus the column list, in query order.
#[derive(Debug)]
pub struct AggregationResult {
    pub rows: Vec<Document>,
    pub columns: Vec<String>,
}

pub(crate) fn validate(aggregation: &Aggregation) -> Result<(), Error> {
    let options = &aggregation.options;
    match aggregation.chart.as_str() {
        "pie" => {
            if options.slice_by.is_empty() {
                return Err(Error::MissingSliceBy);
            }
            if !OPERATIONS.contains(&options.size_by_operation.as_str()) {
                return Err(Error::InvalidSizeByOperation);
            }
        }
        "bar" => {
            if options.horizontal_axis_field.is_empty() {
                return Err(Error::MissingHorizontalAxisField);
            }
            validate_vertical_axis(options)?;
        }
        "area" => {
            // The horizontal axis is the time bucket expression.
            validate_vertical_axis(options)?;
        }
        _ => return Err(Error::InvalidChartType),
    }

    if aggregation.times.time_end <= aggregation.times.time_start {
        return Err(Error::InvalidTimeRange);
    }
    Ok(())
}

fn validate_vertical_axis(options: &AggregationOptions) -> Result<(), Error> {
    if !OPERATIONS.contains(&options.vertical_axis_operation.as_str()) {
        return Err(Error::InvalidVerticalAxisOperation);
    }
    if options.vertical_axis_operation != "count" && options.vertical_axis_field.is_empty() {
        return Err(Error::MissingVerticalAxisField);
    }
    Ok(())
}

impl Instance {
    /// Compile and run one chart aggregation.
    pub async fn get_aggregation(
        &self,
        aggregation: &Aggregation,
    ) -> Result<AggregationResult, Error> {
        validate(aggregation)?;

        let condition = self.compile_filter(&aggregation.query)?;
        let sql = match aggregation.chart.as_str() {
            "pie" => self.build_pie_sql(aggregation, &condition),
            _ => self.build_axis_sql(aggregation, &condition)?,
        };
        tracing::debug!("aggregation query: {sql}");

        let result = self.querier.query(&sql).await?;
        let mut rows = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            if row.len() != result.columns.len() {
                return Err(Error::Decode(format!(
                    "aggregation row has {} values, expected {}",
                    row.len(),
                    result.columns.len()
                )));
            }
            let mut document = Document::new();
            for (column, value) in result.columns.iter().zip(row) {
                document.insert(column.clone(), value.clone());
            }
            rows.push(document);
        }
        Ok(AggregationResult { rows, columns: result.columns })
    }

    fn build_pie_sql(&self, aggregation: &Aggregation, condition: &str) -> String {
        let options = &aggregation.options;
        let slice_by = self.field_name(&options.slice_by, false);
        let where_clause = build_where_clause(
            aggregation.times.time_start,
            aggregation.times.time_end,
            condition,
        );
        format!(
            "SELECT {slice_by}, {}({slice_by}) as count_data FROM {}.logs WHERE {where_clause} GROUP BY {slice_by}{} SETTINGS skip_unavailable_shards = 1",
            options.size_by_operation,
            self.database,
            order_and_limit(options)
        )
    }

    fn build_axis_sql(&self, aggregation: &Aggregation, condition: &str) -> Result<String, Error> {
        let options = &aggregation.options;

        let (horizontal_select, horizontal_group, order_clause) =
            if aggregation.chart == "area" {
                let interval =
                    ((aggregation.times.time_end - aggregation.times.time_start) / 30).max(1);
                (
                    format!("toStartOfInterval(timestamp, INTERVAL {interval} second) AS time"),
                    "time".to_string(),
                    " ORDER BY time".to_string(),
                )
            } else {
                let field = self.field_name(&options.horizontal_axis_field, false);
                (field.clone(), field, order_and_limit(options))
            };

        let mut select_parts = vec![horizontal_select];
        let mut group_parts = vec![horizontal_group];
        for field in &options.break_down_by_fields {
            let expression = self.field_name(field, false);
            select_parts.push(expression.clone());
            group_parts.push(expression);
        }

        let operation = options.vertical_axis_operation.as_str();
        if options.break_down_by_filters.is_empty() {
            select_parts.push(self.plain_aggregate(operation, &options.vertical_axis_field));
        } else {
            for (index, filter) in options.break_down_by_filters.iter().enumerate() {
                let break_down_condition = self.compiler.compile(
                    filter,
                    &self.default_fields,
                    &self.materialized_columns,
                )?;
                select_parts.push(self.conditional_aggregate(
                    operation,
                    &options.vertical_axis_field,
                    &break_down_condition,
                    index,
                ));
            }
        }

        let where_clause = build_where_clause(
            aggregation.times.time_start,
            aggregation.times.time_end,
            condition,
        );
        Ok(format!(
            "SELECT {} FROM {}.logs WHERE {where_clause} GROUP BY {}{order_clause} SETTINGS skip_unavailable_shards = 1",
            select_parts.join(", "),
            self.database,
            group_parts.join(", ")
        ))
    }

    fn plain_aggregate(&self, operation: &str, field: &str) -> String {
        if operation == "count" {
            return "count(*) as count_data".to_string();
        }
        format!("{operation}({}) as {operation}_data", self.field_name(field, true))
    }

    fn conditional_aggregate(
        &self,
        operation: &str,
        field: &str,
        condition: &str,
        index: usize,
    ) -> String {
        if operation == "count" {
            return format!("countIf({condition}) as count_data_filter{index}");
        }
        format!(
            "{operation}If({}, {condition}) as {operation}_data_filter{index}",
            self.field_name(field, true)
        )
    }
}

fn order_and_limit(options: &AggregationOptions) -> String {
    let direction = match options.horizontal_axis_operation.as_str() {
        "top" => "DESC",
        "bottom" => "ASC",
        _ => return String::new(),
    };
    let mut clause = format!(" ORDER BY count_data {direction}");
    if options.horizontal_axis_limit > 0 {
        clause.push_str(&format!(" LIMIT {}", options.horizontal_axis_limit));
    }
    clause
}
